//! Plugin side of the wire contract
//!
//! A binary becomes a plugin by handing its [`Driver`] to [`Server`] and
//! calling [`Server::run`] from `main`. The server answers the `config`
//! subcommand, checks the handshake environment, announces a loopback
//! listener on stdout and serves the host's connection until it closes.

use crate::driver::{Driver, DriverConfig, DriverError, Reader, Request, Response};
use crate::error::HostError;
use crate::plugin::handshake::{Announcement, HandshakeConfig};
use crate::plugin::rpc::{framed, split_stream, Frame, LogLine};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Subcommand the host runs to learn which drivers a plugin serves.
pub const CONFIG_COMMAND: &str = "config";

type Outbox = mpsc::UnboundedSender<Frame>;

pub struct Server {
    driver: Arc<dyn Driver>,
    configs: Vec<DriverConfig>,
    logger: PluginLogger,
}

impl Server {
    pub fn new(driver: impl Driver) -> Self {
        Self {
            driver: Arc::new(driver),
            configs: Vec::new(),
            logger: PluginLogger::default(),
        }
    }

    pub fn config(mut self, config: DriverConfig) -> Self {
        self.configs.push(config);
        self
    }

    /// Share a logger the driver also holds.
    pub fn logger(mut self, logger: PluginLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Entry point for plugin binaries, reading the process arguments.
    pub async fn run(self) -> Result<(), HostError> {
        let mut args = std::env::args();
        let program = args.next().unwrap_or_default();
        match args.next().as_deref() {
            Some(CONFIG_COMMAND) => self.print_config(),
            _ => self.serve(&program).await,
        }
    }

    fn print_config(&self) -> Result<(), HostError> {
        println!("{}", serde_json::to_string(&self.configs)?);
        Ok(())
    }

    async fn serve(self, program: &str) -> Result<(), HostError> {
        let program = if program.is_empty() {
            std::env::current_exe()?
        } else {
            Path::new(program).to_path_buf()
        };
        let handshake = HandshakeConfig::for_executable(&program);
        handshake.verify_env()?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let announcement = Announcement::tcp(listener.local_addr()?);
        println!("{announcement}");

        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        drop(listener);
        tracing::debug!(%peer, "Host connected");

        serve_connection(self.driver, self.logger, stream).await;
        Ok(())
    }
}

/// Serve one host connection until it reaches EOF.
pub async fn serve_connection<S>(driver: Arc<dyn Driver>, logger: PluginLogger, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = split_stream(stream);
    let (mut lines, mut sink) = framed(read, write);
    let (outbox, mut queued) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = queued.recv().await {
            let line = match frame.encode() {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                tracing::debug!(error = %e, "Host connection lost");
                break;
            }
        }
    });

    let mut handlers = JoinSet::new();
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read from host");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed frame");
                continue;
            }
        };
        handlers.spawn(handle(
            driver.clone(),
            logger.clone(),
            outbox.clone(),
            frame,
        ));
        // reap finished handlers
        while handlers.try_join_next().is_some() {}
    }

    handlers.abort_all();
    while handlers.join_next().await.is_some() {}
    logger.unsubscribe_all();
    drop(outbox);
    let _ = writer.await;
}

async fn handle(driver: Arc<dyn Driver>, logger: PluginLogger, outbox: Outbox, frame: Frame) {
    let (Some(id), Some(method)) = (frame.id, frame.method) else {
        return;
    };

    match method.as_str() {
        "ping" => {
            let _ = outbox.send(Frame::reply(id, json!({})));
        }
        "stdout" | "stderr" => {
            let name = frame
                .params
                .as_ref()
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            logger.subscribe(&method, name, outbox.clone());
            let _ = outbox.send(Frame::reply(id, json!({})));
        }
        _ => {
            let envelope = json!({
                "method": method,
                "params": frame.params.unwrap_or_else(|| json!({})),
            });
            match serde_json::from_value::<Request>(envelope) {
                Ok(request) => execute(driver.as_ref(), &outbox, id, request).await,
                Err(e) => {
                    let _ = outbox.send(Frame::failure(id, format!("{method}: {e}")));
                }
            }
        }
    }
}

async fn execute(driver: &dyn Driver, outbox: &Outbox, id: u64, request: Request) {
    match request.execute(driver).await {
        Response::Stream(output) => open_stream(outbox, id, output.error, output.reader).await,
        Response::SubscriptionListen(output) => {
            open_stream(outbox, id, output.error, output.reader).await
        }
        response => {
            let frame = match response.encode() {
                Some(Ok(result)) => Frame::reply(id, result),
                Some(Err(e)) => Frame::failure(id, e.to_string()),
                None => Frame::failure(id, "unsupported response"),
            };
            let _ = outbox.send(frame);
        }
    }
}

async fn open_stream<T: Serialize>(
    outbox: &Outbox,
    id: u64,
    error: Option<DriverError>,
    reader: Option<Reader<T>>,
) {
    let ack = json!({ "error": error });
    if outbox.send(Frame::reply(id, ack)).is_err() || error.is_some() {
        return;
    }
    let Some(mut reader) = reader else {
        let _ = outbox.send(Frame::end(id, None));
        return;
    };

    let mut failure = None;
    while let Some(item) = reader.next().await {
        let item = item.and_then(|item| {
            serde_json::to_value(item).map_err(|e| DriverError::new(e.to_string()))
        });
        match item {
            Ok(value) => {
                if outbox.send(Frame::item(id, value)).is_err() {
                    return;
                }
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    let _ = outbox.send(Frame::end(id, failure));
}

/// Forwards a plugin's own log lines to the host once it subscribes.
///
/// Before that, lines go to the process's stdout and stderr, which the
/// host also captures.
#[derive(Clone, Default)]
pub struct PluginLogger {
    subscribers: Arc<RwLock<HashMap<String, (String, Outbox)>>>,
}

impl PluginLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(&self, line: impl Into<String>) {
        self.emit("stdout", line.into());
    }

    pub fn stderr(&self, line: impl Into<String>) {
        self.emit("stderr", line.into());
    }

    pub fn is_subscribed(&self, stream: &str) -> bool {
        self.subscribers
            .read()
            .map(|subs| subs.contains_key(stream))
            .unwrap_or(false)
    }

    fn subscribe(&self, stream: &str, name: String, outbox: Outbox) {
        if let Ok(mut subs) = self.subscribers.write() {
            subs.insert(stream.to_string(), (name, outbox));
        }
    }

    fn unsubscribe_all(&self) {
        if let Ok(mut subs) = self.subscribers.write() {
            subs.clear();
        }
    }

    fn emit(&self, stream: &'static str, line: String) {
        let target = self
            .subscribers
            .read()
            .ok()
            .and_then(|subs| subs.get(stream).cloned());

        let line = match target {
            Some((name, outbox)) => {
                let params = match serde_json::to_value(LogLine { name, line }) {
                    Ok(params) => params,
                    Err(_) => return,
                };
                match outbox.send(Frame::notification(stream, params)) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(frame)) => frame
                        .params
                        .and_then(|p| p.get("line").and_then(Value::as_str).map(str::to_string))
                        .unwrap_or_default(),
                }
            }
            None => line,
        };

        if stream == "stderr" {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
}

impl std::fmt::Debug for PluginLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLogger")
            .field("stdout", &self.is_subscribed("stdout"))
            .field("stderr", &self.is_subscribed("stderr"))
            .finish()
    }
}
