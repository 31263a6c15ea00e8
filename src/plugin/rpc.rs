//! Newline-delimited JSON-RPC transport
//!
//! Every line is one [`Frame`]. Requests carry an `id`, a `method` and
//! `params`; replies echo the `id` with a `result` or an `error`. Streaming
//! methods reply once to acknowledge, then push `item` frames and finish
//! with an `end` frame. Frames without an `id` are notifications; the
//! plugin uses them to push its log lines.

use crate::driver::{
    DriverError, Reader, Request, Response, StreamMessage, StreamOutput, SubscriptionListenOutput,
};
use crate::error::TransportError;
use crate::plugin::handshake::{Announcement, Network};
use crate::plugin::session::Session;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Upper bound for a single frame.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Buffer between a plugin stream and its typed reader.
const READER_BUFFER: usize = 64;

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DriverError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end: bool,
}

impl Frame {
    pub fn request(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            id: Some(id),
            method: Some(method.to_string()),
            params,
            ..Default::default()
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            method: Some(method.to_string()),
            params: Some(params),
            ..Default::default()
        }
    }

    pub fn reply(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            error: Some(DriverError::new(message)),
            ..Default::default()
        }
    }

    pub fn item(id: u64, item: Value) -> Self {
        Self {
            id: Some(id),
            item: Some(item),
            ..Default::default()
        }
    }

    pub fn end(id: u64, error: Option<DriverError>) -> Self {
        Self {
            id: Some(id),
            error,
            end: true,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::InvalidFormat(e.to_string()))
    }
}

/// Log line pushed by a plugin on a subscribed stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub name: String,
    pub line: String,
}

/// First reply of a streaming method.
#[derive(Debug, Default, Deserialize)]
struct StreamAck {
    #[serde(default)]
    error: Option<DriverError>,
}

enum Pending {
    Reply(oneshot::Sender<Result<Value, TransportError>>),
    Stream {
        ack: Option<oneshot::Sender<Result<Value, TransportError>>>,
        items: mpsc::UnboundedSender<Result<Value, DriverError>>,
    },
}

type PendingMap = DashMap<u64, Pending>;

pub(crate) fn split_stream<S>(stream: S) -> (BoxedRead, BoxedWrite)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (Box::new(read), Box::new(write))
}

pub(crate) fn framed(
    read: BoxedRead,
    write: BoxedWrite,
) -> (
    FramedRead<BoxedRead, LinesCodec>,
    FramedWrite<BoxedWrite, LinesCodec>,
) {
    (
        FramedRead::new(read, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)),
        FramedWrite::new(write, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)),
    )
}

/// Client side of the JSON-RPC transport.
pub struct RpcSession {
    name: String,
    writer: Mutex<FramedWrite<BoxedWrite, LinesCodec>>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RpcSession {
    /// Connect to the address a plugin announced in its handshake.
    pub async fn connect(announcement: &Announcement, name: &str) -> Result<Self, TransportError> {
        let (read, write) = match announcement.network {
            Network::Tcp => {
                let stream = TcpStream::connect(&announcement.address)
                    .await
                    .map_err(|e| {
                        TransportError::ConnectionFailed(format!("{}: {e}", announcement.address))
                    })?;
                stream.set_nodelay(true).ok();
                split_stream(stream)
            }
            #[cfg(unix)]
            Network::Unix => {
                let stream = tokio::net::UnixStream::connect(&announcement.address)
                    .await
                    .map_err(|e| {
                        TransportError::ConnectionFailed(format!("{}: {e}", announcement.address))
                    })?;
                split_stream(stream)
            }
            #[cfg(not(unix))]
            Network::Unix => {
                return Err(TransportError::ConnectionFailed(
                    "unix sockets are not supported on this platform".to_string(),
                ))
            }
        };
        Ok(Self::from_parts(read, write, name))
    }

    /// Build a session over an already connected byte stream.
    pub fn from_stream<S>(stream: S, name: &str) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = split_stream(stream);
        Self::from_parts(read, write, name)
    }

    fn from_parts(read: BoxedRead, write: BoxedWrite, name: &str) -> Self {
        let (lines, writer) = framed(read, write);
        let pending = Arc::new(PendingMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_frames(
            name.to_string(),
            lines,
            pending.clone(),
            closed.clone(),
        ));

        Self {
            name: name.to_string(),
            writer: Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader: Mutex::new(Some(reader)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ask the plugin to push its stdout and stderr lines tagged with `name`.
    pub async fn subscribe_logs(&self, name: &str) -> Result<(), TransportError> {
        let params = serde_json::json!({ "name": name });
        self.request("stdout", Some(params.clone())).await?;
        self.request("stderr", Some(params)).await?;
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let line = frame.encode()?;
        let mut writer = self.writer.lock().await;
        writer
            .send(line)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// The reader sets `closed` before it clears `pending`, so an entry
    /// inserted after the clear is caught here instead of waiting forever.
    fn ensure_registered(&self, id: u64) -> Result<(), TransportError> {
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending::Reply(tx));
        self.ensure_registered(id)?;

        if let Err(e) = self.send(Frame::request(id, method, params)).await {
            self.pending.remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn open_stream(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<
        (
            Option<DriverError>,
            mpsc::UnboundedReceiver<Result<Value, DriverError>>,
        ),
        TransportError,
    > {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id();
        let (ack_tx, ack_rx) = oneshot::channel();
        let (items_tx, items_rx) = mpsc::unbounded_channel();
        self.pending.insert(
            id,
            Pending::Stream {
                ack: Some(ack_tx),
                items: items_tx,
            },
        );
        self.ensure_registered(id)?;

        if let Err(e) = self.send(Frame::request(id, method, params)).await {
            self.pending.remove(&id);
            return Err(e);
        }

        let ack = ack_rx.await.map_err(|_| TransportError::Closed)??;
        let ack: StreamAck = serde_json::from_value(ack)
            .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;
        if ack.error.is_some() {
            self.pending.remove(&id);
        }
        Ok((ack.error, items_rx))
    }
}

#[async_trait]
impl Session for RpcSession {
    async fn call(&self, request: Request) -> Result<Response, TransportError> {
        let method = request.method();
        let streaming = request.is_streaming();
        let mut envelope =
            serde_json::to_value(&request).map_err(|e| TransportError::InvalidFormat(e.to_string()))?;
        let params = envelope.get_mut("params").map(Value::take);

        if !streaming {
            let result = self.request(method, params).await?;
            return Response::decode(method, result)
                .map_err(|e| TransportError::InvalidFormat(e.to_string()));
        }

        let (error, items) = self.open_stream(method, params).await?;
        let opened = error.is_none();
        Ok(match request {
            Request::Stream(_) => Response::Stream(StreamOutput {
                error,
                reader: opened.then(|| typed_reader::<StreamMessage>(items)),
            }),
            _ => Response::SubscriptionListen(SubscriptionListenOutput {
                error,
                reader: opened.then(|| typed_reader::<Value>(items)),
            }),
        })
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.request("ping", None).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(plugin = %self.name, "Closing plugin session");

        {
            let mut writer = self.writer.lock().await;
            let _ = SinkExt::<String>::flush(&mut *writer).await;
            writer
                .get_mut()
                .shutdown()
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }

        // The plugin closes its side once it has seen EOF.
        if let Some(reader) = self.reader.lock().await.take() {
            let _ = reader.await;
        }
        Ok(())
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.try_lock() {
            if let Some(reader) = reader.take() {
                reader.abort();
            }
        }
    }
}

async fn read_frames(
    name: String,
    mut lines: FramedRead<BoxedRead, LinesCodec>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
) {
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Failed to read from plugin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Frame>(&line) {
            Ok(frame) => route(&name, frame, &pending),
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Discarding malformed frame");
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with `Closed`.
    pending.clear();
    tracing::debug!(plugin = %name, "Plugin connection closed");
}

fn route(name: &str, frame: Frame, pending: &PendingMap) {
    let Some(id) = frame.id else {
        log_notification(name, frame);
        return;
    };

    if let Some(item) = frame.item {
        if let Some(entry) = pending.get(&id) {
            if let Pending::Stream { items, .. } = entry.value() {
                let _ = items.send(Ok(item));
            }
        }
        return;
    }

    if frame.end {
        if let Some((_, Pending::Stream { items, .. })) = pending.remove(&id) {
            if let Some(error) = frame.error {
                let _ = items.send(Err(error));
            }
        }
        return;
    }

    let outcome = match frame.error {
        Some(error) => Err(TransportError::Remote(error.message)),
        None => Ok(frame.result.unwrap_or(Value::Null)),
    };

    match pending.remove(&id) {
        Some((_, Pending::Reply(tx))) => {
            let _ = tx.send(outcome);
        }
        Some((_, Pending::Stream { ack, items })) => {
            // Re-register before waking the caller, which may remove it again.
            if outcome.is_ok() {
                pending.insert(id, Pending::Stream { ack: None, items });
            }
            if let Some(ack) = ack {
                let _ = ack.send(outcome);
            }
        }
        None => {
            tracing::debug!(plugin = %name, id, "Reply for unknown request");
        }
    }
}

fn log_notification(name: &str, frame: Frame) {
    let stream = frame.method.as_deref().unwrap_or_default();
    let Some(params) = frame.params else {
        return;
    };
    match serde_json::from_value::<LogLine>(params) {
        Ok(log) if stream == "stderr" => {
            tracing::warn!(target: "plugin", plugin = %name, source = %log.name, "{}", log.line);
        }
        Ok(log) => {
            tracing::info!(target: "plugin", plugin = %name, source = %log.name, "{}", log.line);
        }
        Err(e) => {
            tracing::debug!(plugin = %name, method = stream, error = %e, "Ignoring notification");
        }
    }
}

/// Convert raw stream items into a typed [`Reader`].
fn typed_reader<T>(mut items: mpsc::UnboundedReceiver<Result<Value, DriverError>>) -> Reader<T>
where
    T: DeserializeOwned + Send + 'static,
{
    let (tx, reader) = Reader::channel(READER_BUFFER);
    tokio::spawn(async move {
        while let Some(item) = items.recv().await {
            let item = item.and_then(|value| {
                serde_json::from_value::<T>(value).map_err(|e| DriverError::new(e.to_string()))
            });
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    reader
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{FieldResolveInput, FieldResolveOutput, StreamInput};
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    /// Scripted plugin end of an in-memory connection.
    struct FakePlugin {
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        write: tokio::io::WriteHalf<DuplexStream>,
    }

    impl FakePlugin {
        async fn next_frame(&mut self) -> Option<Frame> {
            let line = self.lines.next_line().await.unwrap()?;
            Some(serde_json::from_str(&line).unwrap())
        }

        async fn send(&mut self, frame: Frame) {
            let mut line = frame.encode().unwrap();
            line.push('\n');
            self.write.write_all(line.as_bytes()).await.unwrap();
        }
    }

    fn pair() -> (RpcSession, FakePlugin) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let session = RpcSession::from_stream(client, "stucco-test");
        let (read, write) = tokio::io::split(server);
        let plugin = FakePlugin {
            lines: BufReader::new(read).lines(),
            write,
        };
        (session, plugin)
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (session, mut plugin) = pair();

        let server = tokio::spawn(async move {
            let frame = plugin.next_frame().await.unwrap();
            assert_eq!(frame.method.as_deref(), Some("fieldResolve"));
            assert_eq!(frame.params.unwrap()["function"]["name"], "hello");
            plugin
                .send(Frame::reply(frame.id.unwrap(), json!({"response": "world"})))
                .await;
            plugin
        });

        let request = Request::FieldResolve(FieldResolveInput {
            function: crate::driver::Function {
                name: "hello".to_string(),
            },
            ..Default::default()
        });
        let response = session.call(request).await.unwrap();
        let output = FieldResolveOutput::try_from(response).unwrap();
        assert_eq!(output.response, Some(json!("world")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_replies_are_correlated_by_id() {
        let (session, mut plugin) = pair();
        let session = Arc::new(session);

        let server = tokio::spawn(async move {
            let first = plugin.next_frame().await.unwrap();
            let second = plugin.next_frame().await.unwrap();
            // answer out of order
            for frame in [second, first] {
                let name = frame.params.unwrap()["function"]["name"].clone();
                plugin
                    .send(Frame::reply(frame.id.unwrap(), json!({ "response": name })))
                    .await;
            }
            plugin
        });

        let call = |name: &str| {
            let session = session.clone();
            let request = Request::FieldResolve(FieldResolveInput {
                function: crate::driver::Function {
                    name: name.to_string(),
                },
                ..Default::default()
            });
            async move { session.call(request).await }
        };
        let (a, b) = tokio::join!(call("a"), call("b"));
        let a = FieldResolveOutput::try_from(a.unwrap()).unwrap();
        let b = FieldResolveOutput::try_from(b.unwrap()).unwrap();
        assert_eq!(a.response, Some(json!("a")));
        assert_eq!(b.response, Some(json!("b")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_and_ping() {
        let (session, mut plugin) = pair();

        let server = tokio::spawn(async move {
            let ping = plugin.next_frame().await.unwrap();
            assert_eq!(ping.method.as_deref(), Some("ping"));
            plugin.send(Frame::reply(ping.id.unwrap(), json!({}))).await;

            let call = plugin.next_frame().await.unwrap();
            plugin
                .send(Frame::failure(call.id.unwrap(), "unknown method"))
                .await;
            plugin
        });

        session.ping().await.unwrap();
        let err = session
            .call(Request::FieldResolve(Default::default()))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Remote("unknown method".to_string()));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_items_until_end() {
        let (session, mut plugin) = pair();

        let server = tokio::spawn(async move {
            let frame = plugin.next_frame().await.unwrap();
            assert_eq!(frame.method.as_deref(), Some("stream"));
            let id = frame.id.unwrap();
            plugin.send(Frame::reply(id, json!({}))).await;
            plugin.send(Frame::item(id, json!({"response": 1}))).await;
            plugin.send(Frame::item(id, json!({"response": 2}))).await;
            plugin.send(Frame::end(id, None)).await;
            plugin
        });

        let response = session
            .call(Request::Stream(StreamInput::default()))
            .await
            .unwrap();
        let output = StreamOutput::try_from(response).unwrap();
        assert!(output.error.is_none());
        let mut reader = output.reader.unwrap();
        assert_eq!(reader.next().await.unwrap().unwrap().response, Some(json!(1)));
        assert_eq!(reader.next().await.unwrap().unwrap().response, Some(json!(2)));
        assert!(reader.next().await.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_calls() {
        let (session, mut plugin) = pair();

        let server = tokio::spawn(async move {
            let _ = plugin.next_frame().await;
            drop(plugin);
        });

        let err = session
            .call(Request::FieldResolve(Default::default()))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);
        server.await.unwrap();
        assert!(session.is_closed());
        assert_eq!(session.ping().await.unwrap_err(), TransportError::Closed);
    }

    #[tokio::test]
    async fn test_calls_racing_disconnect_never_hang() {
        let (session, plugin) = pair();
        let session = Arc::new(session);

        let calls: Vec<_> = (0..64)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    session.call(Request::FieldResolve(Default::default())).await
                })
            })
            .collect();
        drop(plugin);

        let results = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            futures::future::join_all(calls),
        )
        .await
        .expect("a call outlived the connection");
        for result in results {
            assert!(result.unwrap().is_err());
        }
        assert!(session.is_closed());
        assert!(session.pending.is_empty());
    }
}
