use crate::driver::{Request, Response, Secrets};
use crate::error::TransportError;
use crate::plugin::handshake::HandshakeConfig;
use crate::plugin::process::PluginProcess;
use crate::plugin::rpc::RpcSession;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// One live RPC connection to a plugin.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Invoke one driver operation.
    async fn call(&self, request: Request) -> Result<Response, TransportError>;

    /// Side-effect-free liveness probe.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Best-effort graceful disconnect. Callers bound the wait.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A session together with the process backing it, if any.
pub struct Connection {
    pub session: Arc<dyn Session>,
    pub process: Option<PluginProcess>,
}

impl Connection {
    pub fn detached(session: Arc<dyn Session>) -> Self {
        Self {
            session,
            process: None,
        }
    }
}

/// Produces connections for a plugin executable.
///
/// The engine only talks to plugins through this seam, so the transport can
/// be swapped without touching pooling or supervision.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(&self, executable: &Path, secrets: &Secrets)
        -> Result<Connection, TransportError>;
}

/// Spawns the executable and speaks JSON-RPC to it over the announced
/// socket.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub start_timeout: Duration,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        executable: &Path,
        secrets: &Secrets,
    ) -> Result<Connection, TransportError> {
        let handshake = HandshakeConfig::for_executable(executable);
        let (mut process, line) =
            PluginProcess::spawn(executable, secrets, &handshake, self.start_timeout).await?;

        let connected = async {
            let announcement = handshake.parse_announcement(&line)?;
            let session = RpcSession::connect(&announcement, process.name()).await?;
            let log_name = format!("plugin.{}", process.name());
            session.subscribe_logs(&log_name).await?;
            Ok::<_, TransportError>(session)
        }
        .await;

        match connected {
            Ok(session) => {
                tracing::info!(
                    plugin = %process.name(),
                    pid = process.pid(),
                    "Plugin session established"
                );
                Ok(Connection {
                    session: Arc::new(session),
                    process: Some(process),
                })
            }
            Err(e) => {
                tracing::warn!(plugin = %process.name(), error = %e, "Plugin connection failed");
                process.kill_tree().await;
                Err(e)
            }
        }
    }
}
