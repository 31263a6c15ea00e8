use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout error")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Failures between the engine and a running plugin.
///
/// These never cross the `Driver` boundary: they are folded into the
/// `error` field of the operation output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to spawn plugin: {0}")]
    SpawnFailed(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Plugin returned error: {0}")]
    Remote(String),

    #[error("Operation timed out")]
    Timeout,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("cannot change secrets on running client")]
    SecretsLocked,

    #[error("plugin {0} is closed")]
    Closed(String),

    #[error("plugin {0} failed and will not be restarted")]
    Failed(String),

    #[error("no session available for plugin {0}")]
    SessionUnavailable(String),

    #[error("worker pool for plugin {0} is shut down")]
    PoolShutdown(String),
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("config probe of {} timed out after {timeout_ms}ms", .path.display())]
    Timeout { path: PathBuf, timeout_ms: u64 },

    #[error("config probe of {} exited with {status}", .path.display())]
    ExitStatus { path: PathBuf, status: String },

    #[error("config probe of {} printed invalid output: {reason}", .path.display())]
    InvalidOutput { path: PathBuf, reason: String },

    #[error("failed to run {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, HostError>;
