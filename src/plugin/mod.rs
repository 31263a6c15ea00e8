//! Plugin execution engine
//!
//! One [`Plugin`] handle per plugin executable. The handle owns the child
//! process, the RPC session to it, a bounded worker pool that carries every
//! driver call, and a health monitor that replaces the session when the
//! plugin stops answering.
//!
//! # Modules
//!
//! - `process`: spawning, output forwarding and process-tree termination
//! - `handshake`: environment cookie and the child's announcement line
//! - `session`: the `Session` and `Launcher` seams
//! - `rpc`: newline-delimited JSON-RPC client over the announced socket
//! - `pool`: fixed-size worker pool and dispatcher
//! - `health`: periodic ping and reconnect
//! - `handle`: the `Plugin` driver tying these together
//! - `serve`: the plugin side, for writing plugins in Rust

pub mod handle;
pub mod handshake;
pub mod health;
pub mod pool;
pub mod process;
pub mod rpc;
pub mod serve;
pub mod session;

pub use handle::{Lifecycle, Plugin, PluginOptions, ReconnectPolicy};
pub use health::{HealthCheckSettings, HealthMonitor, MonitorState};
pub use pool::WorkerPool;
pub use process::PluginProcess;
pub use serve::{PluginLogger, Server, CONFIG_COMMAND};
pub use session::{Connection, Launcher, ProcessLauncher, Session};
