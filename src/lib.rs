pub mod config;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod logging;
pub mod plugin;

pub use driver::{Driver, DriverConfig, Registry};
pub use error::{HostError, Result};
pub use plugin::Plugin;
