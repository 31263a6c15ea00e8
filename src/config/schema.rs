use crate::plugin::{HealthCheckSettings, PluginOptions, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Passed to every discovered driver before its first call
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginsConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Directories to scan instead of `PATH`
    #[serde(default)]
    pub search_path: Option<Vec<PathBuf>>,
    #[serde(default = "default_config_timeout")]
    pub config_timeout_ms: u64,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_ms: u64,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub on_reconnect_failure: ReconnectPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_check_enabled")]
    pub enabled: bool,
    #[serde(default = "default_health_check_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_health_check_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            prefix: default_prefix(),
            search_path: None,
            config_timeout_ms: default_config_timeout(),
            start_timeout_ms: default_start_timeout(),
            drain_timeout_ms: default_drain_timeout(),
            disconnect_timeout_ms: default_disconnect_timeout(),
            health_check: HealthCheckConfig::default(),
            on_reconnect_failure: ReconnectPolicy::default(),
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_check_enabled(),
            interval_seconds: default_health_check_interval(),
            timeout_seconds: default_health_check_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

// Default value functions
fn default_pool_size() -> usize {
    16
}

fn default_prefix() -> String {
    "stucco-".to_string()
}

fn default_config_timeout() -> u64 {
    5000
}

fn default_start_timeout() -> u64 {
    30000
}

fn default_drain_timeout() -> u64 {
    10000
}

fn default_disconnect_timeout() -> u64 {
    5000
}

fn default_health_check_enabled() -> bool {
    true
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_health_check_timeout() -> u64 {
    5
}

/// Covers a full default drain plus disconnect with time to spare.
fn default_shutdown_timeout() -> u64 {
    20
}

impl PluginsConfig {
    pub fn config_timeout(&self) -> Duration {
        Duration::from_millis(self.config_timeout_ms)
    }

    pub fn options(&self) -> PluginOptions {
        PluginOptions::from(self)
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

impl From<&PluginsConfig> for PluginOptions {
    fn from(config: &PluginsConfig) -> Self {
        let health_check = config.health_check.enabled.then(|| HealthCheckSettings {
            interval: Duration::from_secs(config.health_check.interval_seconds),
            timeout: Duration::from_secs(config.health_check.timeout_seconds),
        });
        Self {
            pool_size: config.pool_size,
            health_check,
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
            disconnect_timeout: Duration::from_millis(config.disconnect_timeout_ms),
            start_timeout: Duration::from_millis(config.start_timeout_ms),
            reconnect_policy: config.on_reconnect_failure,
            exit_signal: None,
        }
    }
}
