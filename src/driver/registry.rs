use super::Driver;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The (provider, runtime) pair a driver serves.
///
/// Plugins print a JSON array of these from their `config` subcommand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(rename = "Provider", alias = "provider")]
    pub provider: String,
    #[serde(rename = "Runtime", alias = "runtime")]
    pub runtime: String,
}

impl DriverConfig {
    pub fn new(provider: impl Into<String>, runtime: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            runtime: runtime.into(),
        }
    }
}

impl fmt::Display for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.runtime)
    }
}

/// Lookup table from [`DriverConfig`] to the driver serving it.
///
/// Populated by discovery, read by the router. Later registrations for the
/// same config replace earlier ones.
#[derive(Default, Clone)]
pub struct Registry {
    drivers: Arc<DashMap<DriverConfig, Arc<dyn Driver>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, config: DriverConfig, driver: Arc<dyn Driver>) {
        if self.drivers.insert(config.clone(), driver).is_some() {
            tracing::debug!(driver = %config, "Replaced registered driver");
        }
    }

    pub fn get(&self, config: &DriverConfig) -> Option<Arc<dyn Driver>> {
        self.drivers.get(config).map(|entry| entry.value().clone())
    }

    /// Registered configs, sorted for stable output.
    pub fn configs(&self) -> Vec<DriverConfig> {
        let mut configs: Vec<_> = self.drivers.iter().map(|e| e.key().clone()).collect();
        configs.sort();
        configs
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("drivers", &self.configs())
            .finish()
    }
}
