//! Plugin discovery
//!
//! Scans a search path for executables named with the plugin prefix, asks
//! each one which drivers it serves through its `config` subcommand and
//! registers a [`Plugin`] handle for every answer. Plugins that fail the
//! probe are logged and skipped.

use crate::config::PluginsConfig;
use crate::driver::{Driver, DriverConfig, Registry};
use crate::error::DiscoveryError;
use crate::plugin::{Plugin, PluginOptions, CONFIG_COMMAND};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub prefix: String,
    /// Directories to scan; `None` means `PATH`
    pub search_path: Option<Vec<PathBuf>>,
    pub config_timeout: Duration,
    pub plugin: PluginOptions,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            prefix: "stucco-".to_string(),
            search_path: None,
            config_timeout: Duration::from_secs(5),
            plugin: PluginOptions::default(),
        }
    }
}

impl From<&PluginsConfig> for DiscoveryOptions {
    fn from(config: &PluginsConfig) -> Self {
        Self {
            prefix: config.prefix.clone(),
            search_path: config.search_path.clone(),
            config_timeout: config.config_timeout(),
            plugin: config.options(),
        }
    }
}

/// Every plugin handle created by one discovery run.
#[derive(Default)]
pub struct PluginSet {
    plugins: Vec<Arc<Plugin>>,
}

impl PluginSet {
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Plugin>> {
        self.plugins.iter()
    }

    /// Close all plugins concurrently.
    pub async fn close(&self) {
        futures::future::join_all(self.plugins.iter().map(|p| p.close())).await;
    }

    /// Kill every plugin process tree without draining.
    pub async fn kill_all(&self) {
        futures::future::join_all(self.plugins.iter().map(|p| p.kill())).await;
    }
}

impl std::fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name()))
            .finish()
    }
}

/// Discover plugins and register one handle per plugin under every config
/// it reports.
pub async fn load_driver_plugins(registry: &Registry, options: &DiscoveryOptions) -> PluginSet {
    let mut set = PluginSet::default();

    for path in find_candidates(options) {
        let configs = match probe_config(&path, options.config_timeout).await {
            Ok(configs) => configs,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping plugin");
                continue;
            }
        };
        if configs.is_empty() {
            tracing::warn!(path = %path.display(), "Plugin serves no drivers, skipping");
            continue;
        }

        let plugin = Arc::new(Plugin::new(&path, options.plugin.clone()));
        for config in configs {
            tracing::info!(plugin = %plugin.name(), driver = %config, "Registered plugin driver");
            registry.register(config, plugin.clone() as Arc<dyn Driver>);
        }
        set.plugins.push(plugin);
    }

    tracing::debug!(count = set.len(), "Plugin discovery finished");
    set
}

/// Candidate executables across the search path, deduplicated and in a
/// stable order.
pub fn find_candidates(options: &DiscoveryOptions) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();

    for dir in search_dirs(options) {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::trace!(dir = %dir.display(), error = %e, "Cannot read search directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if is_candidate(&path, &options.prefix) {
                found.insert(path);
            }
        }
    }

    found.into_iter().collect()
}

fn search_dirs(options: &DiscoveryOptions) -> Vec<PathBuf> {
    match &options.search_path {
        Some(dirs) => dirs.clone(),
        None => split_search_path(std::env::var_os("PATH").unwrap_or_default()),
    }
}

/// Split a `PATH`-style list. An empty segment means the current directory.
fn split_search_path(value: OsString) -> Vec<PathBuf> {
    std::env::split_paths(&value)
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                dir
            }
        })
        .collect()
}

fn is_candidate(path: &Path, prefix: &str) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if !name.starts_with(prefix) {
        return false;
    }
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => is_executable(path, &meta),
        _ => false,
    }
}

#[cfg(unix)]
fn is_executable(_path: &Path, meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(path: &Path, _meta: &std::fs::Metadata) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "exe" | "cmd" | "bat"))
        .unwrap_or(false)
}

/// Run `<path> config` and parse the driver list it prints.
pub async fn probe_config(path: &Path, limit: Duration) -> Result<Vec<DriverConfig>, DiscoveryError> {
    let child = Command::new(path)
        .arg(CONFIG_COMMAND)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| DiscoveryError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    // Dropping the future on timeout kills the child.
    let output = tokio::time::timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| DiscoveryError::Timeout {
            path: path.to_path_buf(),
            timeout_ms: limit.as_millis() as u64,
        })?
        .map_err(|source| DiscoveryError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!(path = %path.display(), stderr = %stderr.trim(), "Config probe failed");
        }
        return Err(DiscoveryError::ExitStatus {
            path: path.to_path_buf(),
            status: output.status.to_string(),
        });
    }

    serde_json::from_slice(&output.stdout).map_err(|e| DiscoveryError::InvalidOutput {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str, mode: u32) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn options(dir: &TempDir) -> DiscoveryOptions {
        DiscoveryOptions {
            search_path: Some(vec![dir.path().to_path_buf()]),
            config_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_path_segment_is_current_dir() {
        let dirs = split_search_path(OsString::from("/usr/bin::/bin"));
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/usr/bin"),
                PathBuf::from("."),
                PathBuf::from("/bin")
            ]
        );
    }

    #[test]
    fn test_candidates_need_prefix_and_exec_bit() {
        let dir = TempDir::new().unwrap();
        script(&dir, "stucco-a", "exit 0", 0o755);
        script(&dir, "stucco-noexec", "exit 0", 0o644);
        script(&dir, "other-tool", "exit 0", 0o755);
        std::fs::create_dir(dir.path().join("stucco-dir")).unwrap();

        let found = find_candidates(&options(&dir));
        assert_eq!(found, vec![dir.path().join("stucco-a")]);
    }

    #[tokio::test]
    async fn test_discovery_registers_only_working_plugins() {
        let dir = TempDir::new().unwrap();
        let good = script(
            &dir,
            "stucco-a",
            r#"[ "$1" = config ] && echo '[{"Provider":"p","Runtime":"r"}]'"#,
            0o755,
        );
        script(&dir, "stucco-b", "exit 1", 0o755);
        script(&dir, "stucco-c", "echo not-json", 0o755);
        script(&dir, "stucco-d", "echo '[]'", 0o755);

        let registry = Registry::new();
        let set = load_driver_plugins(&registry, &options(&dir)).await;

        assert_eq!(set.len(), 1);
        assert_eq!(registry.configs(), vec![DriverConfig::new("p", "r")]);
        assert!(registry.get(&DriverConfig::new("p", "r")).is_some());
        assert_eq!(set.iter().next().unwrap().executable(), good.as_path());

        set.close().await;
    }

    #[tokio::test]
    async fn test_one_plugin_many_drivers_shares_a_handle() {
        let dir = TempDir::new().unwrap();
        script(
            &dir,
            "stucco-multi",
            r#"echo '[{"Provider":"local","Runtime":"js"},{"Provider":"local","Runtime":"ts"}]'"#,
            0o755,
        );

        let registry = Registry::new();
        let set = load_driver_plugins(&registry, &options(&dir)).await;
        assert_eq!(set.len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "stucco-slow", "sleep 30", 0o755);

        let started = std::time::Instant::now();
        let err = probe_config(&path, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_probe_reports_exit_status() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "stucco-b", "echo boom >&2; exit 1", 0o755);

        let err = probe_config(&path, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::ExitStatus { .. }));
        assert!(err.to_string().contains("stucco-b"));
    }
}
