use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "STUCCO_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let mut figment = Figment::new();
    // Per-user defaults sit below the working directory files
    if let Some(dir) = dirs::config_dir() {
        figment = figment.merge(Toml::file(dir.join("stucco").join("stucco.toml")));
    }

    let config: Config = figment
        // Try to load from various config files
        .merge(Toml::file("stucco.toml"))
        .merge(Json::file("stucco.json"))
        .merge(Yaml::file("stucco.yaml"))
        .merge(Yaml::file("stucco.yml"))
        // Override with environment variables, e.g. STUCCO_PLUGINS__POOL_SIZE
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    apply_env_substitutions(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&config)?;
    apply_env_substitutions(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let plugins = &config.plugins;

    if plugins.pool_size == 0 {
        return Err(ConfigError::Validation("Plugin pool size must be greater than 0".into()).into());
    }

    if plugins.prefix.is_empty() {
        return Err(ConfigError::Validation("Plugin prefix must not be empty".into()).into());
    }

    for (name, value) in [
        ("config_timeout_ms", plugins.config_timeout_ms),
        ("start_timeout_ms", plugins.start_timeout_ms),
        ("drain_timeout_ms", plugins.drain_timeout_ms),
        ("disconnect_timeout_ms", plugins.disconnect_timeout_ms),
        (
            "shutdown_timeout_seconds",
            config.server.shutdown_timeout_seconds,
        ),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{name} must be greater than 0")).into());
        }
    }

    // Below this, close always runs out of time on a stuck plugin.
    let teardown_ms = plugins.drain_timeout_ms.saturating_add(plugins.disconnect_timeout_ms);
    if config.server.shutdown_timeout_seconds.saturating_mul(1000) <= teardown_ms {
        return Err(ConfigError::Validation(format!(
            "shutdown_timeout_seconds must exceed drain_timeout_ms + disconnect_timeout_ms ({teardown_ms}ms)"
        ))
        .into());
    }

    let health = &plugins.health_check;
    if health.enabled && (health.interval_seconds == 0 || health.timeout_seconds == 0) {
        return Err(ConfigError::Validation(
            "Health check interval and timeout must be greater than 0".into(),
        )
        .into());
    }

    if config.secrets.keys().any(|k| k.is_empty() || k.contains('=')) {
        return Err(ConfigError::Validation(
            "Secret names must be non-empty and must not contain '='".into(),
        )
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    for value in config.secrets.values_mut() {
        *value = substitute_env_vars(value)?;
    }

    if let Some(dirs) = &mut config.plugins.search_path {
        for dir in dirs.iter_mut() {
            let substituted = substitute_env_vars(&dir.to_string_lossy())?;
            *dir = PathBuf::from(substituted);
        }
    }

    Ok(config)
}

/// Expand `${VAR}` and `${VAR:-default}` references.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut result = input.to_string();

    for cap in re.captures_iter(input) {
        let reference = &cap[1];
        let (name, default) = match reference.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (reference, None),
        };

        let value = match (std::env::var(name), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{name}' not found"
                ))
                .into())
            }
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::ReconnectPolicy;
    use std::io::Write;

    #[test]
    fn test_env_substitution() {
        std::env::set_var("STUCCO_TEST_SUBST_VAR", "test_value");

        let result = substitute_env_vars("Hello ${STUCCO_TEST_SUBST_VAR}!").unwrap();
        assert_eq!(result, "Hello test_value!");

        let result = substitute_env_vars("${STUCCO_TEST_SUBST_MISSING:-default}").unwrap();
        assert_eq!(result, "default");

        let result = substitute_env_vars("${STUCCO_TEST_SUBST_VAR:-unused}").unwrap();
        assert_eq!(result, "test_value");

        assert!(substitute_env_vars("${STUCCO_TEST_SUBST_MISSING}").is_err());

        std::env::remove_var("STUCCO_TEST_SUBST_VAR");
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.plugins.pool_size, 16);
        assert_eq!(config.plugins.prefix, "stucco-");
        assert_eq!(config.plugins.config_timeout_ms, 5000);
        assert_eq!(config.plugins.drain_timeout_ms, 10000);
        assert_eq!(config.plugins.disconnect_timeout_ms, 5000);
        assert_eq!(config.plugins.health_check.interval_seconds, 5);
        assert_eq!(config.plugins.on_reconnect_failure, ReconnectPolicy::Exit);
        assert_eq!(config.server.shutdown_timeout_seconds, 20);
        assert!(validate(&config).is_ok());
    }

    #[tokio::test]
    async fn test_load_toml_file() {
        std::env::set_var("STUCCO_TEST_LOAD_TOKEN", "s3cret");
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[plugins]
pool_size = 4
search_path = ["/opt/stucco/bin"]
on_reconnect_failure = "fail"

[plugins.health_check]
interval_seconds = 2

[secrets]
API_TOKEN = "${{STUCCO_TEST_LOAD_TOKEN}}"
REGION = "${{STUCCO_TEST_LOAD_REGION:-eu-west-1}}"
"#
        )
        .unwrap();

        let config = load_from_path(file.path()).await.unwrap();
        assert_eq!(config.plugins.pool_size, 4);
        assert_eq!(
            config.plugins.search_path,
            Some(vec![PathBuf::from("/opt/stucco/bin")])
        );
        assert_eq!(config.plugins.on_reconnect_failure, ReconnectPolicy::Fail);
        assert_eq!(config.plugins.health_check.interval_seconds, 2);
        assert_eq!(config.plugins.health_check.timeout_seconds, 5);
        assert_eq!(config.secrets["API_TOKEN"], "s3cret");
        assert_eq!(config.secrets["REGION"], "eu-west-1");

        let options = config.plugins.options();
        assert_eq!(options.pool_size, 4);
        assert_eq!(
            options.health_check.unwrap().interval,
            std::time::Duration::from_secs(2)
        );
        std::env::remove_var("STUCCO_TEST_LOAD_TOKEN");
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"plugins": {{"pool_size": 0}}}}"#).unwrap();
        assert!(load_from_path(file.path()).await.is_err());

        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(load_from_path(file.path()).await.is_err());
    }

    #[test]
    fn test_shutdown_timeout_must_cover_plugin_teardown() {
        let mut config = Config::default();
        config.server.shutdown_timeout_seconds = 15;
        assert!(validate(&config).is_err());

        config.server.shutdown_timeout_seconds = 16;
        assert!(validate(&config).is_ok());

        config.plugins.drain_timeout_ms = 1000;
        config.plugins.disconnect_timeout_ms = 1000;
        config.server.shutdown_timeout_seconds = 3;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_disabled_health_check_yields_no_monitor() {
        let mut config = Config::default();
        config.plugins.health_check.enabled = false;
        config.plugins.health_check.interval_seconds = 0;
        assert!(validate(&config).is_ok());
        assert!(config.plugins.options().health_check.is_none());
    }
}
