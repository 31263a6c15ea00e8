use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stucco_host::config::{self, Config};
use stucco_host::discovery::{load_driver_plugins, DiscoveryOptions, PluginSet};
use stucco_host::driver::{Driver, Registry, SetSecretsInput};
use stucco_host::logging;

#[derive(Parser, Debug)]
#[command(name = "stucco-host")]
#[command(about = "Runs and supervises stucco driver plugins", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Discover plugins and keep them ready until interrupted (default)
    Start,
    /// List discovered plugins
    Check {
        /// Start every plugin and ping it
        #[arg(long)]
        ping: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.debug, args.json);

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(path)
                .await
                .with_context(|| format!("failed to load configuration from {}", path.display()))?
        }
        None => config::load_from_env_or_file()
            .await
            .context("failed to load configuration")?,
    };

    match args.command.unwrap_or(Command::Start) {
        Command::Start => run(config).await,
        Command::Check { ping } => check(config, ping).await,
    }
}

async fn discover(config: &Config, exit: Option<CancellationToken>) -> (Registry, PluginSet) {
    let registry = Registry::new();
    let mut options = DiscoveryOptions::from(&config.plugins);
    options.plugin.exit_signal = exit;
    let plugins = load_driver_plugins(&registry, &options).await;
    (registry, plugins)
}

async fn run(config: Config) -> anyhow::Result<()> {
    let fatal = CancellationToken::new();
    let (registry, plugins) = discover(&config, Some(fatal.clone())).await;
    if plugins.is_empty() {
        warn!("No plugins found with prefix {:?}", config.plugins.prefix);
    }

    if !config.secrets.is_empty() {
        for plugin in plugins.iter() {
            let out = plugin
                .set_secrets(SetSecretsInput {
                    secrets: config.secrets.clone(),
                })
                .await;
            if let Some(e) = out.error {
                error!(plugin = %plugin.name(), error = %e, "Failed to set secrets");
            }
        }
    }

    info!(
        plugins = plugins.len(),
        drivers = registry.len(),
        "Plugin host ready"
    );

    let failed = tokio::select! {
        _ = shutdown_signal() => false,
        _ = fatal.cancelled() => true,
    };
    info!("Shutting down plugin host");

    let limit = config.server.shutdown_timeout();
    if tokio::time::timeout(limit, plugins.close()).await.is_err() {
        error!("Shutdown timeout exceeded, killing remaining plugins");
        plugins.kill_all().await;
        std::process::exit(1);
    }

    if failed {
        anyhow::bail!("a plugin could not be restarted");
    }
    info!("Graceful shutdown completed");
    Ok(())
}

async fn check(config: Config, ping: bool) -> anyhow::Result<()> {
    info!("Checking plugins...");
    let (registry, plugins) = discover(&config, None).await;

    for driver in registry.configs() {
        info!("  {}", driver);
    }
    info!(
        "Found {} plugin(s) serving {} driver(s)",
        plugins.len(),
        registry.len()
    );

    let mut failed = 0;
    if ping {
        for plugin in plugins.iter() {
            match plugin.ping().await {
                Ok(()) => info!("  ✓ {} answered ping", plugin.name()),
                Err(e) => {
                    error!("  ✗ {} failed ping: {}", plugin.name(), e);
                    failed += 1;
                }
            }
        }
        plugins.close().await;
    }

    if failed > 0 {
        anyhow::bail!("{failed} plugin(s) failed checks");
    }
    info!("✓ All checks passed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
