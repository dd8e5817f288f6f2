//! Automation runtime server
//!
//! Usage: `homerun [CONFIG_DIR]`. The config directory defaults to
//! `HOMERUN_CONFIG` or the current directory and must hold `runtime.yaml`.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use hr_config::{RuntimeConfig, DEFAULT_CONFIG_FILE};
use hr_server::Runtime;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn config_dir() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("HOMERUN_CONFIG"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_dir = config_dir();
    let config = RuntimeConfig::load(&config_dir, DEFAULT_CONFIG_FILE)
        .with_context(|| format!("failed to load configuration from {}", config_dir.display()))?;

    // RUST_LOG overrides the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_ascii_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(config_dir = %config_dir.display(), "Starting homerun");

    let runtime = Runtime::new(config);
    runtime.start().await?;

    info!("homerun is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    runtime.shutdown();

    Ok(())
}
