use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use unmonitarr::app::{self, RunOptions};
use unmonitarr::config::{peek_debug, DEFAULT_STATE_FILE};

#[derive(Debug, Parser)]
#[command(name = "unmonitarr", version, about = "Unmonitor Radarr/Sonarr media by release group")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "CONFIG_PATH", default_value = "unmonitarr_config.json")]
    config: PathBuf,
    /// Where the incremental scan state is kept.
    #[arg(long, env = "STATE_FILE", default_value = DEFAULT_STATE_FILE)]
    state_file: PathBuf,
    /// Keep running and rescan on the configured interval.
    #[arg(long)]
    monitor: bool,
    /// Ignore recorded state for the first scan.
    #[arg(long)]
    force_full_scan: bool,
    /// Log what would change without changing anything.
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv_result = dotenv();
    let cli = Cli::parse();
    init_tracing(peek_debug(&cli.config));
    match dotenv_result {
        Ok(path) => info!("Loaded environment from {:?}", path),
        Err(e) => warn!("No .env file loaded ({}) - relying on environment", e),
    }
    info!("unmonitarr {} starting", env!("CARGO_PKG_VERSION"));

    app::run(RunOptions {
        config_path: cli.config,
        state_path: cli.state_file,
        monitor: cli.monitor || env_flag("MONITOR_MODE"),
        force_full_scan: cli.force_full_scan,
        dry_run: cli.dry_run,
    })
    .await
}
