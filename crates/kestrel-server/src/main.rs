//! Kestrel server: hosts one puck arena room over TCP.
//!
//! Run with: `cargo run -p kestrel-server -- --port 7777`

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use kestrel_config::{CliArgs, Config};
use kestrel_server::{Host, ServerError, init_logging, load_config};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let (config, config_dir) = load_config(&args);
    init_logging(&config, config_dir.as_ref());

    info!(
        "Kestrel server: {} Hz, snapshot every {} ms, up to {} players",
        config.sync.tick_rate, config.sync.snapshot_interval_ms, config.network.max_players
    );

    let host = match start(&config, config_dir).await {
        Ok(host) => host,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };
    host.run(shutdown_signal()).await;
    ExitCode::SUCCESS
}

async fn start(config: &Config, config_dir: Option<PathBuf>) -> Result<Host, ServerError> {
    let host = Host::bind(config).await?;
    match config_dir {
        Some(dir) => host.watch_config(dir),
        None => Ok(host),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
