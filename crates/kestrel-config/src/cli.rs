//! Command-line argument parsing for Kestrel binaries.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Kestrel command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "kestrel", about = "Kestrel world-synchronization server")]
pub struct CliArgs {
    /// Server address.
    #[arg(long)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Simulation tick rate in Hz.
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Milliseconds between authoritative snapshots.
    #[arg(long)]
    pub snapshot_interval_ms: Option<u32>,

    /// Maximum number of ticks replayed after a correction.
    #[arg(long)]
    pub max_rewind_ticks: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(rate) = args.tick_rate {
            self.sync.tick_rate = rate;
        }
        if let Some(interval) = args.snapshot_interval_ms {
            self.sync.snapshot_interval_ms = interval;
        }
        if let Some(window) = args.max_rewind_ticks {
            self.sync.max_rewind_ticks = window;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
