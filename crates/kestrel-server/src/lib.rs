//! Headless processes for the puck arena: the authoritative TCP server, a
//! scripted bot client, and a local session that runs a server and bots in
//! one process over simulated lossy links.

pub mod bot;
pub mod error;
pub mod host;
pub mod local;

use std::net::SocketAddr;
use std::path::PathBuf;

use kestrel_config::{CliArgs, Config, default_config_dir};
use kestrel_net::{CompressionConfig, FrameConfig, PacketCodec};

pub use bot::{Bot, wander};
pub use error::ServerError;
pub use host::Host;
pub use local::{BotReport, LocalReport, run_local};

/// Loads `config.ron` (creating it if missing) and applies CLI overrides.
/// Falls back to defaults when no config directory is available or the
/// result does not validate. Returns the directory used, if any.
pub fn load_config(args: &CliArgs) -> (Config, Option<PathBuf>) {
    let dir = args.config.clone().or_else(|| default_config_dir().ok());
    let mut config = match &dir {
        Some(dir) => Config::load_or_create(dir).unwrap_or_else(|e| {
            eprintln!("Config error in {}: {e}, using defaults", dir.display());
            Config::default()
        }),
        None => Config::default(),
    };
    config.apply_cli_overrides(args);
    if let Err(e) = config.validate() {
        eprintln!("Config error: {e}, using defaults");
        config = Config::default();
        config.apply_cli_overrides(args);
    }
    (config, dir)
}

/// Starts logging for a binary. The JSON log file goes to `<config>/logs`.
pub fn init_logging(config: &Config, config_dir: Option<&PathBuf>) {
    let log_dir = config_dir.map(|dir| dir.join("logs"));
    kestrel_log::init_logging(
        log_dir.as_deref(),
        cfg!(debug_assertions) || config.debug.log_to_file,
        Some(config),
    );
}

pub fn packet_codec(config: &Config) -> PacketCodec {
    PacketCodec::new(CompressionConfig {
        threshold: config.network.compression_threshold,
        enabled: true,
    })
}

pub fn frame_config(config: &Config) -> FrameConfig {
    FrameConfig {
        max_payload_size: config.network.max_frame_size,
    }
}

/// Resolves the configured server address.
pub async fn server_addr(config: &Config) -> Result<SocketAddr, ServerError> {
    let host = config.network.server_address.as_str();
    let port = config.network.server_port;
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| ServerError::Resolve(format!("{host}:{port}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_creates_file_and_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let args = CliArgs {
            port: Some(9100),
            config: Some(dir.path().to_path_buf()),
            ..CliArgs::default()
        };
        let (config, used) = load_config(&args);
        assert_eq!(config.network.server_port, 9100);
        assert_eq!(used.as_deref(), Some(dir.path()));
        assert!(dir.path().join("config.ron").exists());
    }

    #[tokio::test]
    async fn test_server_addr_resolves_loopback() {
        let addr = server_addr(&Config::default()).await.unwrap();
        assert_eq!(addr.port(), 7777);
        assert!(addr.ip().is_loopback());
    }
}
