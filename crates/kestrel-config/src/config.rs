//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const APP_NAME: &str = "kestrel";

/// Top-level configuration shared by server and client processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport settings.
    pub network: NetworkConfig,
    /// Tick clock, snapshot and rewind settings.
    pub sync: SyncConfig,
    /// Simulated lossy link used by local sessions and tests.
    pub link: LinkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Network/transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server address for clients to connect to.
    pub server_address: String,
    /// Server port.
    pub server_port: u16,
    /// Idle time in seconds after which a silent session is disconnected.
    pub timeout_seconds: u32,
    /// Maximum number of connected sessions (server only).
    pub max_players: u32,
    /// Encoded packets at or above this size are LZ4-compressed.
    pub compression_threshold: usize,
    /// Largest frame accepted on a stream transport, in bytes.
    pub max_frame_size: u32,
}

/// Tick clock and reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Fixed simulation rate in Hz.
    pub tick_rate: u32,
    /// Interval between authoritative world snapshots, in milliseconds.
    pub snapshot_interval_ms: u32,
    /// Interval between clock-sync pings, in milliseconds.
    pub ping_interval_ms: u32,
    /// Extra lead the client adds on top of half the RTT, in milliseconds.
    pub sync_headroom_ms: f64,
    /// Largest number of ticks the client replays after a correction.
    /// Older corrections hard-snap instead.
    pub max_rewind_ticks: u64,
    /// Number of ticks of input kept per entity.
    pub input_history_ticks: u64,
    /// Number of ticks of locally simulated snapshots kept by the client.
    pub snapshot_history_ticks: u64,
    /// Milliseconds without server traffic before the client reports a stall.
    pub stall_timeout_ms: u32,
}

/// Parameters of the simulated unreliable link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    /// Probability (0.0 - 1.0) that an unreliable packet is dropped.
    pub drop_rate: f64,
    /// Probability (0.0 - 1.0) that an unreliable packet is delivered late.
    pub reorder_rate: f64,
    /// RNG seed so lossy runs are reproducible.
    pub seed: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Write a JSON log file next to the config directory.
    pub log_to_file: bool,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 7777,
            timeout_seconds: 30,
            max_players: 32,
            compression_threshold: 256,
            max_frame_size: 1_048_576,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            snapshot_interval_ms: 50,
            ping_interval_ms: 1000,
            sync_headroom_ms: 20.0,
            max_rewind_ticks: 60,
            input_history_ticks: 256,
            snapshot_history_ticks: 256,
            stall_timeout_ms: 2000,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            reorder_rate: 0.0,
            seed: 0x5EED,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl SyncConfig {
    /// Duration of one tick in milliseconds.
    pub fn tick_duration_ms(&self) -> f64 {
        1000.0 / f64::from(self.tick_rate.max(1))
    }
}

impl Config {
    /// Rejects values the engines cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });
        if self.sync.tick_rate == 0 || self.sync.tick_rate > 1000 {
            return invalid("sync.tick_rate", "must be between 1 and 1000 Hz");
        }
        if self.sync.snapshot_interval_ms == 0 {
            return invalid("sync.snapshot_interval_ms", "must be positive");
        }
        if self.sync.ping_interval_ms == 0 {
            return invalid("sync.ping_interval_ms", "must be positive");
        }
        if !(self.sync.sync_headroom_ms.is_finite() && self.sync.sync_headroom_ms >= 0.0) {
            return invalid("sync.sync_headroom_ms", "must be a non-negative number");
        }
        if self.sync.snapshot_history_ticks < self.sync.max_rewind_ticks {
            return invalid(
                "sync.snapshot_history_ticks",
                "must cover max_rewind_ticks",
            );
        }
        if self.sync.input_history_ticks < self.sync.max_rewind_ticks {
            return invalid("sync.input_history_ticks", "must cover max_rewind_ticks");
        }
        if !(0.0..=1.0).contains(&self.link.drop_rate) {
            return invalid("link.drop_rate", "must be within 0.0..=1.0");
        }
        if !(0.0..=1.0).contains(&self.link.reorder_rate) {
            return invalid("link.reorder_rate", "must be within 0.0..=1.0");
        }
        if self.network.max_players == 0 {
            return invalid("network.max_players", "must be positive");
        }
        Ok(())
    }
}

/// Platform configuration directory for Kestrel (`<config_dir>/kestrel`).
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    let base = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(base.join(APP_NAME))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
