//! Configuration system for Kestrel.
//!
//! Runtime settings for the synchronization engines and their transports,
//! persisted to disk as RON files. Supports CLI overrides via clap,
//! hot-reload detection, and forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, LinkConfig, NetworkConfig, SyncConfig, default_config_dir};
pub use error::ConfigError;
