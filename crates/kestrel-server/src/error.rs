//! Errors that stop a process from starting.

use kestrel_config::ConfigError;
use kestrel_sync::SyncError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Socket setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine rejected its configuration.
    #[error("engine setup failed: {0}")]
    Sync(#[from] SyncError),

    /// The config file could not be read.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The configured address did not resolve.
    #[error("cannot resolve {0}")]
    Resolve(String),
}
