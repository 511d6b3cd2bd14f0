//! Errors returned while building the sync engines.
//!
//! Everything that can go wrong at runtime (lost packets, missing input,
//! divergence) is handled as data. These variants only describe
//! misconfiguration detected at construction time.

/// Errors that can occur while configuring snapshots, clocks or engines.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A tick duration that is zero, negative or not finite.
    #[error("invalid tick duration: {0} ms")]
    InvalidTickDuration(f64),

    /// Two snapshot components were registered with the same tag.
    #[error("component tag {0:?} registered twice")]
    DuplicateComponentTag(&'static str),

    /// The same component type was registered under two tags.
    #[error("component type registered twice (second tag {0:?})")]
    DuplicateComponentType(&'static str),

    /// A component value could not be encoded.
    #[error("failed to encode component: {0}")]
    Encode(#[from] postcard::Error),
}
