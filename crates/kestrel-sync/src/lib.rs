//! Tick-synchronized world replication on top of `bevy_ecs`.
//!
//! The [`ServerEngine`] runs the authoritative fixed-tick simulation and
//! broadcasts snapshots; the [`ClientEngine`] predicts ahead of it, compares
//! every authoritative snapshot with its own record of the same tick and
//! rewinds and replays when they differ. Games plug in through
//! [`NetworkedGame`].

pub mod client;
pub mod clock;
pub mod error;
pub mod game;
pub mod input_history;
pub mod server;
pub mod snapshot;

#[cfg(test)]
mod testing;

pub use client::{ClientEngine, ClientSettings, ConnectionStatus, RewindStats};
pub use clock::{
    ClientClock, ClockCorrection, MAX_STEPS_PER_UPDATE, RttEstimator, TickClock, cap_steps,
};
pub use error::SyncError;
pub use game::NetworkedGame;
pub use input_history::{InputHistory, InputSource};
pub use server::{ServerEngine, ServerSettings, ServerStats};
pub use snapshot::{
    ApplyReport, ComponentDescriptor, EntityMap, NetworkId, Owner, SnapshotSchema, read_component,
    write_component,
};
