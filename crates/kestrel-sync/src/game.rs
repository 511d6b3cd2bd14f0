//! The extension point games implement to run on the sync engines.

use std::fmt::Debug;

use bevy_ecs::prelude::*;
use kestrel_net::SessionId;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SyncError;
use crate::snapshot::{EntityMap, SnapshotSchema};

/// Gameplay hooks shared by the server and client engines.
///
/// [`NetworkedGame::step`] is re-run during client rewind, so it must be a
/// pure function of the world, the inserted inputs and `dt`: no randomness
/// and no wall-clock reads.
pub trait NetworkedGame {
    /// Per-tick control state of one player entity. The engines insert it as
    /// a component on the controlled entity before every step.
    type Input: Component + Clone + Default + PartialEq + Debug + Serialize + DeserializeOwned;

    /// Declares the networked components.
    fn schema(&self) -> Result<SnapshotSchema, SyncError>;

    /// Creates the session-independent entities (server only).
    fn setup(&mut self, world: &mut World, entities: &mut EntityMap) {
        let _ = (world, entities);
    }

    /// Attaches gameplay components to a newly connected player's entity.
    fn spawn_player(&mut self, world: &mut World, entity: Entity, session: &SessionId);

    /// Runs the gameplay systems for one tick of `dt` seconds.
    fn step(&mut self, world: &mut World, dt: f32);
}
