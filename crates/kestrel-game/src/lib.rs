//! Puck arena: a small top-down game used to exercise the sync engines.
//!
//! Each connected player steers a paddle; a single puck bounces around the
//! field and scores when it leaves through a goal mouth. The game is a
//! [`NetworkedGame`], so the same type runs on the server and, predicted, on
//! every client.

pub mod components;
pub mod systems;

use bevy_ecs::prelude::*;
use bevy_ecs::schedule::ExecutorKind;
use glam::Vec2;
use kestrel_net::SessionId;
use kestrel_sync::{EntityMap, NetworkedGame, SnapshotSchema, SyncError};

pub use components::{ArenaTime, Paddle, PaddleInput, Position, Puck, Score, Velocity};

use systems::{HALF_WIDTH, KICKOFF_VELOCITY};

/// Lane offsets for successive paddles on the same half.
const LANES: [f32; 5] = [0.0, 3.0, -3.0, 6.0, -6.0];

/// The arena rules and their tick schedule.
pub struct PuckArena {
    schedule: Schedule,
}

impl PuckArena {
    pub fn new() -> Self {
        let mut schedule = Schedule::default();
        schedule.set_executor_kind(ExecutorKind::SingleThreaded);
        schedule.add_systems(
            (
                systems::steer_paddles,
                systems::integrate,
                systems::confine_paddles,
                systems::deflect_puck,
                systems::score_goals,
            )
                .chain(),
        );
        Self { schedule }
    }
}

impl Default for PuckArena {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkedGame for PuckArena {
    type Input = PaddleInput;

    fn schema(&self) -> Result<SnapshotSchema, SyncError> {
        let mut schema = SnapshotSchema::new();
        schema
            .register::<Position>("Position")?
            .register::<Velocity>("Velocity")?
            .register::<Paddle>("Paddle")?
            .register::<Puck>("Puck")?
            .register::<Score>("Score")?
            // Remote paddles keep moving on their last known input.
            .register::<PaddleInput>("PaddleInput")?;
        Ok(schema)
    }

    fn setup(&mut self, world: &mut World, entities: &mut EntityMap) {
        let (id, puck) = entities.spawn(world, None);
        world
            .entity_mut(puck)
            .insert((Puck, Position::default(), Velocity(KICKOFF_VELOCITY)));
        tracing::debug!("Puck is {id}");
    }

    fn spawn_player(&mut self, world: &mut World, entity: Entity, session: &SessionId) {
        let paddles = world
            .query_filtered::<(), With<Paddle>>()
            .iter(world)
            .count();
        let side = if paddles % 2 == 0 { -1.0 } else { 1.0 };
        let x = side * 0.75 * HALF_WIDTH;
        let y = LANES[(paddles / 2) % LANES.len()];
        world.entity_mut(entity).insert((
            Paddle,
            Position(Vec2::new(x, y)),
            Velocity::default(),
            Score::default(),
        ));
        tracing::debug!("Paddle for {session} at ({x}, {y})");
    }

    fn step(&mut self, world: &mut World, dt: f32) {
        world.insert_resource(ArenaTime { delta: dt });
        self.schedule.run(world);
    }
}
