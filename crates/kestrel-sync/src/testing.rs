//! Minimal deterministic game and wiring helpers for engine tests.

use bevy_ecs::prelude::*;
use kestrel_net::{
    LoopbackNetwork, LossyLink, PacketCodec, ServerConnection, SessionId, SessionRegistry,
};
use serde::{Deserialize, Serialize};

use crate::client::{ClientEngine, ClientSettings};
use crate::error::SyncError;
use crate::game::NetworkedGame;
use crate::server::{ServerEngine, ServerSettings};
use crate::snapshot::{EntityMap, SnapshotSchema};

/// One-dimensional position in integer units.
#[derive(Component, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos(pub i64);

/// Units per tick.
#[derive(Component, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vel(pub i64);

/// Per-tick acceleration request.
#[derive(Component, Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Thrust(pub i8);

/// Players accelerate by their thrust; everything moves by its velocity.
/// Integer math keeps replay exact.
pub struct Glide;

impl NetworkedGame for Glide {
    type Input = Thrust;

    fn schema(&self) -> Result<SnapshotSchema, SyncError> {
        let mut schema = SnapshotSchema::new();
        schema.register::<Pos>("Pos")?.register::<Vel>("Vel")?;
        Ok(schema)
    }

    fn setup(&mut self, world: &mut World, entities: &mut EntityMap) {
        let (_, drifter) = entities.spawn(world, None);
        world.entity_mut(drifter).insert((Pos(0), Vel(1)));
    }

    fn spawn_player(&mut self, world: &mut World, entity: Entity, _: &SessionId) {
        world.entity_mut(entity).insert((Pos(100), Vel(0)));
    }

    fn step(&mut self, world: &mut World, _dt: f32) {
        let mut thrusting = world.query::<(&Thrust, &mut Vel)>();
        for (thrust, mut vel) in thrusting.iter_mut(world) {
            vel.0 += i64::from(thrust.0);
        }
        let mut moving = world.query::<(&Vel, &mut Pos)>();
        for (vel, mut pos) in moving.iter_mut(world) {
            pos.0 += vel.0;
        }
    }
}

/// Exact frame length used by tests: 60 Hz with 16 ms ticks keeps float
/// accumulation out of the picture.
pub const FRAME_MS: f64 = 16.0;

pub fn server_settings() -> ServerSettings {
    ServerSettings {
        tick_duration_ms: FRAME_MS,
        snapshot_interval_ms: 48.0,
        ping_interval_ms: 500.0,
        input_history_ticks: 256,
    }
}

pub fn client_settings() -> ClientSettings {
    ClientSettings {
        tick_duration_ms: FRAME_MS,
        sync_headroom_ms: 3.0 * FRAME_MS,
        max_rewind_ticks: 60,
        input_history_ticks: 256,
        snapshot_history_ticks: 256,
        stall_timeout_ms: 1000.0,
    }
}

/// A server and one client joined over a loopback network.
pub struct Pair {
    pub server: ServerEngine<Glide>,
    pub client: ClientEngine<Glide>,
    pub net: LoopbackNetwork,
    pub id: SessionId,
}

impl Pair {
    pub fn new(up: LossyLink, down: LossyLink) -> Self {
        let sessions = SessionRegistry::new(PacketCodec::default(), 8);
        let mut server = ServerEngine::new(Glide, server_settings(), sessions).unwrap();
        let mut client = ClientEngine::new(
            Glide,
            client_settings(),
            ServerConnection::new(PacketCodec::default()),
        )
        .unwrap();
        let mut net = LoopbackNetwork::new();
        let id = SessionId::new("peer-1");
        net.connect(
            id.clone(),
            up,
            down,
            server.sessions_mut(),
            client.connection_mut(),
        );
        Self {
            server,
            client,
            net,
            id,
        }
    }

    pub fn perfect() -> Self {
        Self::new(LossyLink::perfect(), LossyLink::perfect())
    }

    /// One frame on both sides.
    pub fn frame(&mut self) {
        self.net.pump_client(&self.id, self.client.connection_mut());
        self.client.update(FRAME_MS);
        self.net.pump_server(self.server.sessions_mut());
        self.server.update(FRAME_MS);
    }

    pub fn run(&mut self, frames: usize) {
        for _ in 0..frames {
            self.frame();
        }
    }

    /// Runs until the client has simulated a few ticks past `tick`.
    pub fn run_until_client_tick(&mut self, tick: u64) {
        for _ in 0..10_000 {
            if self.client.tick().is_some_and(|t| t >= tick) {
                return;
            }
            self.frame();
        }
        panic!("client never reached tick {tick}");
    }
}
