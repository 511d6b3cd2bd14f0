//! Server reconciliation engine: the authoritative fixed-tick loop.
//!
//! Each tick the engine drains the session queues, applies every player's
//! recorded input for that tick (falling back to the last known input), runs
//! the gameplay systems, and on its own cadence broadcasts a snapshot tagged
//! with the last simulated tick. It also drives clock sync: periodic pings,
//! and a sync result for every pong.

use std::collections::BTreeMap;
use std::ops::Range;

use bevy_ecs::prelude::*;
use kestrel_config::SyncConfig;
use kestrel_net::{
    DisconnectReason, NetHandler, Packet, PlayerInput, Reliability, SessionId, SessionRegistry,
    SyncPing, SyncResult, Welcome, WorldSnapshot,
};

use crate::clock::{TickClock, cap_steps};
use crate::error::SyncError;
use crate::game::NetworkedGame;
use crate::input_history::InputHistory;
use crate::snapshot::{EntityMap, NetworkId, SnapshotSchema};

/// Timing and retention settings of the server engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    /// Duration of one tick in milliseconds.
    pub tick_duration_ms: f64,
    /// Milliseconds between snapshot broadcasts.
    pub snapshot_interval_ms: f64,
    /// Milliseconds between clock-sync pings.
    pub ping_interval_ms: f64,
    /// Ticks of input kept per player, and how far ahead input is accepted.
    pub input_history_ticks: u64,
}

impl From<&SyncConfig> for ServerSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            tick_duration_ms: config.tick_duration_ms(),
            snapshot_interval_ms: f64::from(config.snapshot_interval_ms),
            ping_interval_ms: f64::from(config.ping_interval_ms),
            input_history_ticks: config.input_history_ticks,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Server counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Ticks simulated.
    pub ticks: u64,
    /// Snapshot broadcasts.
    pub snapshots_sent: u64,
    /// Input reports recorded.
    pub inputs_accepted: u64,
    /// Input reports for ticks already simulated.
    pub late_inputs: u64,
    /// Input reports that did not decode, came from a session without an
    /// entity, or were too far ahead.
    pub rejected_inputs: u64,
    /// Sync results sent.
    pub sync_results: u64,
}

enum Outbound {
    To(SessionId, Packet, Reliability),
    Rtt(SessionId, f64),
}

/// Simulation state, separate from the session registry so the registry can
/// dispatch into it.
struct ServerState<G: NetworkedGame> {
    game: G,
    schema: SnapshotSchema,
    world: World,
    entities: EntityMap,
    inputs: InputHistory<G::Input>,
    players: BTreeMap<SessionId, NetworkId>,
    simulated: Option<u64>,
    time_ms: f64,
    tick_duration_ms: f64,
    input_window: u64,
    outbox: Vec<Outbound>,
    stats: ServerStats,
}

impl<G: NetworkedGame> ServerState<G> {
    fn step(&mut self, tick: u64, dt: f32) {
        for (session, &id) in &self.players {
            let Some(entity) = self.entities.live(&self.world, id) else {
                tracing::debug!("Skipping {session} at tick {tick}: entity {id} is gone");
                continue;
            };
            // Until the first report arrives there is nothing to fall back to.
            let input = if self.inputs.tracks(id) {
                self.inputs.get(id, tick)
            } else {
                G::Input::default()
            };
            if let Ok(mut entity_mut) = self.world.get_entity_mut(entity) {
                entity_mut.insert(input);
            }
        }
        self.game.step(&mut self.world, dt);
        self.inputs.prune(tick);
        self.simulated = Some(tick);
        self.stats.ticks += 1;
    }

    fn take_snapshot(&self) -> WorldSnapshot {
        self.schema
            .take(&self.world, &self.entities, self.simulated.unwrap_or(0))
    }

    fn on_input(&mut self, session: &SessionId, report: PlayerInput) {
        let Some(&id) = self.players.get(session) else {
            self.stats.rejected_inputs += 1;
            tracing::debug!("Input from {session} without a player entity");
            return;
        };
        if let Some(simulated) = self.simulated
            && report.tick <= simulated
        {
            self.stats.late_inputs += 1;
            tracing::debug!(
                "Late input from {session} for tick {} (at {simulated})",
                report.tick
            );
            return;
        }
        let horizon = self.simulated.unwrap_or(0) + self.input_window;
        if report.tick > horizon {
            self.stats.rejected_inputs += 1;
            tracing::debug!("Input from {session} for tick {} beyond {horizon}", report.tick);
            return;
        }
        match postcard::from_bytes::<G::Input>(&report.input) {
            Ok(input) => {
                self.inputs.record(id, report.tick, input);
                self.stats.inputs_accepted += 1;
            }
            Err(e) => {
                self.stats.rejected_inputs += 1;
                tracing::debug!("Undecodable input from {session}: {e}");
            }
        }
    }
}

impl<G: NetworkedGame> NetHandler for ServerState<G> {
    fn on_connected(&mut self, session: &SessionId) {
        let (id, entity) = self.entities.spawn(&mut self.world, Some(session.clone()));
        self.game.spawn_player(&mut self.world, entity, session);
        self.players.insert(session.clone(), id);
        tracing::info!("Player {session} joined as {id}");

        self.outbox.push(Outbound::To(
            session.clone(),
            Packet::Welcome(Welcome {
                session_id: session.clone(),
                tick_duration_ms: self.tick_duration_ms,
            }),
            Reliability::Reliable,
        ));
        self.outbox.push(Outbound::To(
            session.clone(),
            Packet::SyncPing(SyncPing {
                server_time_ms: self.time_ms,
            }),
            Reliability::Unreliable,
        ));
    }

    fn on_disconnected(&mut self, session: &SessionId, reason: DisconnectReason) {
        self.players.remove(session);
        let owned = self.entities.owned_by(&self.world, session);
        for &id in &owned {
            self.entities.despawn(&mut self.world, id);
            self.inputs.remove(id);
        }
        tracing::info!(
            "Player {session} left ({reason:?}), removed {} entities",
            owned.len()
        );
    }

    fn on_packet(&mut self, session: &SessionId, packet: Packet) {
        match packet {
            Packet::SyncPong(pong) => {
                let rtt_ms = (self.time_ms - pong.server_time_ms).max(0.0);
                self.outbox.push(Outbound::Rtt(session.clone(), rtt_ms));
                self.outbox.push(Outbound::To(
                    session.clone(),
                    Packet::SyncResult(SyncResult {
                        client_time_ms: pong.client_time_ms,
                        server_time_ms: self.time_ms,
                        server_tick: self.simulated.unwrap_or(0),
                        tick_duration_ms: self.tick_duration_ms,
                    }),
                    Reliability::Unreliable,
                ));
                self.stats.sync_results += 1;
            }
            Packet::PlayerInput(report) => self.on_input(session, report),
            other => tracing::debug!("Ignoring {} from {session}", other.opcode()),
        }
    }
}

/// The authoritative engine of one room.
pub struct ServerEngine<G: NetworkedGame> {
    sessions: SessionRegistry,
    state: ServerState<G>,
    clock: TickClock,
    settings: ServerSettings,
    since_snapshot_ms: f64,
    since_ping_ms: f64,
}

impl<G: NetworkedGame> ServerEngine<G> {
    /// Builds the engine, declares the game's schema and runs its setup.
    pub fn new(
        mut game: G,
        settings: ServerSettings,
        sessions: SessionRegistry,
    ) -> Result<Self, SyncError> {
        let clock = TickClock::new(settings.tick_duration_ms)?;
        let schema = game.schema()?;
        let mut world = World::new();
        let mut entities = EntityMap::new();
        game.setup(&mut world, &mut entities);

        Ok(Self {
            sessions,
            state: ServerState {
                game,
                schema,
                world,
                entities,
                inputs: InputHistory::new(settings.input_history_ticks),
                players: BTreeMap::new(),
                simulated: None,
                time_ms: 0.0,
                tick_duration_ms: settings.tick_duration_ms,
                input_window: settings.input_history_ticks,
                outbox: Vec::new(),
                stats: ServerStats::default(),
            },
            clock,
            settings,
            since_snapshot_ms: 0.0,
            since_ping_ms: 0.0,
        })
    }

    /// Advances server time by `delta_ms`, simulating every tick entered, and
    /// emits snapshots and pings when their intervals elapse. Returns the
    /// simulated ticks.
    pub fn update(&mut self, delta_ms: f64) -> Range<u64> {
        let ticks = cap_steps(self.clock.advance(delta_ms));
        self.state.time_ms = self.clock.elapsed_ms();
        let dt = self.clock.tick_seconds() as f32;

        for tick in ticks.clone() {
            self.sessions.dispatch(&mut self.state);
            self.flush();
            self.state.step(tick, dt);
        }

        let delta_ms = if delta_ms.is_finite() { delta_ms.max(0.0) } else { 0.0 };
        self.since_snapshot_ms += delta_ms;
        if self.since_snapshot_ms >= self.settings.snapshot_interval_ms {
            self.since_snapshot_ms %= self.settings.snapshot_interval_ms.max(f64::EPSILON);
            self.broadcast_snapshot();
        }
        self.since_ping_ms += delta_ms;
        if self.since_ping_ms >= self.settings.ping_interval_ms {
            self.since_ping_ms %= self.settings.ping_interval_ms.max(f64::EPSILON);
            self.sessions.broadcast(
                &Packet::SyncPing(SyncPing {
                    server_time_ms: self.state.time_ms,
                }),
                Reliability::Unreliable,
            );
        }
        self.flush();
        ticks
    }

    /// Takes a snapshot of the current state and broadcasts it unreliably.
    pub fn broadcast_snapshot(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let snapshot = self.state.take_snapshot();
        self.sessions
            .broadcast(&Packet::World(snapshot), Reliability::Unreliable);
        self.state.stats.snapshots_sent += 1;
    }

    /// Snapshot of the current state, tagged with the last simulated tick.
    pub fn take_snapshot(&self) -> WorldSnapshot {
        self.state.take_snapshot()
    }

    fn flush(&mut self) {
        for outbound in self.state.outbox.drain(..) {
            match outbound {
                Outbound::To(session, packet, reliability) => {
                    self.sessions.send_to(&session, &packet, reliability);
                }
                Outbound::Rtt(session, rtt_ms) => self.sessions.record_rtt(&session, rtt_ms),
            }
        }
    }

    /// The session registry, for transports.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// The session registry, for transports.
    pub fn sessions_mut(&mut self) -> &mut SessionRegistry {
        &mut self.sessions
    }

    /// The authoritative world.
    pub fn world(&self) -> &World {
        &self.state.world
    }

    /// The authoritative world, mutably.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.state.world
    }

    /// The network id table.
    pub fn entities(&self) -> &EntityMap {
        &self.state.entities
    }

    /// Network id and live entity of a session's player.
    pub fn player(&self, session: &SessionId) -> Option<(NetworkId, Entity)> {
        let id = *self.state.players.get(session)?;
        let entity = self.state.entities.live(&self.state.world, id)?;
        Some((id, entity))
    }

    /// Recorded player input.
    pub fn inputs(&self) -> &InputHistory<G::Input> {
        &self.state.inputs
    }

    /// Last simulated tick, `None` before the first.
    pub fn simulated_tick(&self) -> Option<u64> {
        self.state.simulated
    }

    /// Server time in milliseconds.
    pub fn time_ms(&self) -> f64 {
        self.clock.elapsed_ms()
    }

    /// Counters.
    pub fn stats(&self) -> ServerStats {
        self.state.stats
    }

    /// The game hooks.
    pub fn game(&self) -> &G {
        &self.state.game
    }

    /// Engine settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_net::{PacketCodec, SyncPong};

    use crate::testing::{FRAME_MS, Glide, Pos, Thrust, Vel, server_settings};

    fn engine() -> ServerEngine<Glide> {
        ServerEngine::new(
            Glide,
            server_settings(),
            SessionRegistry::new(PacketCodec::default(), 8),
        )
        .unwrap()
    }

    fn peer() -> SessionId {
        SessionId::new("peer-1")
    }

    fn sent(engine: &mut ServerEngine<Glide>) -> Vec<Packet> {
        let codec = PacketCodec::default();
        engine
            .sessions_mut()
            .drain_outgoing()
            .into_iter()
            .map(|out| codec.decode(&out.bytes).unwrap())
            .collect()
    }

    fn deliver(engine: &mut ServerEngine<Glide>, packet: &Packet) {
        let bytes = PacketCodec::default().encode(packet).unwrap();
        engine.sessions_mut().receive(&peer(), &bytes);
    }

    fn input(tick: u64, thrust: i8) -> Packet {
        Packet::PlayerInput(PlayerInput {
            tick,
            input: postcard::to_allocvec(&Thrust(thrust)).unwrap(),
        })
    }

    fn connected() -> ServerEngine<Glide> {
        let mut engine = engine();
        engine.sessions_mut().on_connect(peer());
        engine.update(FRAME_MS);
        engine
    }

    #[test]
    fn test_zero_tick_duration_is_misconfiguration() {
        let settings = ServerSettings {
            tick_duration_ms: 0.0,
            ..server_settings()
        };
        let result = ServerEngine::new(
            Glide,
            settings,
            SessionRegistry::new(PacketCodec::default(), 1),
        );
        assert!(matches!(result, Err(SyncError::InvalidTickDuration(_))));
    }

    #[test]
    fn test_connect_spawns_player_and_welcomes() {
        let mut engine = connected();
        let (id, entity) = engine.player(&peer()).unwrap();
        assert_eq!(id, NetworkId(2));
        assert_eq!(engine.world().get::<Pos>(entity), Some(&Pos(100)));

        let packets = sent(&mut engine);
        assert!(matches!(&packets[0], Packet::Welcome(w) if w.session_id == peer()));
        assert!(matches!(packets[1], Packet::SyncPing(_)));
    }

    #[test]
    fn test_input_applied_at_its_tick() {
        let mut engine = connected();
        assert_eq!(engine.simulated_tick(), Some(1));
        deliver(&mut engine, &input(2, 3));
        deliver(&mut engine, &input(3, -1));
        engine.update(FRAME_MS);
        engine.update(FRAME_MS);

        let (_, entity) = engine.player(&peer()).unwrap();
        // Tick 2: vel 3, pos 103. Tick 3: vel 2, pos 105.
        assert_eq!(engine.world().get::<Vel>(entity), Some(&Vel(2)));
        assert_eq!(engine.world().get::<Pos>(entity), Some(&Pos(105)));
        assert_eq!(engine.stats().inputs_accepted, 2);
    }

    #[test]
    fn test_missing_input_reuses_last_known() {
        let mut engine = connected();
        deliver(&mut engine, &input(2, 1));
        for _ in 0..4 {
            engine.update(FRAME_MS);
        }
        // Ticks 2..=5 all thrust 1.
        let (_, entity) = engine.player(&peer()).unwrap();
        assert_eq!(engine.world().get::<Vel>(entity), Some(&Vel(4)));
        assert_eq!(engine.world().get::<Thrust>(entity), Some(&Thrust(1)));
    }

    #[test]
    fn test_late_and_garbled_input_dropped() {
        let mut engine = connected();
        engine.update(FRAME_MS);
        deliver(&mut engine, &input(1, 5));
        deliver(
            &mut engine,
            &Packet::PlayerInput(PlayerInput {
                tick: 9,
                input: vec![],
            }),
        );
        deliver(&mut engine, &input(100_000, 1));
        engine.update(FRAME_MS);

        let stats = engine.stats();
        assert_eq!(stats.late_inputs, 1);
        assert_eq!(stats.rejected_inputs, 2);
        assert_eq!(stats.inputs_accepted, 0);
        let (_, entity) = engine.player(&peer()).unwrap();
        assert_eq!(engine.world().get::<Vel>(entity), Some(&Vel(0)));
    }

    #[test]
    fn test_snapshots_follow_interval() {
        let mut engine = connected();
        sent(&mut engine);
        let mut worlds = Vec::new();
        for _ in 0..29 {
            engine.update(FRAME_MS);
            worlds.extend(sent(&mut engine).into_iter().filter_map(|p| match p {
                Packet::World(snapshot) => Some(snapshot),
                _ => None,
            }));
        }
        // 16 ms frames at a 48 ms interval; the last frame emits.
        assert_eq!(worlds.len(), 10);
        assert!(worlds.windows(2).all(|w| w[0].tick < w[1].tick));
        let last = worlds.last().unwrap();
        assert_eq!(last.tick, engine.simulated_tick().unwrap());
        assert_eq!(last.entities.len(), 2);
    }

    #[test]
    fn test_pong_answered_with_sync_result() {
        let mut engine = connected();
        sent(&mut engine);
        for _ in 0..5 {
            engine.update(FRAME_MS);
        }
        deliver(
            &mut engine,
            &Packet::SyncPong(SyncPong {
                server_time_ms: 32.0,
                client_time_ms: 7.5,
            }),
        );
        engine.update(FRAME_MS);

        let result = sent(&mut engine)
            .into_iter()
            .find_map(|p| match p {
                Packet::SyncResult(r) => Some(r),
                _ => None,
            })
            .unwrap();
        assert_eq!(result.client_time_ms, 7.5);
        assert_eq!(result.server_time_ms, 7.0 * FRAME_MS);
        assert_eq!(result.tick_duration_ms, FRAME_MS);
        assert_eq!(result.server_tick, 6);
        let rtt = engine.sessions().session(&peer()).unwrap().rtt_ms.unwrap();
        assert_eq!(rtt, 7.0 * FRAME_MS - 32.0);
    }

    #[test]
    fn test_disconnect_removes_player_and_ignores_stale_input() {
        let mut engine = connected();
        deliver(&mut engine, &input(2, 1));
        engine.update(FRAME_MS);
        let (id, _) = engine.player(&peer()).unwrap();

        engine
            .sessions_mut()
            .on_disconnect(&peer(), DisconnectReason::Closed);
        engine.update(FRAME_MS);
        assert!(engine.player(&peer()).is_none());
        assert!(!engine.inputs().tracks(id));

        // A report that raced the disconnect goes nowhere.
        deliver(&mut engine, &input(10, 1));
        engine.update(FRAME_MS);
        let snapshot = engine.take_snapshot();
        assert!(snapshot.entity(id.0).is_none());
        assert_eq!(snapshot.entities.len(), 1);
    }
}
