//! Client prediction and rewind engine.
//!
//! The client simulates every tick as soon as it is due, recording its input
//! and a snapshot of the result. Authoritative `WORLD` snapshots arrive late
//! and possibly out of order; each one is checked against the local record
//! for the same tick:
//!
//! - older than the last processed snapshot, or older than the last
//!   correction: discarded;
//! - no local record: applied directly as a new baseline;
//! - equal to the local record: nothing happens;
//! - different: the server state is applied at that tick and every later
//!   tick is re-simulated from the recorded inputs (rewind and replay).
//!
//! A divergence further back than `max_rewind_ticks` is not replayed; the
//! client snaps to the server state instead.

use std::collections::BTreeMap;
use std::ops::Range;

use bevy_ecs::prelude::*;
use kestrel_config::SyncConfig;
use kestrel_net::{
    DisconnectReason, NetHandler, Packet, PlayerInput, Reliability, ServerConnection, SessionId,
    SyncPong, WorldSnapshot,
};

use crate::clock::{ClientClock, cap_steps};
use crate::error::SyncError;
use crate::game::NetworkedGame;
use crate::input_history::InputHistory;
use crate::snapshot::{EntityMap, NetworkId, SnapshotSchema};

/// Timing, retention and rewind settings of the client engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    /// Tick duration assumed until the server announces its own.
    pub tick_duration_ms: f64,
    /// Extra lead over the estimated server clock, in milliseconds.
    pub sync_headroom_ms: f64,
    /// Largest divergence age that is replayed rather than snapped.
    pub max_rewind_ticks: u64,
    /// Ticks of local input kept.
    pub input_history_ticks: u64,
    /// Ticks of local snapshots kept.
    pub snapshot_history_ticks: u64,
    /// Silence from the server after which the status becomes `Stalled`.
    pub stall_timeout_ms: f64,
}

impl From<&SyncConfig> for ClientSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            tick_duration_ms: config.tick_duration_ms(),
            sync_headroom_ms: config.sync_headroom_ms,
            max_rewind_ticks: config.max_rewind_ticks,
            input_history_ticks: config.input_history_ticks,
            snapshot_history_ticks: config.snapshot_history_ticks,
            stall_timeout_ms: f64::from(config.stall_timeout_ms),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Connection state shown to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Transport not open yet.
    Connecting,
    /// Connected, waiting for the first clock sync.
    Synchronizing,
    /// Synchronized and receiving traffic.
    Connected,
    /// Synchronized but the server has been silent too long.
    Stalled,
    /// The connection closed.
    Disconnected,
}

/// Rewind diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewindStats {
    /// Snapshots applied without a local record to compare against.
    pub baselines: u64,
    /// Snapshots equal to the local record.
    pub matches: u64,
    /// Divergences resolved by replay.
    pub corrections: u64,
    /// Divergences too old to replay, resolved by snapping.
    pub hard_snaps: u64,
    /// Snapshots older than the last processed one.
    pub stale_discards: u64,
    /// Snapshots older than the last correction.
    pub out_of_order_discards: u64,
    /// Ticks re-simulated across all corrections.
    pub replayed_ticks: u64,
    /// Entities spawned, overwritten or despawned by applied snapshots.
    pub entities_written: u64,
    /// Ticks replayed by the most recent correction.
    pub last_replay: Vec<u64>,
    /// How often each retained tick has been replayed.
    pub replay_counts: BTreeMap<u64, u32>,
}

/// Simulation state, separate from the connection so the connection can
/// dispatch into it.
struct ClientState<G: NetworkedGame> {
    game: G,
    schema: SnapshotSchema,
    world: World,
    entities: EntityMap,
    clock: ClientClock,
    settings: ClientSettings,
    local_time_ms: f64,
    last_server_packet_ms: f64,
    status: ConnectionStatus,
    session: Option<SessionId>,
    controlled: Option<NetworkId>,
    local_input: G::Input,
    inputs: InputHistory<G::Input>,
    history: BTreeMap<u64, WorldSnapshot>,
    last_tick: Option<u64>,
    received_server_snapshot: u64,
    latest_authoritative_snapshot_tick: u64,
    outbox: Vec<(Packet, Reliability)>,
    stats: RewindStats,
}

impl<G: NetworkedGame> ClientState<G> {
    fn dt(&self) -> f32 {
        self.clock.tick_clock().tick_seconds() as f32
    }

    fn controlled_entity(&self) -> Option<(NetworkId, Entity)> {
        let id = self.controlled?;
        Some((id, self.entities.live(&self.world, id)?))
    }

    fn insert_input(&mut self, entity: Entity, input: G::Input) {
        if let Ok(mut entity_mut) = self.world.get_entity_mut(entity) {
            entity_mut.insert(input);
        }
    }

    fn capture(&mut self, tick: u64) {
        let snapshot = self.schema.take(&self.world, &self.entities, tick);
        self.history.insert(tick, snapshot);
    }

    /// One predicted tick: input, gameplay, capture.
    fn fixed_update(&mut self, tick: u64) {
        if let Some((id, entity)) = self.controlled_entity() {
            let input = self.local_input.clone();
            self.inputs.record(id, tick, input.clone());
            match postcard::to_allocvec(&input) {
                Ok(bytes) => self.outbox.push((
                    Packet::PlayerInput(PlayerInput { tick, input: bytes }),
                    Reliability::Unreliable,
                )),
                Err(e) => tracing::warn!("Failed to encode input for tick {tick}: {e}"),
            }
            self.insert_input(entity, input);
        }
        let dt = self.dt();
        self.game.step(&mut self.world, dt);
        self.capture(tick);
        self.last_tick = Some(tick);
        self.prune(tick);
    }

    /// Re-simulates `tick` from the recorded input.
    fn replay_tick(&mut self, tick: u64) {
        if let Some((id, entity)) = self.controlled_entity()
            && self.inputs.tracks(id)
        {
            let input = self.inputs.get(id, tick);
            self.insert_input(entity, input);
        }
        let dt = self.dt();
        self.game.step(&mut self.world, dt);
        self.capture(tick);
        *self.stats.replay_counts.entry(tick).or_default() += 1;
    }

    fn prune(&mut self, tick: u64) {
        let floor = tick.saturating_sub(self.settings.snapshot_history_ticks);
        self.history = self.history.split_off(&floor);
        self.stats.replay_counts = self.stats.replay_counts.split_off(&floor);
        self.inputs.prune(tick);
    }

    fn apply(&mut self, snapshot: &WorldSnapshot) {
        let report = self.schema.apply(&mut self.world, &mut self.entities, snapshot);
        self.stats.entities_written += (report.spawned + report.updated + report.despawned) as u64;
        if self.controlled.is_none()
            && let Some(session) = &self.session
            && let Some(state) = snapshot
                .entities
                .iter()
                .find(|e| e.owner.as_ref() == Some(session))
        {
            let id = NetworkId(state.network_id);
            tracing::info!("Controlling entity {id}");
            self.controlled = Some(id);
        }
    }

    fn on_world(&mut self, snapshot: WorldSnapshot) {
        let tick = snapshot.tick;
        if tick < self.received_server_snapshot {
            self.stats.stale_discards += 1;
            tracing::debug!(
                "Discarding stale snapshot {tick} (processed {})",
                self.received_server_snapshot
            );
            return;
        }
        // Unreachable while every processed snapshot moves
        // `received_server_snapshot` to at least the correction tick; the
        // counter stays at zero unless that ordering breaks.
        if tick < self.latest_authoritative_snapshot_tick {
            self.stats.out_of_order_discards += 1;
            tracing::debug!(
                "Discarding snapshot {tick} older than correction {}",
                self.latest_authoritative_snapshot_tick
            );
            return;
        }

        match self.last_tick {
            // Not simulating yet: show the world, nothing to compare.
            None => {
                self.apply(&snapshot);
                self.stats.baselines += 1;
            }
            Some(current) => match self.history.get(&tick).map(|local| *local == snapshot) {
                None => {
                    self.apply(&snapshot);
                    self.capture(current);
                    self.stats.baselines += 1;
                }
                Some(true) => self.stats.matches += 1,
                Some(false) if current.saturating_sub(tick) > self.settings.max_rewind_ticks => {
                    self.hard_snap(&snapshot, current);
                }
                Some(false) => self.correct(&snapshot, current),
            },
        }
        self.received_server_snapshot = tick;
    }

    fn correct(&mut self, snapshot: &WorldSnapshot, current: u64) {
        let tick = snapshot.tick;
        self.apply(snapshot);
        self.capture(tick);
        self.latest_authoritative_snapshot_tick = tick;

        let replayed: Vec<u64> = (tick + 1..=current).collect();
        for &t in &replayed {
            self.replay_tick(t);
        }
        tracing::debug!(
            "Divergence at tick {tick}, replayed {} ticks up to {current}",
            replayed.len()
        );
        self.stats.corrections += 1;
        self.stats.replayed_ticks += replayed.len() as u64;
        self.stats.last_replay = replayed;
    }

    fn hard_snap(&mut self, snapshot: &WorldSnapshot, current: u64) {
        let tick = snapshot.tick;
        tracing::warn!(
            "Divergence at tick {tick} is {} ticks old (limit {}), snapping",
            current - tick,
            self.settings.max_rewind_ticks
        );
        self.apply(snapshot);
        self.history.retain(|&t, _| t < tick);
        self.capture(current);
        self.latest_authoritative_snapshot_tick = tick;
        self.stats.hard_snaps += 1;
        self.stats.last_replay.clear();
    }

    fn check_stall(&mut self) {
        if self.status == ConnectionStatus::Connected
            && self.local_time_ms - self.last_server_packet_ms > self.settings.stall_timeout_ms
        {
            tracing::warn!(
                "No server traffic for {:.0} ms",
                self.local_time_ms - self.last_server_packet_ms
            );
            self.status = ConnectionStatus::Stalled;
        }
    }
}

impl<G: NetworkedGame> NetHandler for ClientState<G> {
    fn on_connected(&mut self, _: &SessionId) {
        self.status = ConnectionStatus::Synchronizing;
        self.last_server_packet_ms = self.local_time_ms;
    }

    fn on_disconnected(&mut self, _: &SessionId, reason: DisconnectReason) {
        tracing::info!("Disconnected from server ({reason:?})");
        self.status = ConnectionStatus::Disconnected;
    }

    fn on_packet(&mut self, _: &SessionId, packet: Packet) {
        self.last_server_packet_ms = self.local_time_ms;
        if self.status == ConnectionStatus::Stalled {
            tracing::info!("Server traffic resumed");
            self.status = ConnectionStatus::Connected;
        }

        match packet {
            Packet::Welcome(welcome) => {
                tracing::info!("Joined as {}", welcome.session_id);
                if let Err(e) = self.clock.set_tick_duration_ms(welcome.tick_duration_ms) {
                    tracing::warn!("Ignoring announced tick duration: {e}");
                }
                self.session = Some(welcome.session_id);
            }
            Packet::SyncPing(ping) => self.outbox.push((
                Packet::SyncPong(SyncPong {
                    server_time_ms: ping.server_time_ms,
                    client_time_ms: self.local_time_ms,
                }),
                Reliability::Unreliable,
            )),
            Packet::SyncResult(result) => {
                if self.clock.on_sync_result(&result, self.local_time_ms).is_some()
                    && self.status == ConnectionStatus::Synchronizing
                {
                    tracing::info!("Clock synchronized at tick {}", self.clock.tick());
                    self.status = ConnectionStatus::Connected;
                }
            }
            Packet::World(snapshot) => self.on_world(snapshot),
            other => tracing::debug!("Ignoring {} from server", other.opcode()),
        }
    }
}

/// The predicting client of one connection.
pub struct ClientEngine<G: NetworkedGame> {
    connection: ServerConnection,
    state: ClientState<G>,
}

impl<G: NetworkedGame> ClientEngine<G> {
    /// Builds the engine. History retention is raised to cover the rewind
    /// window if configured smaller.
    pub fn new(
        game: G,
        mut settings: ClientSettings,
        connection: ServerConnection,
    ) -> Result<Self, SyncError> {
        let clock = ClientClock::new(settings.tick_duration_ms, settings.sync_headroom_ms)?;
        let schema = game.schema()?;
        let window = settings.max_rewind_ticks + 1;
        settings.snapshot_history_ticks = settings.snapshot_history_ticks.max(window);
        settings.input_history_ticks = settings.input_history_ticks.max(window);

        Ok(Self {
            connection,
            state: ClientState {
                game,
                schema,
                world: World::new(),
                entities: EntityMap::new(),
                clock,
                inputs: InputHistory::new(settings.input_history_ticks),
                settings,
                local_time_ms: 0.0,
                last_server_packet_ms: 0.0,
                status: ConnectionStatus::Connecting,
                session: None,
                controlled: None,
                local_input: G::Input::default(),
                history: BTreeMap::new(),
                last_tick: None,
                received_server_snapshot: 0,
                latest_authoritative_snapshot_tick: 0,
                outbox: Vec::new(),
                stats: RewindStats::default(),
            },
        })
    }

    /// Sets the input sampled for every following tick.
    pub fn set_input(&mut self, input: G::Input) {
        self.state.local_input = input;
    }

    /// Advances local time by `delta_ms`: handles every queued server packet,
    /// then predicts each tick entered. Returns the predicted ticks.
    pub fn update(&mut self, delta_ms: f64) -> Range<u64> {
        let delta_ms = if delta_ms.is_finite() { delta_ms.max(0.0) } else { 0.0 };
        self.state.local_time_ms += delta_ms;
        self.connection.dispatch(&mut self.state);
        self.flush();
        self.state.check_stall();

        let ticks = cap_steps(self.state.clock.advance(delta_ms));
        if self.state.status == ConnectionStatus::Disconnected {
            return ticks.end..ticks.end;
        }
        for tick in ticks.clone() {
            self.state.fixed_update(tick);
        }
        self.flush();
        ticks
    }

    fn flush(&mut self) {
        for (packet, reliability) in self.state.outbox.drain(..) {
            self.connection.send(&packet, reliability);
        }
    }

    /// Snapshot of the live world tagged with `tick`.
    pub fn take_snapshot(&self, tick: u64) -> WorldSnapshot {
        self.state
            .schema
            .take(&self.state.world, &self.state.entities, tick)
    }

    /// The connection to the server, for transports.
    pub fn connection(&self) -> &ServerConnection {
        &self.connection
    }

    /// The connection to the server, for transports.
    pub fn connection_mut(&mut self) -> &mut ServerConnection {
        &mut self.connection
    }

    /// Connection status for display.
    pub fn status(&self) -> ConnectionStatus {
        self.state.status
    }

    /// Last predicted tick, `None` before the first.
    pub fn tick(&self) -> Option<u64> {
        self.state.last_tick
    }

    /// The clock estimate.
    pub fn clock(&self) -> &ClientClock {
        &self.state.clock
    }

    /// Session id announced by the server.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.state.session.as_ref()
    }

    /// Network id and live entity this client controls.
    pub fn controlled(&self) -> Option<(NetworkId, Entity)> {
        self.state.controlled_entity()
    }

    /// The predicted world.
    pub fn world(&self) -> &World {
        &self.state.world
    }

    /// The predicted world, mutably (for presentation-only components).
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.state.world
    }

    /// The network id table.
    pub fn entities(&self) -> &EntityMap {
        &self.state.entities
    }

    /// The networked component declaration.
    pub fn schema(&self) -> &SnapshotSchema {
        &self.state.schema
    }

    /// Local snapshots by tick.
    pub fn snapshot_history(&self) -> &BTreeMap<u64, WorldSnapshot> {
        &self.state.history
    }

    /// Recorded local input.
    pub fn inputs(&self) -> &InputHistory<G::Input> {
        &self.state.inputs
    }

    /// Tick of the last snapshot processed.
    pub fn received_server_snapshot(&self) -> u64 {
        self.state.received_server_snapshot
    }

    /// Tick of the last snapshot that caused a correction.
    pub fn latest_authoritative_snapshot_tick(&self) -> u64 {
        self.state.latest_authoritative_snapshot_tick
    }

    /// Rewind diagnostics.
    pub fn stats(&self) -> &RewindStats {
        &self.state.stats
    }

    /// Effective settings.
    pub fn settings(&self) -> &ClientSettings {
        &self.state.settings
    }
}
