//! Per-peer sessions and the server-side session registry.
//!
//! A [`Session`] holds one peer's inbound and outbound packet queues plus
//! traffic counters. The [`SessionRegistry`] owns every session of one room:
//! transports push raw bytes in with [`SessionRegistry::receive`] and pull
//! encoded bytes out with [`SessionRegistry::drain_outgoing`]; the simulation
//! reads decoded packets once per tick through [`SessionRegistry::dispatch`].
//!
//! Nothing here blocks and nothing here returns an error to the simulation:
//! undecodable bytes and sends to vanished peers are logged and dropped.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::messages::{Packet, PacketCodec};

/// Opaque identifier of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Wraps a string id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id a client uses for its single server peer.
    pub fn server() -> Self {
        Self::new("server")
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery guarantee requested for an outgoing packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// Delivered at least once, in order per peer.
    Reliable,
    /// May be dropped or reordered.
    Unreliable,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The transport closed the channel.
    Closed,
    /// No inbound traffic within the idle timeout.
    Timeout,
    /// The server refused or removed the peer.
    Kicked,
}

/// Encoded bytes waiting to be written to a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    /// Destination peer.
    pub session: SessionId,
    /// Requested delivery guarantee.
    pub reliability: Reliability,
    /// Wire bytes produced by the codec.
    pub bytes: Vec<u8>,
}

/// Narrow callback interface through which the simulation learns about
/// connections and packets.
pub trait NetHandler {
    /// A peer connected (or the handshake with the server completed).
    fn on_connected(&mut self, session: &SessionId);
    /// A peer went away; its entities should be removed.
    fn on_disconnected(&mut self, session: &SessionId, reason: DisconnectReason);
    /// A decoded packet arrived from `session`.
    fn on_packet(&mut self, session: &SessionId, packet: Packet);
}

/// Connection lifecycle notifications, delivered before packets.
#[derive(Debug, Clone, PartialEq)]
enum Lifecycle {
    Connected(SessionId),
    Disconnected(SessionId, DisconnectReason),
}

/// One connected peer.
#[derive(Debug)]
pub struct Session {
    /// Peer identifier.
    pub id: SessionId,
    /// Decoded packets not yet seen by the simulation.
    pub inbound: VecDeque<Packet>,
    /// Encoded packets not yet handed to the transport.
    pub outbound: VecDeque<(Reliability, Vec<u8>)>,
    /// Total wire bytes received.
    pub bytes_received: u64,
    /// Total wire bytes queued for sending.
    pub bytes_sent: u64,
    /// Inbound payloads that failed to decode.
    pub rejected_packets: u64,
    /// Timestamp of the last received payload, for timeout detection.
    pub last_activity: Instant,
    /// Last measured round-trip time in milliseconds.
    pub rtt_ms: Option<f64>,
}

impl Session {
    /// Creates an empty session.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            bytes_received: 0,
            bytes_sent: 0,
            rejected_packets: 0,
            last_activity: Instant::now(),
            rtt_ms: None,
        }
    }
}

/// All sessions of one room.
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, Session>,
    lifecycle: VecDeque<Lifecycle>,
    codec: PacketCodec,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Creates an empty registry accepting at most `max_sessions` peers.
    pub fn new(codec: PacketCodec, max_sessions: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            lifecycle: VecDeque::new(),
            codec,
            max_sessions,
        }
    }

    /// Registers a newly connected peer. Returns `false` if the room is full
    /// or the id is already in use.
    pub fn on_connect(&mut self, id: SessionId) -> bool {
        if self.sessions.contains_key(&id) {
            tracing::warn!("Session {id} already connected");
            return false;
        }
        if self.sessions.len() >= self.max_sessions {
            tracing::warn!("Session limit {} reached, rejecting {id}", self.max_sessions);
            return false;
        }
        tracing::info!("Session {id} connected");
        self.sessions.insert(id.clone(), Session::new(id.clone()));
        self.lifecycle.push_back(Lifecycle::Connected(id));
        true
    }

    /// Removes a peer. Queued inbound packets from it are discarded.
    pub fn on_disconnect(&mut self, id: &SessionId, reason: DisconnectReason) {
        if let Some(session) = self.sessions.remove(id) {
            tracing::info!(
                "Session {id} disconnected ({reason:?}), {} bytes in / {} bytes out",
                session.bytes_received,
                session.bytes_sent
            );
            self.lifecycle
                .push_back(Lifecycle::Disconnected(id.clone(), reason));
        }
    }

    /// Decodes raw bytes from a peer and queues the packet.
    pub fn receive(&mut self, id: &SessionId, bytes: &[u8]) {
        let Some(session) = self.sessions.get_mut(id) else {
            tracing::debug!("Dropping {} bytes from unknown session {id}", bytes.len());
            return;
        };
        session.bytes_received += bytes.len() as u64;
        session.last_activity = Instant::now();
        match self.codec.decode(bytes) {
            Ok(packet) => session.inbound.push_back(packet),
            Err(e) => {
                session.rejected_packets += 1;
                tracing::debug!("Dropping malformed packet from {id}: {e}");
            }
        }
    }

    /// Queues `packet` for one peer. A missing peer is a logged no-op.
    pub fn send_to(&mut self, id: &SessionId, packet: &Packet, reliability: Reliability) {
        let Some(bytes) = self.encode(packet) else {
            return;
        };
        match self.sessions.get_mut(id) {
            Some(session) => enqueue(session, reliability, bytes),
            None => tracing::debug!("send_to {id}: no such session, {} dropped", packet.opcode()),
        }
    }

    /// Queues `packet` for every peer except `excluded`.
    pub fn send_except(&mut self, excluded: &SessionId, packet: &Packet, reliability: Reliability) {
        let Some(bytes) = self.encode(packet) else {
            return;
        };
        for session in self.sessions.values_mut().filter(|s| &s.id != excluded) {
            enqueue(session, reliability, bytes.clone());
        }
    }

    /// Queues `packet` for every peer.
    pub fn broadcast(&mut self, packet: &Packet, reliability: Reliability) {
        let Some(bytes) = self.encode(packet) else {
            return;
        };
        for session in self.sessions.values_mut() {
            enqueue(session, reliability, bytes.clone());
        }
    }

    /// Takes every queued outgoing payload, in per-peer order.
    pub fn drain_outgoing(&mut self) -> Vec<Outgoing> {
        let mut out = Vec::new();
        for session in self.sessions.values_mut() {
            out.extend(session.outbound.drain(..).map(|(reliability, bytes)| Outgoing {
                session: session.id.clone(),
                reliability,
                bytes,
            }));
        }
        out
    }

    /// Delivers queued lifecycle events, then every queued packet, to
    /// `handler`. Called once per tick by the simulation.
    pub fn dispatch(&mut self, handler: &mut impl NetHandler) {
        while let Some(event) = self.lifecycle.pop_front() {
            match event {
                Lifecycle::Connected(id) => handler.on_connected(&id),
                Lifecycle::Disconnected(id, reason) => handler.on_disconnected(&id, reason),
            }
        }
        let ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        for id in ids {
            let packets: Vec<Packet> = match self.sessions.get_mut(&id) {
                Some(session) => session.inbound.drain(..).collect(),
                None => continue,
            };
            for packet in packets {
                handler.on_packet(&id, packet);
            }
        }
    }

    /// Disconnects every session silent for longer than `timeout`. Returns
    /// the removed ids so the transport can close their channels.
    pub fn timeout_check(&mut self, timeout: Duration) -> Vec<SessionId> {
        let stale: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.last_activity.elapsed() > timeout)
            .map(|s| s.id.clone())
            .collect();
        for id in &stale {
            tracing::warn!("Session {id} timed out");
            self.on_disconnect(id, DisconnectReason::Timeout);
        }
        stale
    }

    /// Records a round-trip measurement for a peer.
    pub fn record_rtt(&mut self, id: &SessionId, rtt_ms: f64) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.rtt_ms = Some(rtt_ms);
        }
    }

    /// Returns a session by id.
    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Returns a session by id, mutably.
    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Returns `true` if the peer is connected.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Connected peer ids in stable order.
    pub fn ids(&self) -> impl Iterator<Item = &SessionId> {
        self.sessions.keys()
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if no peer is connected.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn encode(&self, packet: &Packet) -> Option<Vec<u8>> {
        match self.codec.encode(packet) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("Failed to encode {}: {e}", packet.opcode());
                None
            }
        }
    }
}

fn enqueue(session: &mut Session, reliability: Reliability, bytes: Vec<u8>) {
    session.bytes_sent += bytes.len() as u64;
    session.outbound.push_back((reliability, bytes));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{PlayerInput, SyncPing};

    #[derive(Default)]
    struct Recorder {
        connected: Vec<SessionId>,
        disconnected: Vec<(SessionId, DisconnectReason)>,
        packets: Vec<(SessionId, Packet)>,
    }

    impl NetHandler for Recorder {
        fn on_connected(&mut self, session: &SessionId) {
            self.connected.push(session.clone());
        }
        fn on_disconnected(&mut self, session: &SessionId, reason: DisconnectReason) {
            self.disconnected.push((session.clone(), reason));
        }
        fn on_packet(&mut self, session: &SessionId, packet: Packet) {
            self.packets.push((session.clone(), packet));
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(PacketCodec::default(), 4)
    }

    fn ping(t: f64) -> Packet {
        Packet::SyncPing(SyncPing { server_time_ms: t })
    }

    fn peer(n: u32) -> SessionId {
        SessionId::new(format!("peer-{n}"))
    }

    #[test]
    fn test_connect_then_packets_dispatch_in_order() {
        let codec = PacketCodec::default();
        let mut reg = registry();
        reg.on_connect(peer(1));
        let input = Packet::PlayerInput(PlayerInput {
            tick: 7,
            input: vec![1, 2],
        });
        reg.receive(&peer(1), &codec.encode(&input).unwrap());

        let mut rec = Recorder::default();
        reg.dispatch(&mut rec);
        assert_eq!(rec.connected, vec![peer(1)]);
        assert_eq!(rec.packets, vec![(peer(1), input)]);

        // Queues are drained.
        let mut again = Recorder::default();
        reg.dispatch(&mut again);
        assert!(again.connected.is_empty() && again.packets.is_empty());
    }

    #[test]
    fn test_malformed_bytes_are_counted_not_dispatched() {
        let mut reg = registry();
        reg.on_connect(peer(1));
        reg.receive(&peer(1), &[0x00, 0x01, 0xFF, 0xFF]);
        reg.receive(&peer(1), &[]);

        let mut rec = Recorder::default();
        reg.dispatch(&mut rec);
        assert!(rec.packets.is_empty());
        assert_eq!(reg.session(&peer(1)).unwrap().rejected_packets, 2);
    }

    #[test]
    fn test_oversized_lz4_prefix_is_rejected_packet() {
        let mut reg = registry();
        reg.on_connect(peer(1));
        reg.receive(&peer(1), &[0x01, 0xFF, 0xFF, 0xFF, 0xF0, 0x00]);

        let mut rec = Recorder::default();
        reg.dispatch(&mut rec);
        assert!(rec.packets.is_empty());
        assert_eq!(reg.session(&peer(1)).unwrap().rejected_packets, 1);
    }

    #[test]
    fn test_unknown_session_bytes_ignored() {
        let mut reg = registry();
        reg.receive(&peer(9), &[1, 2, 3]);
        let mut rec = Recorder::default();
        reg.dispatch(&mut rec);
        assert!(rec.packets.is_empty());
    }

    #[test]
    fn test_send_to_missing_peer_is_noop() {
        let mut reg = registry();
        reg.send_to(&peer(3), &ping(1.0), Reliability::Unreliable);
        assert!(reg.drain_outgoing().is_empty());
    }

    #[test]
    fn test_broadcast_and_send_except() {
        let mut reg = registry();
        for n in 1..=3 {
            reg.on_connect(peer(n));
        }
        reg.broadcast(&ping(1.0), Reliability::Unreliable);
        assert_eq!(reg.drain_outgoing().len(), 3);

        reg.send_except(&peer(2), &ping(2.0), Reliability::Reliable);
        let out = reg.drain_outgoing();
        let targets: Vec<_> = out.iter().map(|o| o.session.clone()).collect();
        assert_eq!(targets, vec![peer(1), peer(3)]);
        assert!(out.iter().all(|o| o.reliability == Reliability::Reliable));
        assert!(reg.session(&peer(1)).unwrap().bytes_sent > 0);
    }

    #[test]
    fn test_disconnect_discards_inbound_and_notifies() {
        let codec = PacketCodec::default();
        let mut reg = registry();
        reg.on_connect(peer(1));
        reg.receive(&peer(1), &codec.encode(&ping(0.0)).unwrap());
        reg.on_disconnect(&peer(1), DisconnectReason::Closed);

        let mut rec = Recorder::default();
        reg.dispatch(&mut rec);
        assert_eq!(rec.connected, vec![peer(1)]);
        assert_eq!(rec.disconnected, vec![(peer(1), DisconnectReason::Closed)]);
        assert!(rec.packets.is_empty());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_session_limit_enforced() {
        let mut reg = SessionRegistry::new(PacketCodec::default(), 2);
        assert!(reg.on_connect(peer(1)));
        assert!(reg.on_connect(peer(2)));
        assert!(!reg.on_connect(peer(3)));
        assert!(!reg.on_connect(peer(1)));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_timeout_triggers_disconnect() {
        let mut reg = registry();
        reg.on_connect(peer(1));
        reg.on_connect(peer(2));
        reg.session_mut(&peer(1)).unwrap().last_activity =
            Instant::now() - Duration::from_secs(60);

        let removed = reg.timeout_check(Duration::from_secs(15));
        assert_eq!(removed, vec![peer(1)]);
        assert!(!reg.contains(&peer(1)));
        assert!(reg.contains(&peer(2)));

        let mut rec = Recorder::default();
        reg.dispatch(&mut rec);
        assert_eq!(rec.disconnected, vec![(peer(1), DisconnectReason::Timeout)]);
    }
}
