//! In-memory simulated link with configurable loss and reordering.
//!
//! Stands in for a real transport in tests and local sessions. Reliable
//! payloads are always delivered in send order. Unreliable payloads may be
//! dropped, or held back and delivered after payloads sent later.
//!
//! [`LoopbackNetwork`] wires a [`SessionRegistry`] to any number of
//! [`ServerConnection`]s through one link per direction.

use std::collections::{BTreeMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::connection::ServerConnection;
use crate::session::{DisconnectReason, Reliability, SessionId, SessionRegistry};

/// Delivery counters for one link direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Payloads handed to [`LossyLink::send`].
    pub sent: u64,
    /// Unreliable payloads discarded.
    pub dropped: u64,
    /// Unreliable payloads delivered late.
    pub reordered: u64,
    /// Payloads returned by [`LossyLink::deliver`].
    pub delivered: u64,
}

/// One direction of a simulated channel.
pub struct LossyLink {
    drop_rate: f64,
    reorder_rate: f64,
    rng: StdRng,
    in_flight: VecDeque<Vec<u8>>,
    held_now: Vec<Vec<u8>>,
    held_next: Vec<Vec<u8>>,
    stats: LinkStats,
}

impl LossyLink {
    /// Creates a link. Rates are clamped to `0.0..=1.0`.
    pub fn new(drop_rate: f64, reorder_rate: f64, seed: u64) -> Self {
        Self {
            drop_rate: drop_rate.clamp(0.0, 1.0),
            reorder_rate: reorder_rate.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
            in_flight: VecDeque::new(),
            held_now: Vec::new(),
            held_next: Vec::new(),
            stats: LinkStats::default(),
        }
    }

    /// A link that never drops or reorders.
    pub fn perfect() -> Self {
        Self::new(0.0, 0.0, 0)
    }

    /// Puts a payload on the wire.
    pub fn send(&mut self, reliability: Reliability, bytes: Vec<u8>) {
        self.stats.sent += 1;
        if reliability == Reliability::Unreliable {
            if self.rng.random_bool(self.drop_rate) {
                self.stats.dropped += 1;
                return;
            }
            if self.rng.random_bool(self.reorder_rate) {
                self.stats.reordered += 1;
                self.held_next.push(bytes);
                return;
            }
        }
        self.in_flight.push_back(bytes);
    }

    /// Returns everything that arrives this step: payloads sent since the
    /// last call, followed by unreliable payloads held back one step.
    pub fn deliver(&mut self) -> Vec<Vec<u8>> {
        let mut out: Vec<Vec<u8>> = self.in_flight.drain(..).collect();
        out.append(&mut self.held_now);
        std::mem::swap(&mut self.held_now, &mut self.held_next);
        self.stats.delivered += out.len() as u64;
        out
    }

    /// Returns `true` if nothing is in flight or held back.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.held_now.is_empty() && self.held_next.is_empty()
    }

    /// Delivery counters.
    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}

/// Client → server and server → client links of one peer.
struct LinkPair {
    up: LossyLink,
    down: LossyLink,
}

/// In-process network between a server's sessions and its clients.
///
/// Each `pump_*` call moves one step of traffic: queued outgoing payloads go
/// onto the links and whatever the links deliver is handed to the receiver.
#[derive(Default)]
pub struct LoopbackNetwork {
    peers: BTreeMap<SessionId, LinkPair>,
}

impl LoopbackNetwork {
    /// Creates a network with no peers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a client as `id`. `up` carries client → server traffic and
    /// `down` server → client traffic. Returns `false` if the registry
    /// refuses the session.
    pub fn connect(
        &mut self,
        id: SessionId,
        up: LossyLink,
        down: LossyLink,
        sessions: &mut SessionRegistry,
        conn: &mut ServerConnection,
    ) -> bool {
        if !sessions.on_connect(id.clone()) {
            return false;
        }
        conn.on_open();
        self.peers.insert(id, LinkPair { up, down });
        true
    }

    /// Drops the peer on both ends.
    pub fn disconnect(
        &mut self,
        id: &SessionId,
        sessions: &mut SessionRegistry,
        conn: &mut ServerConnection,
    ) {
        self.peers.remove(id);
        sessions.on_disconnect(id, DisconnectReason::Closed);
        conn.on_closed(DisconnectReason::Closed);
    }

    /// Replaces the links of a connected peer, e.g. to heal a lossy network.
    pub fn set_links(&mut self, id: &SessionId, up: LossyLink, down: LossyLink) {
        if let Some(pair) = self.peers.get_mut(id) {
            *pair = LinkPair { up, down };
        }
    }

    /// Sends the server's queued payloads and delivers client traffic to it.
    pub fn pump_server(&mut self, sessions: &mut SessionRegistry) {
        for out in sessions.drain_outgoing() {
            match self.peers.get_mut(&out.session) {
                Some(pair) => pair.down.send(out.reliability, out.bytes),
                None => tracing::debug!("No link to {}, dropping payload", out.session),
            }
        }
        for (id, pair) in &mut self.peers {
            for bytes in pair.up.deliver() {
                sessions.receive(id, &bytes);
            }
        }
    }

    /// Sends one client's queued payloads and delivers server traffic to it.
    pub fn pump_client(&mut self, id: &SessionId, conn: &mut ServerConnection) {
        let Some(pair) = self.peers.get_mut(id) else {
            conn.drain_outgoing();
            return;
        };
        for (reliability, bytes) in conn.drain_outgoing() {
            pair.up.send(reliability, bytes);
        }
        for bytes in pair.down.deliver() {
            conn.receive(&bytes);
        }
    }

    /// Up and down link counters of a peer.
    pub fn stats(&self, id: &SessionId) -> Option<(LinkStats, LinkStats)> {
        self.peers
            .get(id)
            .map(|pair| (pair.up.stats(), pair.down.stats()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Packet, PacketCodec, PlayerInput, SyncPing};
    use crate::session::NetHandler;

    #[derive(Default)]
    struct Inbox(Vec<(SessionId, Packet)>);

    impl NetHandler for Inbox {
        fn on_connected(&mut self, _: &SessionId) {}
        fn on_disconnected(&mut self, _: &SessionId, _: DisconnectReason) {}
        fn on_packet(&mut self, session: &SessionId, packet: Packet) {
            self.0.push((session.clone(), packet));
        }
    }

    #[test]
    fn test_perfect_link_preserves_order() {
        let mut link = LossyLink::perfect();
        for i in 0..5u8 {
            link.send(Reliability::Unreliable, vec![i]);
        }
        assert_eq!(link.deliver(), (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
        assert!(link.is_idle());
    }

    #[test]
    fn test_reliable_never_dropped() {
        let mut link = LossyLink::new(1.0, 1.0, 7);
        for i in 0..20u8 {
            link.send(Reliability::Reliable, vec![i]);
        }
        let delivered = link.deliver();
        assert_eq!(delivered.len(), 20);
        assert!(delivered.windows(2).all(|w| w[0][0] < w[1][0]));
    }

    #[test]
    fn test_full_drop_rate_drops_unreliable() {
        let mut link = LossyLink::new(1.0, 0.0, 1);
        for i in 0..10u8 {
            link.send(Reliability::Unreliable, vec![i]);
        }
        assert!(link.deliver().is_empty());
        assert_eq!(link.stats().dropped, 10);
    }

    #[test]
    fn test_reordered_payload_arrives_after_later_one() {
        let mut link = LossyLink::new(0.0, 1.0, 3);
        link.send(Reliability::Unreliable, vec![1]);
        assert!(link.deliver().is_empty());

        link.send(Reliability::Reliable, vec![2]);
        assert_eq!(link.deliver(), vec![vec![2], vec![1]]);
        assert_eq!(link.stats().reordered, 1);
        assert!(link.is_idle());
    }

    #[test]
    fn test_same_seed_same_losses() {
        let run = |seed| {
            let mut link = LossyLink::new(0.3, 0.2, seed);
            let mut arrived = Vec::new();
            for i in 0..100u8 {
                link.send(Reliability::Unreliable, vec![i]);
                arrived.extend(link.deliver());
            }
            arrived
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_loopback_moves_packets_both_ways() {
        let mut sessions = SessionRegistry::new(PacketCodec::default(), 4);
        let mut conn = ServerConnection::new(PacketCodec::default());
        let mut net = LoopbackNetwork::new();
        let id = SessionId::new("peer-1");
        assert!(net.connect(
            id.clone(),
            LossyLink::perfect(),
            LossyLink::perfect(),
            &mut sessions,
            &mut conn
        ));

        let ping = Packet::SyncPing(SyncPing {
            server_time_ms: 5.0,
        });
        sessions.send_to(&id, &ping, Reliability::Unreliable);
        net.pump_server(&mut sessions);
        net.pump_client(&id, &mut conn);
        let mut client_inbox = Inbox::default();
        conn.dispatch(&mut client_inbox);
        assert_eq!(client_inbox.0, vec![(SessionId::server(), ping)]);

        let input = Packet::PlayerInput(PlayerInput {
            tick: 1,
            input: vec![],
        });
        conn.send(&input, Reliability::Unreliable);
        net.pump_client(&id, &mut conn);
        net.pump_server(&mut sessions);
        let mut server_inbox = Inbox::default();
        sessions.dispatch(&mut server_inbox);
        assert_eq!(server_inbox.0, vec![(id.clone(), input)]);
        assert_eq!(net.stats(&id).unwrap().0.delivered, 1);
    }

    #[test]
    fn test_loopback_disconnect_closes_both_ends() {
        let mut sessions = SessionRegistry::new(PacketCodec::default(), 4);
        let mut conn = ServerConnection::new(PacketCodec::default());
        let mut net = LoopbackNetwork::new();
        let id = SessionId::new("peer-1");
        net.connect(
            id.clone(),
            LossyLink::perfect(),
            LossyLink::perfect(),
            &mut sessions,
            &mut conn,
        );
        net.disconnect(&id, &mut sessions, &mut conn);
        assert!(!sessions.contains(&id));
        assert_eq!(conn.state(), crate::ConnectionState::Disconnected);
        assert!(net.stats(&id).is_none());
    }
}
