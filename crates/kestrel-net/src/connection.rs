//! Client-side connection to the server.
//!
//! The client-side counterpart of [`SessionRegistry`](crate::SessionRegistry):
//! a single peer (the server, addressed as [`SessionId::server`]) with its own
//! inbound/outbound queues and lifecycle state.

use std::collections::VecDeque;

use crate::messages::{Packet, PacketCodec};
use crate::session::{DisconnectReason, NetHandler, Reliability, SessionId};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport not yet established.
    Connecting,
    /// Transport established, packets flow.
    Connected,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// The client's link to the server.
pub struct ServerConnection {
    state: ConnectionState,
    codec: PacketCodec,
    server: SessionId,
    inbound: VecDeque<Packet>,
    outbound: VecDeque<(Reliability, Vec<u8>)>,
    pending_open: bool,
    pending_close: Option<DisconnectReason>,
    bytes_received: u64,
    bytes_sent: u64,
    rejected_packets: u64,
}

impl ServerConnection {
    /// Creates a connection in the [`ConnectionState::Connecting`] state.
    pub fn new(codec: PacketCodec) -> Self {
        Self {
            state: ConnectionState::Connecting,
            codec,
            server: SessionId::server(),
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            pending_open: false,
            pending_close: None,
            bytes_received: 0,
            bytes_sent: 0,
            rejected_packets: 0,
        }
    }

    /// The transport reports the channel as open.
    pub fn on_open(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
            self.pending_open = true;
        }
    }

    /// The transport reports the channel as closed.
    pub fn on_closed(&mut self, reason: DisconnectReason) {
        if self.state != ConnectionState::Disconnected {
            tracing::info!("Connection to server closed ({reason:?})");
            self.state = ConnectionState::Disconnected;
            self.inbound.clear();
            self.outbound.clear();
            self.pending_close = Some(reason);
        }
    }

    /// Decodes raw bytes from the server and queues the packet.
    pub fn receive(&mut self, bytes: &[u8]) {
        if self.state != ConnectionState::Connected {
            return;
        }
        self.bytes_received += bytes.len() as u64;
        match self.codec.decode(bytes) {
            Ok(packet) => self.inbound.push_back(packet),
            Err(e) => {
                self.rejected_packets += 1;
                tracing::debug!("Dropping malformed packet from server: {e}");
            }
        }
    }

    /// Queues a packet for the server. A closed connection drops it.
    pub fn send(&mut self, packet: &Packet, reliability: Reliability) {
        if self.state != ConnectionState::Connected {
            tracing::debug!("send {}: connection not open, dropped", packet.opcode());
            return;
        }
        match self.codec.encode(packet) {
            Ok(bytes) => {
                self.bytes_sent += bytes.len() as u64;
                self.outbound.push_back((reliability, bytes));
            }
            Err(e) => tracing::warn!("Failed to encode {}: {e}", packet.opcode()),
        }
    }

    /// Takes every queued outgoing payload.
    pub fn drain_outgoing(&mut self) -> Vec<(Reliability, Vec<u8>)> {
        self.outbound.drain(..).collect()
    }

    /// Delivers lifecycle changes and queued packets to `handler`.
    pub fn dispatch(&mut self, handler: &mut impl NetHandler) {
        if std::mem::take(&mut self.pending_open) {
            handler.on_connected(&self.server);
        }
        while let Some(packet) = self.inbound.pop_front() {
            handler.on_packet(&self.server, packet);
        }
        if let Some(reason) = self.pending_close.take() {
            handler.on_disconnected(&self.server, reason);
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Total wire bytes received.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Total wire bytes queued for sending.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Inbound payloads that failed to decode.
    pub fn rejected_packets(&self) -> u64 {
        self.rejected_packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SyncPong;

    #[derive(Default)]
    struct Events(Vec<String>);

    impl NetHandler for Events {
        fn on_connected(&mut self, _: &SessionId) {
            self.0.push("connected".into());
        }
        fn on_disconnected(&mut self, _: &SessionId, reason: DisconnectReason) {
            self.0.push(format!("disconnected:{reason:?}"));
        }
        fn on_packet(&mut self, session: &SessionId, packet: Packet) {
            self.0.push(format!("{session}:{}", packet.opcode()));
        }
    }

    fn pong() -> Packet {
        Packet::SyncPong(SyncPong {
            server_time_ms: 1.0,
            client_time_ms: 2.0,
        })
    }

    #[test]
    fn test_send_before_open_is_dropped() {
        let mut conn = ServerConnection::new(PacketCodec::default());
        conn.send(&pong(), Reliability::Unreliable);
        assert!(conn.drain_outgoing().is_empty());

        conn.on_open();
        conn.send(&pong(), Reliability::Unreliable);
        assert_eq!(conn.drain_outgoing().len(), 1);
        assert!(conn.bytes_sent() > 0);
    }

    #[test]
    fn test_lifecycle_dispatch_order() {
        let codec = PacketCodec::default();
        let mut conn = ServerConnection::new(codec.clone());
        conn.on_open();
        conn.receive(&codec.encode(&pong()).unwrap());

        let mut events = Events::default();
        conn.dispatch(&mut events);
        assert_eq!(events.0, vec!["connected", "server:CLIENT_SYNC_PONG"]);

        conn.on_closed(DisconnectReason::Closed);
        conn.dispatch(&mut events);
        assert_eq!(events.0.last().unwrap(), "disconnected:Closed");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut conn = ServerConnection::new(PacketCodec::default());
        conn.on_open();
        conn.receive(&[0x07, 0x00]);
        let mut events = Events::default();
        conn.dispatch(&mut events);
        assert_eq!(events.0, vec!["connected"]);
        assert_eq!(conn.rejected_packets(), 1);
    }
}
