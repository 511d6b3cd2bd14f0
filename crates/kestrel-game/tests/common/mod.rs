//! Wiring shared by the end-to-end tests: one server and any number of
//! clients joined over an in-memory network.

#![allow(dead_code)]

use kestrel_game::{PuckArena, Position};
use kestrel_net::{
    LoopbackNetwork, LossyLink, Packet, PacketCodec, ServerConnection, SessionId, SessionRegistry,
    WorldSnapshot,
};
use kestrel_sync::{
    ClientEngine, ClientSettings, NetworkId, ServerEngine, ServerSettings, read_component,
};

/// Frame length equal to the tick length, so every frame is one tick.
pub const FRAME_MS: f64 = 16.0;

pub const PUCK: NetworkId = NetworkId(1);

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
        stall_timeout_ms: 2000.0,
    }
}

pub fn new_client() -> ClientEngine<PuckArena> {
    ClientEngine::new(
        PuckArena::new(),
        client_settings(),
        ServerConnection::new(PacketCodec::default()),
    )
    .unwrap()
}

/// Hands `packet` to the client as if it arrived from the server.
pub fn feed(client: &mut ClientEngine<PuckArena>, packet: Packet) {
    let bytes = PacketCodec::default().encode(&packet).unwrap();
    client.connection_mut().receive(&bytes);
}

pub fn position(snapshot: &WorldSnapshot, id: NetworkId) -> Position {
    read_component::<Position>(snapshot.entity(id.0).unwrap(), "Position").unwrap()
}

pub struct Arena {
    pub server: ServerEngine<PuckArena>,
    pub clients: Vec<(SessionId, ClientEngine<PuckArena>)>,
    pub net: LoopbackNetwork,
}

impl Arena {
    pub fn new() -> Self {
        Self {
            server: ServerEngine::new(
                PuckArena::new(),
                server_settings(),
                SessionRegistry::new(PacketCodec::default(), 8),
            )
            .unwrap(),
            clients: Vec::new(),
            net: LoopbackNetwork::new(),
        }
    }

    /// Connects a new client; returns its index.
    pub fn join(&mut self, name: &str, up: LossyLink, down: LossyLink) -> usize {
        let id = SessionId::new(name);
        let mut client = new_client();
        assert!(self.net.connect(
            id.clone(),
            up,
            down,
            self.server.sessions_mut(),
            client.connection_mut(),
        ));
        self.clients.push((id, client));
        self.clients.len() - 1
    }

    pub fn disconnect(&mut self, index: usize) {
        let (id, client) = &mut self.clients[index];
        self.net
            .disconnect(id, self.server.sessions_mut(), client.connection_mut());
    }

    pub fn heal(&mut self) {
        for (id, _) in &self.clients {
            self.net
                .set_links(id, LossyLink::perfect(), LossyLink::perfect());
        }
    }

    pub fn client(&mut self, index: usize) -> &mut ClientEngine<PuckArena> {
        &mut self.clients[index].1
    }

    /// One frame: every client, then the server.
    pub fn frame(&mut self) {
        for (id, client) in &mut self.clients {
            self.net.pump_client(id, client.connection_mut());
            client.update(FRAME_MS);
        }
        self.net.pump_server(self.server.sessions_mut());
        self.server.update(FRAME_MS);
    }

    pub fn run(&mut self, frames: usize) {
        for _ in 0..frames {
            self.frame();
        }
    }
}
