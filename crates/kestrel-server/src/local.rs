//! Server and bots in one process, joined by simulated lossy links.
//!
//! Runs in simulated time, as fast as the machine allows, and is fully
//! reproducible for a given link seed.

use kestrel_config::Config;
use kestrel_game::PuckArena;
use kestrel_net::{
    IdGenerator, LoopbackNetwork, LossyLink, ServerConnection, SessionId, SessionRegistry,
};
use kestrel_sync::{
    ClientEngine, ClientSettings, ConnectionStatus, RewindStats, ServerEngine, ServerSettings,
    ServerStats,
};

use crate::bot::wander;
use crate::error::ServerError;
use crate::packet_codec;

/// Final state of a local session.
#[derive(Debug, Clone)]
pub struct LocalReport {
    pub server: ServerStats,
    pub last_tick: Option<u64>,
    pub bots: Vec<BotReport>,
}

#[derive(Debug, Clone)]
pub struct BotReport {
    pub id: SessionId,
    pub status: ConnectionStatus,
    pub stats: RewindStats,
}

/// Runs `bots` clients against an in-process server for `frames` frames of
/// one tick each. Every bot gets its own pair of links built from
/// `config.link`, seeded differently.
pub fn run_local(config: &Config, bots: usize, frames: usize) -> Result<LocalReport, ServerError> {
    let codec = packet_codec(config);
    let mut server = ServerEngine::new(
        PuckArena::new(),
        ServerSettings::from(&config.sync),
        SessionRegistry::new(codec.clone(), config.network.max_players as usize),
    )?;
    let mut net = LoopbackNetwork::new();
    let ids = IdGenerator::new();

    let mut clients = Vec::with_capacity(bots);
    for n in 0..bots as u64 {
        let id = ids.next_id();
        let mut client = ClientEngine::new(
            PuckArena::new(),
            ClientSettings::from(&config.sync),
            ServerConnection::new(codec.clone()),
        )?;
        let link = &config.link;
        let seed = link.seed.wrapping_add(2 * n);
        let up = LossyLink::new(link.drop_rate, link.reorder_rate, seed);
        let down = LossyLink::new(link.drop_rate, link.reorder_rate, seed.wrapping_add(1));
        if !net.connect(id.clone(), up, down, server.sessions_mut(), client.connection_mut()) {
            tracing::warn!("Server refused {id}");
            continue;
        }
        clients.push((n, id, client));
    }
    tracing::info!(
        "Local session: {} bots, drop {:.0}%, reorder {:.0}%",
        clients.len(),
        config.link.drop_rate * 100.0,
        config.link.reorder_rate * 100.0
    );

    let frame_ms = config.sync.tick_duration_ms();
    for _ in 0..frames {
        for (n, id, client) in &mut clients {
            net.pump_client(id, client.connection_mut());
            let next = client.clock().tick() + 1;
            client.set_input(wander(next + *n * 30));
            client.update(frame_ms);
        }
        net.pump_server(server.sessions_mut());
        server.update(frame_ms);
    }

    let bots = clients
        .into_iter()
        .map(|(_, id, client)| BotReport {
            id,
            status: client.status(),
            stats: client.stats().clone(),
        })
        .collect();
    Ok(LocalReport {
        server: server.stats(),
        last_tick: server.simulated_tick(),
        bots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_session_over_lossy_links() {
        let mut config = Config::default();
        config.link.drop_rate = 0.1;
        config.link.reorder_rate = 0.2;
        let report = run_local(&config, 3, 600).unwrap();

        assert_eq!(report.bots.len(), 3);
        assert!(report.last_tick.is_some_and(|t| t >= 590));
        assert!(report.server.inputs_accepted > 0);
        for bot in &report.bots {
            assert_eq!(bot.status, ConnectionStatus::Connected, "{}", bot.id);
            assert!(bot.stats.matches + bot.stats.corrections > 0, "{}", bot.id);
        }
    }

    #[test]
    fn test_room_limit_refuses_extra_bots() {
        let mut config = Config::default();
        config.network.max_players = 2;
        let report = run_local(&config, 3, 10).unwrap();
        assert_eq!(report.bots.len(), 2);
    }
}
