//! A headless client that steers its paddle on a fixed pattern.

use std::future::Future;
use std::time::Duration;

use kestrel_config::Config;
use kestrel_game::{PaddleInput, PuckArena};
use kestrel_net::{ServerConnection, TcpConnector};
use kestrel_sync::{ClientEngine, ClientSettings, ConnectionStatus, RewindStats};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::ServerError;
use crate::{frame_config, packet_codec, server_addr};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Ticks spent on each leg of the pattern.
const LEG_TICKS: u64 = 45;

/// Steering for `tick`: up, right, down, left, one leg each.
pub fn wander(tick: u64) -> PaddleInput {
    match (tick / LEG_TICKS) % 4 {
        0 => PaddleInput::new(0, 1),
        1 => PaddleInput::new(1, 0),
        2 => PaddleInput::new(0, -1),
        _ => PaddleInput::new(-1, 0),
    }
}

pub struct Bot {
    engine: ClientEngine<PuckArena>,
    tcp: TcpConnector,
    status: ConnectionStatus,
}

impl Bot {
    /// Connects to the configured server.
    pub async fn connect(config: &Config) -> Result<Self, ServerError> {
        let tcp = TcpConnector::connect(server_addr(config).await?, frame_config(config)).await?;
        let engine = ClientEngine::new(
            PuckArena::new(),
            ClientSettings::from(&config.sync),
            ServerConnection::new(packet_codec(config)),
        )?;
        let status = engine.status();
        Ok(Self {
            engine,
            tcp,
            status,
        })
    }

    pub fn engine(&self) -> &ClientEngine<PuckArena> {
        &self.engine
    }

    /// One loop pass: take in server traffic, steer, predict, send.
    pub fn frame(&mut self, delta_ms: f64) {
        self.tcp.poll(self.engine.connection_mut());
        let next = self.engine.clock().tick() + 1;
        self.engine.set_input(wander(next));
        self.engine.update(delta_ms);
        self.tcp.flush(self.engine.connection_mut());

        let status = self.engine.status();
        if status != self.status {
            tracing::info!("Status {:?} -> {status:?}", self.status);
            self.status = status;
        }
    }

    /// Plays until disconnected or until `shutdown` completes. Returns the
    /// final rewind counters.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> RewindStats {
        let period =
            Duration::from_secs_f64(self.engine.settings().tick_duration_ms / 1000.0);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = Instant::now();
        let mut last_report = last;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let now = Instant::now();
                    self.frame(now.duration_since(last).as_secs_f64() * 1000.0);
                    last = now;
                    if self.status == ConnectionStatus::Disconnected {
                        break;
                    }
                    if now.duration_since(last_report) >= STATS_INTERVAL {
                        last_report = now;
                        let stats = self.engine.stats();
                        tracing::info!(
                            "tick {:?}, rtt {:.1} ms: {} matches, {} corrections ({} ticks replayed), {} hard snaps",
                            self.engine.tick(),
                            self.engine.clock().rtt().ewma_ms(),
                            stats.matches,
                            stats.corrections,
                            stats.replayed_ticks,
                            stats.hard_snaps
                        );
                    }
                }
            }
        }
        self.engine.stats().clone()
    }
}
