//! The authoritative server process: a [`ServerEngine`] fed by a TCP host.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use kestrel_config::Config;
use kestrel_game::PuckArena;
use kestrel_net::{SessionRegistry, TcpHost};
use kestrel_sync::{ServerEngine, ServerSettings};
use tokio::net::TcpListener;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::ServerError;
use crate::{frame_config, packet_codec, server_addr};

/// How often the loop logs its counters.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// How often the loop re-reads `config.ron` when watching one.
const RELOAD_INTERVAL: Duration = Duration::from_secs(2);

/// A config file being watched, with the contents last read from it.
struct WatchedConfig {
    dir: PathBuf,
    file: Config,
}

pub struct Host {
    engine: ServerEngine<PuckArena>,
    tcp: TcpHost,
    timeout: Duration,
    watched: Option<WatchedConfig>,
}

impl Host {
    /// Binds the configured address and builds the engine.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(server_addr(config).await?).await?;
        Self::with_listener(listener, config)
    }

    /// Builds the host on a pre-bound listener.
    pub fn with_listener(listener: TcpListener, config: &Config) -> Result<Self, ServerError> {
        let tcp = TcpHost::with_listener(listener, frame_config(config))?;
        tracing::info!("Server listening on {}", tcp.local_addr());
        let sessions = SessionRegistry::new(
            packet_codec(config),
            config.network.max_players as usize,
        );
        let engine = ServerEngine::new(
            PuckArena::new(),
            ServerSettings::from(&config.sync),
            sessions,
        )?;
        Ok(Self {
            engine,
            tcp,
            timeout: Duration::from_secs(u64::from(config.network.timeout_seconds)),
            watched: None,
        })
    }

    /// Watches `<dir>/config.ron` for edits while running. Only the idle
    /// timeout applies live; other changes are reported as needing a restart.
    pub fn watch_config(mut self, dir: PathBuf) -> Result<Self, ServerError> {
        let file = Config::load_or_create(&dir)?;
        self.watched = Some(WatchedConfig { dir, file });
        Ok(self)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Re-reads the watched config file. Returns `true` if a valid change was
    /// picked up. Unreadable or invalid files keep the running settings.
    pub fn poll_config(&mut self) -> bool {
        let Some(watched) = &mut self.watched else {
            return false;
        };
        let fresh = match watched.file.reload(&watched.dir) {
            Ok(Some(fresh)) => fresh,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!("Config reload failed: {e}");
                return false;
            }
        };
        if let Err(e) = fresh.validate() {
            tracing::warn!("Ignoring reloaded config: {e}");
            return false;
        }

        let timeout = Duration::from_secs(u64::from(fresh.network.timeout_seconds));
        if timeout != self.timeout {
            tracing::info!("Idle timeout now {}s", timeout.as_secs());
            self.timeout = timeout;
        }
        let old = &watched.file;
        let mut network = fresh.network.clone();
        network.timeout_seconds = old.network.timeout_seconds;
        if network != old.network || fresh.sync != old.sync || fresh.link != old.link {
            tracing::warn!("Network and sync changes take effect after a restart");
        }
        watched.file = fresh;
        true
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.tcp.local_addr()
    }

    pub fn engine(&self) -> &ServerEngine<PuckArena> {
        &self.engine
    }

    pub fn peer_count(&self) -> usize {
        self.tcp.peer_count()
    }

    /// One loop pass: take in socket traffic, drop idle sessions, simulate,
    /// send.
    pub fn frame(&mut self, delta_ms: f64) {
        self.tcp.poll(self.engine.sessions_mut());
        for id in self.engine.sessions_mut().timeout_check(self.timeout) {
            self.tcp.close(&id);
        }
        self.engine.update(delta_ms);
        self.tcp.flush(self.engine.sessions_mut());
    }

    /// Runs the loop at the tick rate until `shutdown` completes.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let period = Duration::from_secs_f64(self.engine.settings().tick_duration_ms / 1000.0);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = Instant::now();
        let mut last_report = last;
        let mut last_reload = last;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let now = Instant::now();
                    self.frame(now.duration_since(last).as_secs_f64() * 1000.0);
                    last = now;

                    if now.duration_since(last_reload) >= RELOAD_INTERVAL {
                        last_reload = now;
                        self.poll_config();
                    }

                    if now.duration_since(last_report) >= STATS_INTERVAL {
                        last_report = now;
                        let stats = self.engine.stats();
                        tracing::info!(
                            "tick {:?}: {} players, {} snapshots, {} inputs ({} late, {} rejected)",
                            self.engine.simulated_tick(),
                            self.engine.sessions().len(),
                            stats.snapshots_sent,
                            stats.inputs_accepted,
                            stats.late_inputs,
                            stats.rejected_inputs
                        );
                    }
                }
            }
        }

        tracing::info!("Shutting down");
        self.tcp.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_sync::ConnectionStatus;

    use crate::bot::Bot;

    fn loopback_config(port: u16) -> Config {
        let mut config = Config::default();
        config.network.server_address = "127.0.0.1".to_string();
        config.network.server_port = port;
        config
    }

    async fn drive(host: &mut Host, bot: &mut Bot, until: impl Fn(&Host, &Bot) -> bool) -> bool {
        let frame = Duration::from_millis(16);
        for _ in 0..300 {
            host.frame(16.0);
            bot.frame(16.0);
            if until(host, bot) {
                return true;
            }
            tokio::time::sleep(frame).await;
        }
        false
    }

    #[tokio::test]
    async fn test_bot_joins_and_leaves_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = loopback_config(port);
        let mut host = Host::with_listener(listener, &config).unwrap();
        let mut bot = Bot::connect(&config).await.unwrap();

        let joined = drive(&mut host, &mut bot, |_, bot| {
            bot.engine().status() == ConnectionStatus::Connected
                && bot.engine().controlled().is_some()
                && bot.engine().tick().is_some()
        })
        .await;
        assert!(joined, "bot never synchronized");
        assert_eq!(host.peer_count(), 1);
        assert_eq!(host.engine().sessions().len(), 1);

        drop(bot);
        let mut left = false;
        for _ in 0..100 {
            host.frame(16.0);
            if host.engine().sessions().is_empty() {
                left = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(left, "host never noticed the disconnect");
        assert_eq!(host.peer_count(), 0);
        // Lifecycle events are handled at the next tick.
        host.frame(17.0);
        host.frame(17.0);
        let snapshot = host.engine().take_snapshot();
        assert!(snapshot.entities.iter().all(|e| e.owner.is_none()));
    }

    #[tokio::test]
    async fn test_config_edits_are_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        let mut host = Host::with_listener(listener, &config)
            .unwrap()
            .watch_config(dir.path().to_path_buf())
            .unwrap();
        assert!(!host.poll_config());

        let mut edited = config.clone();
        edited.network.timeout_seconds = config.network.timeout_seconds + 5;
        edited.save(dir.path()).unwrap();
        assert!(host.poll_config());
        assert_eq!(
            host.timeout(),
            Duration::from_secs(u64::from(edited.network.timeout_seconds))
        );
        assert!(!host.poll_config());

        let mut broken = edited.clone();
        broken.sync.tick_rate = 0;
        broken.save(dir.path()).unwrap();
        assert!(!host.poll_config());
        assert_eq!(
            host.timeout(),
            Duration::from_secs(u64::from(edited.network.timeout_seconds))
        );
    }
}
