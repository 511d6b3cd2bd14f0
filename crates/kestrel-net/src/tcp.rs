//! TCP transport bridging `tokio` sockets to the single-threaded simulation.
//!
//! Socket I/O runs on background tasks that only move frames through
//! channels. The simulation calls [`TcpHost::poll`] / [`TcpConnector::poll`]
//! once per tick to feed received frames into its session queues, and
//! [`TcpHost::flush`] / [`TcpConnector::flush`] to hand queued packets back to
//! the writer tasks. Neither call awaits.
//!
//! TCP is reliable and ordered, so unreliable packets are simply delivered.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};

use crate::connection::{ConnectionState, ServerConnection};
use crate::framing::{FrameConfig, read_frame, write_frame};
use crate::session::{DisconnectReason, SessionId, SessionRegistry};

/// Idle time before the first keepalive probe.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
/// Interval between keepalive probes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Disable Nagle and enable keepalive on a connected stream.
pub fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Monotonic generator of `peer-N` session ids.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`SessionId`].
    pub fn next_id(&self) -> SessionId {
        SessionId::new(format!("peer-{}", self.next.fetch_add(1, Ordering::Relaxed)))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

enum HostEvent {
    Connected {
        id: SessionId,
        addr: SocketAddr,
        writer: mpsc::UnboundedSender<Vec<u8>>,
        close: oneshot::Sender<()>,
    },
    Frame(SessionId, Vec<u8>),
    Closed(SessionId),
}

struct Peer {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    // Dropping this stops the reader task.
    _close: oneshot::Sender<()>,
}

/// Server side: accepts connections and maps them to sessions.
pub struct TcpHost {
    local_addr: SocketAddr,
    events: mpsc::UnboundedReceiver<HostEvent>,
    peers: HashMap<SessionId, Peer>,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpHost {
    /// Bind to `addr` and start accepting in the background.
    pub async fn bind(addr: SocketAddr, frame: FrameConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Server listening on {}", listener.local_addr()?);
        Self::with_listener(listener, frame)
    }

    /// Start accepting on a pre-bound listener (useful for tests).
    pub fn with_listener(listener: TcpListener, frame: FrameConfig) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, events_tx, frame, shutdown_rx));
        Ok(Self {
            local_addr,
            events,
            peers: HashMap::new(),
            shutdown_tx,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Move connection events and received frames into `registry`.
    pub fn poll(&mut self, registry: &mut SessionRegistry) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                HostEvent::Connected {
                    id,
                    addr,
                    writer,
                    close,
                } => {
                    if registry.on_connect(id.clone()) {
                        tracing::debug!("Session {id} is {addr}");
                        self.peers.insert(
                            id,
                            Peer {
                                writer,
                                _close: close,
                            },
                        );
                    }
                    // Otherwise writer and close drop here, closing the socket.
                }
                HostEvent::Frame(id, bytes) => registry.receive(&id, &bytes),
                HostEvent::Closed(id) => {
                    if self.peers.remove(&id).is_some() {
                        registry.on_disconnect(&id, DisconnectReason::Closed);
                    }
                }
            }
        }
    }

    /// Hand every queued outgoing packet to its writer task.
    pub fn flush(&mut self, registry: &mut SessionRegistry) {
        for out in registry.drain_outgoing() {
            match self.peers.get(&out.session) {
                Some(peer) => {
                    if peer.writer.send(out.bytes).is_err() {
                        tracing::debug!("Writer for {} is gone", out.session);
                    }
                }
                None => tracing::debug!("No socket for {}, dropping packet", out.session),
            }
        }
    }

    /// Close the socket of a session the registry already removed.
    pub fn close(&mut self, id: &SessionId) {
        self.peers.remove(id);
    }

    /// Number of open sockets.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.peers.clear();
    }
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<HostEvent>,
    frame: FrameConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let ids = IdGenerator::new();
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = configure_stream(&stream) {
                    tracing::debug!("Socket options failed for {addr}: {e}");
                }
                let id = ids.next_id();
                let (reader, writer) = stream.into_split();
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (close_tx, close_rx) = oneshot::channel();
                tokio::spawn(write_loop(writer, out_rx, frame.clone()));

                let connected = HostEvent::Connected {
                    id: id.clone(),
                    addr,
                    writer: out_tx,
                    close: close_tx,
                };
                // Queued before the reader starts so it precedes every frame.
                if events.send(connected).is_err() {
                    break;
                }
                tokio::spawn(host_read_loop(
                    reader,
                    id,
                    events.clone(),
                    frame.clone(),
                    close_rx,
                    shutdown_rx.clone(),
                ));
            }
            changed = shutdown_rx.changed() => {
                // A dropped host counts as shutdown.
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }
    }
}

async fn host_read_loop(
    mut reader: OwnedReadHalf,
    id: SessionId,
    events: mpsc::UnboundedSender<HostEvent>,
    frame: FrameConfig,
    mut close_rx: oneshot::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = read_frame(&mut reader, &frame) => match result {
                Ok(Some(bytes)) => {
                    if events.send(HostEvent::Frame(id.clone(), bytes)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Connection {id} read error: {e}");
                    break;
                }
            },
            _ = &mut close_rx => return,
            _ = shutdown_rx.changed() => break,
        }
    }
    let _ = events.send(HostEvent::Closed(id));
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    frame: FrameConfig,
) {
    while let Some(bytes) = outgoing.recv().await {
        if let Err(e) = write_frame(&mut writer, &bytes, &frame).await {
            tracing::debug!("Write failed: {e}");
            break;
        }
    }
}

enum ClientEvent {
    Frame(Vec<u8>),
    Closed,
}

/// Client side: one connection to the server.
pub struct TcpConnector {
    events: mpsc::UnboundedReceiver<ClientEvent>,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    _close: oneshot::Sender<()>,
}

impl TcpConnector {
    /// Connect to the server at `addr`.
    pub async fn connect(addr: SocketAddr, frame: FrameConfig) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        configure_stream(&stream)?;
        let (reader, writer) = stream.into_split();

        let (events_tx, events) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        tokio::spawn(write_loop(writer, out_rx, frame.clone()));
        tokio::spawn(async move {
            let mut reader = reader;
            loop {
                tokio::select! {
                    result = read_frame(&mut reader, &frame) => match result {
                        Ok(Some(bytes)) => {
                            if events_tx.send(ClientEvent::Frame(bytes)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!("Server read error: {e}");
                            break;
                        }
                    },
                    _ = &mut close_rx => return,
                }
            }
            let _ = events_tx.send(ClientEvent::Closed);
        });

        tracing::info!("Connected to {addr}");
        Ok(Self {
            events,
            writer: out_tx,
            _close: close_tx,
        })
    }

    /// Move received frames and the close notification into `conn`.
    pub fn poll(&mut self, conn: &mut ServerConnection) {
        if conn.state() == ConnectionState::Connecting {
            conn.on_open();
        }
        while let Ok(event) = self.events.try_recv() {
            match event {
                ClientEvent::Frame(bytes) => conn.receive(&bytes),
                ClientEvent::Closed => conn.on_closed(DisconnectReason::Closed),
            }
        }
    }

    /// Hand queued packets to the writer task.
    pub fn flush(&mut self, conn: &mut ServerConnection) {
        for (_, bytes) in conn.drain_outgoing() {
            if self.writer.send(bytes).is_err() {
                tracing::debug!("Writer to server is gone");
                break;
            }
        }
    }
}
