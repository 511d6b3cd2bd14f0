//! Networking for the tick-synchronized protocol: wire packets and codec,
//! per-peer sessions, length-prefixed framing, the TCP transport and an
//! in-memory lossy link for tests.

pub mod compression;
pub mod connection;
pub mod framing;
pub mod link;
pub mod messages;
pub mod session;
pub mod tcp;

pub use compression::{CompressionConfig, CompressionError, compress_payload, decompress_payload};
pub use connection::{ConnectionState, ServerConnection};
pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use link::{LinkStats, LoopbackNetwork, LossyLink};
pub use messages::{
    ComponentTypeTag, EntityState, MessageError, Opcode, PROTOCOL_VERSION, Packet, PacketCodec,
    PlayerInput, SyncPing, SyncPong, SyncResult, Welcome, WorldSnapshot,
};
pub use session::{
    DisconnectReason, NetHandler, Outgoing, Reliability, Session, SessionId, SessionRegistry,
};
pub use tcp::{IdGenerator, TcpConnector, TcpHost, configure_stream};
