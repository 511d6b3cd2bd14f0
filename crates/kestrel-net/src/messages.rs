//! Wire packets and the packet codec.
//!
//! Every packet is a variant of [`Packet`]; postcard tags it with the
//! variant's declaration index, so variants are only ever appended. On the
//! wire a packet is serialized with [`postcard`], prefixed with a protocol version
//! byte, then wrapped by [`compress_payload`] so large world snapshots travel
//! LZ4-compressed:
//!
//! ```text
//! [compression flag: u8] [version: u8] [postcard-encoded Packet]
//!                        \_______ possibly LZ4-compressed ______/
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::compression::{CompressionConfig, CompressionError, compress_payload, decompress_payload};
use crate::session::SessionId;

/// Current wire-protocol version. Prepended to every serialized packet.
pub const PROTOCOL_VERSION: u8 = 1;

/// A stable string tag identifying a component type inside a snapshot.
pub type ComponentTypeTag = String;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// Protocol name of a [`Packet`] variant, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Server → client: handshake completed, here is your session id.
    ServerWelcome,
    /// Server → client: clock sync start.
    ServerSyncPing,
    /// Client → server: clock sync echo.
    ClientSyncPong,
    /// Server → client: clock sync result.
    ServerSyncResult,
    /// Client → server: per-tick input report.
    PlayerInput,
    /// Server → client: authoritative world snapshot.
    World,
}

impl Opcode {
    /// Upper-case protocol name, used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::ServerWelcome => "SERVER_WELCOME",
            Self::ServerSyncPing => "SERVER_SYNC_PING",
            Self::ClientSyncPong => "CLIENT_SYNC_PONG",
            Self::ServerSyncResult => "SERVER_SYNC_RESULT",
            Self::PlayerInput => "PLAYER_INPUT",
            Self::World => "WORLD",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// Top-level network packet. Serialized with the variant index as its tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Packet {
    /// Handshake completion, sent reliably right after connect.
    Welcome(Welcome),
    /// Server clock probe.
    SyncPing(SyncPing),
    /// Client echo of a [`SyncPing`].
    SyncPong(SyncPong),
    /// Server answer to a [`SyncPong`].
    SyncResult(SyncResult),
    /// One tick of client input.
    PlayerInput(PlayerInput),
    /// Authoritative snapshot; the tick travels inside the snapshot.
    World(WorldSnapshot),
}

impl Packet {
    /// Returns the opcode of this packet.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Welcome(_) => Opcode::ServerWelcome,
            Self::SyncPing(_) => Opcode::ServerSyncPing,
            Self::SyncPong(_) => Opcode::ClientSyncPong,
            Self::SyncResult(_) => Opcode::ServerSyncResult,
            Self::PlayerInput(_) => Opcode::PlayerInput,
            Self::World(_) => Opcode::World,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Handshake completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Welcome {
    /// The id the server assigned to this client's session.
    pub session_id: SessionId,
    /// Server tick duration in milliseconds.
    pub tick_duration_ms: f64,
}

/// `SERVER_SYNC_PING{serverTime}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SyncPing {
    /// Server clock (ms) when the ping was sent.
    pub server_time_ms: f64,
}

/// `CLIENT_SYNC_PONG{serverTime, clientTime}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SyncPong {
    /// Echo of [`SyncPing::server_time_ms`].
    pub server_time_ms: f64,
    /// Client clock (ms) when the ping was received.
    pub client_time_ms: f64,
}

/// `SERVER_SYNC_RESULT{clientTime, serverTime, serverTick, tickDurationMs}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SyncResult {
    /// Echo of [`SyncPong::client_time_ms`].
    pub client_time_ms: f64,
    /// Server clock (ms) when the result was sent.
    pub server_time_ms: f64,
    /// Server tick when the result was sent.
    pub server_tick: u64,
    /// Server tick duration in milliseconds.
    pub tick_duration_ms: f64,
}

/// `PLAYER_INPUT{tick, input}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerInput {
    /// The tick this input is meant for.
    pub tick: u64,
    /// Postcard encoding of the game's input type.
    pub input: Vec<u8>,
}

/// A tick-stamped capture of all networked entities.
///
/// Plain data with no cycles; two snapshots of identical world state compare
/// equal with `==`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorldSnapshot {
    /// The tick this snapshot represents.
    pub tick: u64,
    /// Networked entities ordered by network id.
    pub entities: Vec<EntityState>,
}

/// One entity inside a [`WorldSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityState {
    /// Stable, externally visible entity id.
    pub network_id: u64,
    /// Session that owns (controls) this entity, if any.
    pub owner: Option<SessionId>,
    /// Networked components as (tag, bytes) pairs in schema order.
    pub components: Vec<(ComponentTypeTag, Vec<u8>)>,
}

impl WorldSnapshot {
    /// Looks up an entity by network id.
    pub fn entity(&self, network_id: u64) -> Option<&EntityState> {
        self.entities.iter().find(|e| e.network_id == network_id)
    }
}

impl EntityState {
    /// Returns the serialized bytes of the component with `tag`.
    pub fn component(&self, tag: &str) -> Option<&[u8]> {
        self.components
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, bytes)| bytes.as_slice())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while encoding or decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The payload was empty (no version byte).
    #[error("empty payload — no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The compression envelope was invalid.
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    /// Postcard (de)serialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Encodes and decodes [`Packet`]s to and from wire bytes.
#[derive(Debug, Clone, Default)]
pub struct PacketCodec {
    compression: CompressionConfig,
}

impl PacketCodec {
    /// Creates a codec with the given compression policy.
    pub fn new(compression: CompressionConfig) -> Self {
        Self { compression }
    }

    /// Serialize a packet into its wire representation.
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>, MessageError> {
        let body = postcard::to_allocvec(packet)?;
        let mut versioned = Vec::with_capacity(1 + body.len());
        versioned.push(PROTOCOL_VERSION);
        versioned.extend_from_slice(&body);
        Ok(compress_payload(&versioned, &self.compression))
    }

    /// Deserialize wire bytes into a packet.
    pub fn decode(&self, data: &[u8]) -> Result<Packet, MessageError> {
        let versioned = decompress_payload(data)?;
        let Some((&version, body)) = versioned.split_first() else {
            return Err(MessageError::EmptyPayload);
        };
        if version != PROTOCOL_VERSION {
            return Err(MessageError::UnsupportedVersion(version));
        }
        Ok(postcard::from_bytes(body)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
