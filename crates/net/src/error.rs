//! Error types returned by the replication core.
//!
//! Transport faults are absorbed by the queue and session layers; everything
//! here is either a protocol fault (one inbound message is dropped) or a
//! transfer fault (the join attempt is abandoned).

use crate::protocol::MessageKind;
use crate::transport::ConnectionHandle;
use thiserror::Error;
use tilesync_core::{NetworkId, PeerId, TileKey};

/// Errors produced by handlers, codecs and local operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// Zero-length frame.
    #[error("empty frame")]
    EmptyFrame,

    /// First byte is not a known message kind.
    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    /// Payload could not be decoded.
    #[error("malformed {kind:?} payload: {source}")]
    Malformed {
        /// Kind declared by the frame.
        kind: MessageKind,
        /// Decoder error.
        #[source]
        source: postcard::Error,
    },

    /// Payload decoded but left bytes behind.
    #[error("{kind:?} payload has {count} trailing bytes")]
    TrailingBytes {
        /// Kind declared by the frame.
        kind: MessageKind,
        /// Unconsumed byte count.
        count: usize,
    },

    /// Payload could not be encoded.
    #[error("failed to encode {kind:?}: {source}")]
    Encode {
        /// Kind being encoded.
        kind: MessageKind,
        /// Encoder error.
        #[source]
        source: postcard::Error,
    },

    /// A field violated a protocol limit.
    #[error("{kind:?} field `{field}` rejected: {detail}")]
    Limit {
        /// Kind of the offending message.
        kind: MessageKind,
        /// Field name.
        field: &'static str,
        /// What was wrong.
        detail: String,
    },

    /// Message arrived on a connection the session does not know.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionHandle),

    /// Message other than a handshake arrived before the handshake completed.
    #[error("connection {0} has not completed the handshake")]
    NotValidated(ConnectionHandle),

    /// The transport has no route to the peer.
    #[error("{0} is unreachable")]
    Unreachable(PeerId),

    /// Local operation needs an active session.
    #[error("not connected to a session")]
    NotConnected,

    /// Local or inbound operation is reserved for the host.
    #[error("operation requires the host role")]
    NotHost,

    /// Inbound message only the host may send arrived from elsewhere.
    #[error("{0:?} is only accepted from the host")]
    HostOnly(MessageKind),

    /// Session state machine refused the transition.
    #[error("invalid session transition: {0}")]
    InvalidState(String),

    /// Handshake failed validation.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Tile edit outside the loaded world.
    #[error("tile {0:?} is outside the world")]
    OutOfBounds(TileKey),

    /// Entity is not registered locally.
    #[error("unknown entity {0}")]
    UnknownEntity(NetworkId),

    /// Blocking send gave up.
    #[error("send to {handle} failed: {reason}")]
    SendFailed {
        /// Destination.
        handle: ConnectionHandle,
        /// Transport-reported reason.
        reason: String,
    },

    /// Bulk world transfer fault.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Configuration rejected.
    #[error("invalid config: {0}")]
    Config(String),
}

/// Faults that abandon a peer-side world transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Chunk or sentinel arrived with no transfer in progress.
    #[error("no world transfer in progress")]
    NoSession,

    /// Chunk disagrees with the announced chunk count.
    #[error("chunk count mismatch: announced {expected}, chunk claims {got}")]
    CountMismatch {
        /// Count from the start message.
        expected: u32,
        /// Count carried by the chunk.
        got: u32,
    },

    /// Chunk index outside `0..total`.
    #[error("chunk index {index} out of range for {total} chunks")]
    IndexOutOfRange {
        /// Offending index.
        index: u32,
        /// Announced total.
        total: u32,
    },

    /// Reassembled tile count differs from the metadata.
    #[error("reassembled {got} tiles, metadata announced {expected}")]
    TileCountMismatch {
        /// Announced count.
        expected: u64,
        /// Reassembled count.
        got: u64,
    },

    /// Reassembled world checksum differs from the metadata.
    #[error("world checksum {got:08x} does not match announced {expected:08x}")]
    ChecksumMismatch {
        /// Announced checksum.
        expected: u32,
        /// Computed checksum.
        got: u32,
    },

    /// No chunk arrived within the transfer timeout.
    #[error("world transfer timed out after {received}/{expected} chunks")]
    TimedOut {
        /// Chunks received.
        received: usize,
        /// Chunks announced.
        expected: u32,
    },

    /// Connection to the host was lost mid-transfer.
    #[error("host disconnected during world transfer")]
    Disconnected,
}
