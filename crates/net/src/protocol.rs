//! Wire message definitions.
//!
//! Every frame is `[kind: u8][payload]` where the payload is the postcard
//! encoding of the struct matching the kind. Receivers call
//! [`Payload::verify`] (via [`crate::codec::decode`]) before acting on
//! anything they decoded.

use crate::error::NetError;
use serde::{Deserialize, Serialize};
use tilesync_core::{
    NetworkEntitySnapshot, NetworkId, PeerId, TileKey, TileLayer, TilePos, TileState,
    WorldMetadata,
};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u16 = 1;

/// Magic bytes opening every QUIC connection and folded into the schema hash.
pub const PROTOCOL_MAGIC: &[u8; 8] = b"TSYN\x00\x01\x00\x00";

/// Maximum length of a chat message (bytes).
pub const MAX_CHAT_LEN: usize = 256;

/// Maximum length of a display name (bytes).
pub const MAX_NAME_LEN: usize = 32;

/// Maximum length of a world name (bytes).
pub const MAX_WORLD_NAME_LEN: usize = 64;

/// Maximum length of a rejection reason (bytes).
pub const MAX_REASON_LEN: usize = 256;

/// Maximum length of sign text (bytes).
pub const MAX_SIGN_TEXT_LEN: usize = 256;

/// Maximum number of signs carried by world metadata.
pub const MAX_SIGNS: usize = 1024;

/// Maximum tiles in one `WorldChunk` or `TileUpdated`.
pub const MAX_TILES_PER_MESSAGE: usize = 256;

/// Maximum per-tile instance data (bytes).
pub const MAX_INSTANCE_DATA_LEN: usize = 1024;

/// Maximum participants listed in a `Welcome`.
pub const MAX_ROSTER: usize = 256;

/// One-byte message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageKind {
    /// Peer → host identity and version check.
    Handshake = 0,
    /// Host → peer handshake verdict and roster.
    Welcome = 1,
    /// Host → peers: a participant joined.
    PeerJoined = 2,
    /// Host → peers: a participant left.
    PeerLeft = 3,
    /// New entity.
    EntitySpawned = 4,
    /// Full entity state refresh.
    EntityPositionUpdate = 5,
    /// Entity removed.
    EntityKilled = 6,
    /// Single tile edit.
    TileChanged = 7,
    /// Batch of dirty tiles on one layer.
    TileUpdated = 8,
    /// Chat line.
    ChatMessage = 9,
    /// Host → peer: world metadata opening a transfer.
    WorldTransferStart = 10,
    /// Host → peer: one slice of one layer.
    WorldChunk = 11,
    /// Host → peer: transfer sentinel.
    WorldTransferComplete = 12,
    /// Peer → host: please (re)send the world.
    WorldRequest = 13,
}

impl MessageKind {
    /// Every kind in tag order.
    pub const ALL: [MessageKind; 14] = [
        MessageKind::Handshake,
        MessageKind::Welcome,
        MessageKind::PeerJoined,
        MessageKind::PeerLeft,
        MessageKind::EntitySpawned,
        MessageKind::EntityPositionUpdate,
        MessageKind::EntityKilled,
        MessageKind::TileChanged,
        MessageKind::TileUpdated,
        MessageKind::ChatMessage,
        MessageKind::WorldTransferStart,
        MessageKind::WorldChunk,
        MessageKind::WorldTransferComplete,
        MessageKind::WorldRequest,
    ];

    /// Wire tag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// Name for logs and trace files.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Welcome => "welcome",
            Self::PeerJoined => "peer_joined",
            Self::PeerLeft => "peer_left",
            Self::EntitySpawned => "entity_spawned",
            Self::EntityPositionUpdate => "entity_position_update",
            Self::EntityKilled => "entity_killed",
            Self::TileChanged => "tile_changed",
            Self::TileUpdated => "tile_updated",
            Self::ChatMessage => "chat_message",
            Self::WorldTransferStart => "world_transfer_start",
            Self::WorldChunk => "world_chunk",
            Self::WorldTransferComplete => "world_transfer_complete",
            Self::WorldRequest => "world_request",
        }
    }
}

/// An encoded message: kind tag plus opaque payload. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    frame: Vec<u8>,
}

impl Message {
    pub(crate) fn from_parts(kind: MessageKind, payload: &[u8]) -> Self {
        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(kind.as_u8());
        frame.extend_from_slice(payload);
        Self { kind, frame }
    }

    /// Wrap a received frame, checking only the tag byte.
    pub fn from_frame(frame: Vec<u8>) -> Result<Self, NetError> {
        let tag = *frame.first().ok_or(NetError::EmptyFrame)?;
        let kind = MessageKind::from_u8(tag).ok_or(NetError::UnknownKind(tag))?;
        Ok(Self { kind, frame })
    }

    /// Message kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Payload bytes after the tag.
    pub fn payload(&self) -> &[u8] {
        &self.frame[1..]
    }

    /// Full frame as it goes on the wire.
    pub fn as_frame(&self) -> &[u8] {
        &self.frame
    }

    /// Frame length in bytes.
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    /// Always false: a frame carries at least its tag.
    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }
}

/// Who performed an edit. Bookkeeping only; never used for authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Acting participant, or [`PeerId::NONE`].
    pub peer: PeerId,
    /// Display name at the time of the edit.
    pub name: String,
}

impl Actor {
    /// No acting player.
    pub const NONE: Actor = Actor {
        peer: PeerId::NONE,
        name: String::new(),
    };

    /// Attribute to a named participant.
    pub fn new(peer: PeerId, name: impl Into<String>) -> Self {
        Self {
            peer,
            name: name.into(),
        }
    }
}

/// Roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant identity.
    pub peer: PeerId,
    /// Display name.
    pub name: String,
}

/// Peer → host opening message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Sender's [`PROTOCOL_VERSION`].
    pub version: u16,
    /// Sender's [`crate::codec::compute_schema_hash`].
    pub schema_hash: u64,
    /// Claimed identity. Must match the transport-level identity.
    pub peer_id: PeerId,
    /// Display name.
    pub display_name: String,
}

/// Host → peer handshake verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Whether the peer may stay.
    pub accepted: bool,
    /// Rejection reason.
    pub reason: Option<String>,
    /// Host identity.
    pub host: PeerId,
    /// Host display name.
    pub host_name: String,
    /// Other validated participants.
    pub participants: Vec<Participant>,
}

/// A participant joined the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerJoined {
    /// Who joined.
    pub participant: Participant,
}

/// A participant left the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLeft {
    /// Who left.
    pub peer: PeerId,
}

/// New entity announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpawned {
    /// Full initial state.
    pub snapshot: NetworkEntitySnapshot,
    /// Participant that created the entity.
    pub owner: PeerId,
}

/// Full state refresh for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPositionUpdate {
    /// Latest state.
    pub snapshot: NetworkEntitySnapshot,
}

/// Entity removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityKilled {
    /// Entity to remove.
    pub network_id: NetworkId,
}

/// Single tile edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileChanged {
    /// Edited cell.
    pub key: TileKey,
    /// New state. Air removes the tile.
    pub state: TileState,
    /// Who made the edit.
    pub actor: Actor,
}

/// Batch of tiles changed on one layer during one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileUpdated {
    /// Layer shared by every tile in the batch.
    pub layer: TileLayer,
    /// Current states. Air entries express removal.
    pub tiles: Vec<(TilePos, TileState)>,
}

/// Chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender.
    pub author: Actor,
    /// Text.
    pub text: String,
}

/// Opens a bulk world transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldTransferStart {
    /// World metadata with `total_chunks`, `tile_count` and `checksum` final.
    pub metadata: WorldMetadata,
}

/// One slice of one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldChunk {
    /// Global 0-based chunk index.
    pub index: u32,
    /// Total chunks in the transfer.
    pub total_chunks: u32,
    /// Layer the tiles belong to.
    pub layer: TileLayer,
    /// Non-air tiles.
    pub tiles: Vec<(TilePos, TileState)>,
}

/// Transfer sentinel. Advisory: receivers complete on chunk count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldTransferComplete {
    /// Chunk count the host sent.
    pub total_chunks: u32,
}

/// Peer asks the host for a fresh world transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldRequest;

/// Decoded message of any kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// See [`Handshake`].
    Handshake(Handshake),
    /// See [`Welcome`].
    Welcome(Welcome),
    /// See [`PeerJoined`].
    PeerJoined(PeerJoined),
    /// See [`PeerLeft`].
    PeerLeft(PeerLeft),
    /// See [`EntitySpawned`].
    EntitySpawned(EntitySpawned),
    /// See [`EntityPositionUpdate`].
    EntityPositionUpdate(EntityPositionUpdate),
    /// See [`EntityKilled`].
    EntityKilled(EntityKilled),
    /// See [`TileChanged`].
    TileChanged(TileChanged),
    /// See [`TileUpdated`].
    TileUpdated(TileUpdated),
    /// See [`ChatMessage`].
    ChatMessage(ChatMessage),
    /// See [`WorldTransferStart`].
    WorldTransferStart(WorldTransferStart),
    /// See [`WorldChunk`].
    WorldChunk(WorldChunk),
    /// See [`WorldTransferComplete`].
    WorldTransferComplete(WorldTransferComplete),
    /// See [`WorldRequest`].
    WorldRequest(WorldRequest),
}

impl Payload {
    /// Kind tag for this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Handshake(_) => MessageKind::Handshake,
            Payload::Welcome(_) => MessageKind::Welcome,
            Payload::PeerJoined(_) => MessageKind::PeerJoined,
            Payload::PeerLeft(_) => MessageKind::PeerLeft,
            Payload::EntitySpawned(_) => MessageKind::EntitySpawned,
            Payload::EntityPositionUpdate(_) => MessageKind::EntityPositionUpdate,
            Payload::EntityKilled(_) => MessageKind::EntityKilled,
            Payload::TileChanged(_) => MessageKind::TileChanged,
            Payload::TileUpdated(_) => MessageKind::TileUpdated,
            Payload::ChatMessage(_) => MessageKind::ChatMessage,
            Payload::WorldTransferStart(_) => MessageKind::WorldTransferStart,
            Payload::WorldChunk(_) => MessageKind::WorldChunk,
            Payload::WorldTransferComplete(_) => MessageKind::WorldTransferComplete,
            Payload::WorldRequest(_) => MessageKind::WorldRequest,
        }
    }

    /// Verify message limits and validity.
    ///
    /// Called on every received message before any handler sees it.
    pub fn verify(&self) -> Result<(), NetError> {
        let kind = self.kind();
        match self {
            Payload::Handshake(msg) => check_name(kind, "display_name", &msg.display_name),
            Payload::Welcome(msg) => {
                if let Some(reason) = &msg.reason {
                    check_len(kind, "reason", reason.len(), MAX_REASON_LEN)?;
                }
                check_len(kind, "host_name", msg.host_name.len(), MAX_NAME_LEN)?;
                check_len(kind, "participants", msg.participants.len(), MAX_ROSTER)?;
                for participant in &msg.participants {
                    check_len(kind, "participants.name", participant.name.len(), MAX_NAME_LEN)?;
                }
                Ok(())
            }
            Payload::PeerJoined(msg) => check_name(kind, "participant.name", &msg.participant.name),
            Payload::EntitySpawned(EntitySpawned { snapshot, .. })
            | Payload::EntityPositionUpdate(EntityPositionUpdate { snapshot }) => {
                check_snapshot(kind, snapshot)
            }
            Payload::TileChanged(msg) => {
                check_len(kind, "actor.name", msg.actor.name.len(), MAX_NAME_LEN)?;
                check_len(
                    kind,
                    "state.instance_data",
                    msg.state.instance_data.len(),
                    MAX_INSTANCE_DATA_LEN,
                )
            }
            Payload::TileUpdated(msg) => check_tiles(kind, &msg.tiles),
            Payload::ChatMessage(msg) => {
                check_len(kind, "author.name", msg.author.name.len(), MAX_NAME_LEN)?;
                check_len(kind, "text", msg.text.len(), MAX_CHAT_LEN)
            }
            Payload::WorldTransferStart(msg) => {
                let meta = &msg.metadata;
                check_len(kind, "metadata.name", meta.name.len(), MAX_WORLD_NAME_LEN)?;
                check_len(kind, "metadata.signs", meta.signs.len(), MAX_SIGNS)?;
                for sign in &meta.signs {
                    check_len(kind, "metadata.signs.text", sign.text.len(), MAX_SIGN_TEXT_LEN)?;
                }
                if meta.total_chunks == 0 {
                    return Err(limit(kind, "metadata.total_chunks", "must be at least 1".into()));
                }
                Ok(())
            }
            Payload::WorldChunk(msg) => {
                if msg.index >= msg.total_chunks {
                    return Err(limit(
                        kind,
                        "index",
                        format!("{} not below total_chunks {}", msg.index, msg.total_chunks),
                    ));
                }
                check_tiles(kind, &msg.tiles)
            }
            Payload::PeerLeft(_)
            | Payload::EntityKilled(_)
            | Payload::WorldTransferComplete(_)
            | Payload::WorldRequest(_) => Ok(()),
        }
    }
}

fn limit(kind: MessageKind, field: &'static str, detail: String) -> NetError {
    NetError::Limit {
        kind,
        field,
        detail,
    }
}

fn check_len(kind: MessageKind, field: &'static str, len: usize, max: usize) -> Result<(), NetError> {
    if len > max {
        return Err(limit(kind, field, format!("{len} exceeds {max}")));
    }
    Ok(())
}

fn check_name(kind: MessageKind, field: &'static str, name: &str) -> Result<(), NetError> {
    if name.trim().is_empty() {
        return Err(limit(kind, field, "empty".into()));
    }
    check_len(kind, field, name.len(), MAX_NAME_LEN)
}

fn check_tiles(kind: MessageKind, tiles: &[(TilePos, TileState)]) -> Result<(), NetError> {
    check_len(kind, "tiles", tiles.len(), MAX_TILES_PER_MESSAGE)?;
    for (_, state) in tiles {
        check_len(
            kind,
            "tiles.instance_data",
            state.instance_data.len(),
            MAX_INSTANCE_DATA_LEN,
        )?;
    }
    Ok(())
}

fn check_snapshot(kind: MessageKind, snapshot: &NetworkEntitySnapshot) -> Result<(), NetError> {
    let finite = [
        snapshot.position.x,
        snapshot.position.y,
        snapshot.velocity.x,
        snapshot.velocity.y,
        snapshot.orientation,
    ]
    .iter()
    .all(|v| v.is_finite());
    if !finite {
        return Err(limit(kind, "snapshot", "non-finite position, velocity or orientation".into()));
    }
    snapshot
        .extra
        .verify()
        .map_err(|err| limit(kind, "snapshot.extra", err.to_string()))
}
