//! Notifications surfaced to the game layer.

use crate::error::TransferError;
use crate::session::Role;
use tilesync_core::{NetworkId, PeerId, TileKey, TileLayer, TileState, WorldMetadata};

/// Something the game should react to, drained once per tick.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    /// Session is live in the given role.
    SessionStarted {
        /// Local role.
        role: Role,
    },
    /// Host refused our handshake.
    JoinRejected {
        /// Host-supplied reason.
        reason: String,
    },
    /// Session ended (left, or host lost).
    SessionEnded,
    /// A participant joined.
    PeerJoined {
        /// Who.
        peer: PeerId,
        /// Display name.
        name: String,
    },
    /// A participant left.
    PeerLeft {
        /// Who.
        peer: PeerId,
    },
    /// Chat line received.
    Chat {
        /// Sender.
        author: PeerId,
        /// Sender's display name.
        name: String,
        /// Text.
        text: String,
    },
    /// A world transfer began (peer side).
    TransferStarted {
        /// World name.
        name: String,
        /// Chunks announced.
        total_chunks: u32,
    },
    /// The assembled world was swapped in (peer side).
    WorldLoaded {
        /// Metadata of the new world.
        metadata: WorldMetadata,
    },
    /// The transfer was abandoned; joining failed.
    TransferFailed {
        /// Why.
        error: TransferError,
    },
    /// A world was sent to a joiner (host side).
    WorldSent {
        /// Recipient.
        peer: PeerId,
        /// Chunks sent.
        chunks: u32,
    },
    /// A replicated entity appeared.
    EntitySpawned {
        /// Entity identity.
        network_id: NetworkId,
        /// Type tag.
        local_id: u16,
        /// Creator.
        owner: PeerId,
    },
    /// A replicated entity's state changed.
    EntityUpdated {
        /// Entity identity.
        network_id: NetworkId,
        /// Whether the update created the entity (spawn never seen).
        synthesized: bool,
    },
    /// A replicated entity was removed.
    EntityRemoved {
        /// Entity identity.
        network_id: NetworkId,
    },
    /// A remote tile edit was applied.
    TileChanged {
        /// Cell.
        key: TileKey,
        /// New state.
        state: TileState,
        /// Acting participant.
        actor: PeerId,
    },
    /// A batch of remote tile updates was applied.
    TilesUpdated {
        /// Layer.
        layer: TileLayer,
        /// Tiles applied.
        count: usize,
    },
    /// The host refused a tile edit and sent its own state back.
    TileCorrected {
        /// Cell.
        key: TileKey,
        /// Participant whose edit was refused.
        origin: PeerId,
    },
}
