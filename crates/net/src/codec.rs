//! Message encoding and decoding.
//!
//! Frame format: `[kind: u8][payload: postcard]`. The transport preserves
//! message boundaries, so there is no length prefix.

use crate::error::NetError;
use crate::protocol::{Message, MessageKind, Payload, PROTOCOL_MAGIC, PROTOCOL_VERSION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tilesync_core::EXTRA_SCHEMA_VERSION;

/// Compute schema hash from protocol definitions.
///
/// Both sides compare this during the handshake; any change to the kind
/// table or the entity extra-field schema changes the hash.
pub fn compute_schema_hash() -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&PROTOCOL_VERSION.to_le_bytes());
    hasher.update(PROTOCOL_MAGIC);
    hasher.update(&EXTRA_SCHEMA_VERSION.to_le_bytes());
    for kind in MessageKind::ALL {
        hasher.update(&[kind.as_u8()]);
        hasher.update(kind.as_str().as_bytes());
    }

    let hash = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// Encode a payload into an immutable [`Message`].
pub fn encode(payload: &Payload) -> Result<Message, NetError> {
    let kind = payload.kind();
    let bytes = match payload {
        Payload::Handshake(msg) => to_bytes(kind, msg),
        Payload::Welcome(msg) => to_bytes(kind, msg),
        Payload::PeerJoined(msg) => to_bytes(kind, msg),
        Payload::PeerLeft(msg) => to_bytes(kind, msg),
        Payload::EntitySpawned(msg) => to_bytes(kind, msg),
        Payload::EntityPositionUpdate(msg) => to_bytes(kind, msg),
        Payload::EntityKilled(msg) => to_bytes(kind, msg),
        Payload::TileChanged(msg) => to_bytes(kind, msg),
        Payload::TileUpdated(msg) => to_bytes(kind, msg),
        Payload::ChatMessage(msg) => to_bytes(kind, msg),
        Payload::WorldTransferStart(msg) => to_bytes(kind, msg),
        Payload::WorldChunk(msg) => to_bytes(kind, msg),
        Payload::WorldTransferComplete(msg) => to_bytes(kind, msg),
        Payload::WorldRequest(msg) => to_bytes(kind, msg),
    }?;
    Ok(Message::from_parts(kind, &bytes))
}

/// Decode and verify a message.
///
/// Fails on malformed payloads, trailing bytes and limit violations; the
/// caller drops the message and moves on.
pub fn decode(message: &Message) -> Result<Payload, NetError> {
    let kind = message.kind();
    let bytes = message.payload();
    let payload = match kind {
        MessageKind::Handshake => from_bytes(kind, bytes).map(Payload::Handshake),
        MessageKind::Welcome => from_bytes(kind, bytes).map(Payload::Welcome),
        MessageKind::PeerJoined => from_bytes(kind, bytes).map(Payload::PeerJoined),
        MessageKind::PeerLeft => from_bytes(kind, bytes).map(Payload::PeerLeft),
        MessageKind::EntitySpawned => from_bytes(kind, bytes).map(Payload::EntitySpawned),
        MessageKind::EntityPositionUpdate => {
            from_bytes(kind, bytes).map(Payload::EntityPositionUpdate)
        }
        MessageKind::EntityKilled => from_bytes(kind, bytes).map(Payload::EntityKilled),
        MessageKind::TileChanged => from_bytes(kind, bytes).map(Payload::TileChanged),
        MessageKind::TileUpdated => from_bytes(kind, bytes).map(Payload::TileUpdated),
        MessageKind::ChatMessage => from_bytes(kind, bytes).map(Payload::ChatMessage),
        MessageKind::WorldTransferStart => from_bytes(kind, bytes).map(Payload::WorldTransferStart),
        MessageKind::WorldChunk => from_bytes(kind, bytes).map(Payload::WorldChunk),
        MessageKind::WorldTransferComplete => {
            from_bytes(kind, bytes).map(Payload::WorldTransferComplete)
        }
        MessageKind::WorldRequest => from_bytes(kind, bytes).map(Payload::WorldRequest),
    }?;
    payload.verify()?;
    Ok(payload)
}

/// Decode a raw frame as received from the transport.
pub fn decode_frame(frame: Vec<u8>) -> Result<(Message, Payload), NetError> {
    let message = Message::from_frame(frame)?;
    let payload = decode(&message)?;
    Ok((message, payload))
}

fn to_bytes<T: Serialize>(kind: MessageKind, value: &T) -> Result<Vec<u8>, NetError> {
    postcard::to_allocvec(value).map_err(|source| NetError::Encode { kind, source })
}

fn from_bytes<T: DeserializeOwned>(kind: MessageKind, bytes: &[u8]) -> Result<T, NetError> {
    let (value, rest) =
        postcard::take_from_bytes(bytes).map_err(|source| NetError::Malformed { kind, source })?;
    if !rest.is_empty() {
        return Err(NetError::TrailingBytes {
            kind,
            count: rest.len(),
        });
    }
    Ok(value)
}
