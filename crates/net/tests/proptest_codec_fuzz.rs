//! Fuzz-style property tests for the wire codec
//!
//! Decoders face untrusted network input: arbitrary bytes must produce an
//! error, never a panic, and every accepted frame must satisfy the
//! protocol limits.

use proptest::prelude::*;
use tilesync_core::{PeerId, TileKey, TileLayer, TilePos, TileState};
use tilesync_net::protocol::{Actor, ChatMessage, Handshake, TileChanged, TileUpdated, MAX_CHAT_LEN};
use tilesync_net::{decode_frame, encode, MessageKind, NetError, Payload, PROTOCOL_VERSION};

fn layer() -> impl Strategy<Value = TileLayer> {
    prop_oneof![
        Just(TileLayer::Ground),
        Just(TileLayer::Liquid),
        Just(TileLayer::Furniture)
    ]
}

fn tile_state() -> impl Strategy<Value = TileState> {
    (1u16.., prop::collection::vec(any::<u8>(), 0..32))
        .prop_map(|(block_id, data)| TileState::with_data(block_id, data))
}

proptest! {
    /// Property: Arbitrary bytes don't crash the frame decoder
    #[test]
    fn arbitrary_bytes_dont_crash_decoder(
        random_bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        let _result = decode_frame(random_bytes);
        // No panic = success
    }

    /// Property: Any tag byte followed by garbage is rejected or verified
    #[test]
    fn decoded_frames_pass_verification(
        tag in 0u8..=20,
        body in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut frame = vec![tag];
        frame.extend(body);
        match decode_frame(frame) {
            Ok((message, payload)) => {
                prop_assert_eq!(message.kind(), payload.kind());
                prop_assert!(payload.verify().is_ok());
            }
            Err(NetError::UnknownKind(t)) => prop_assert!(MessageKind::from_u8(t).is_none()),
            Err(_) => {}
        }
    }

    /// Property: A valid frame with extra bytes appended is rejected
    #[test]
    fn trailing_bytes_are_rejected(
        schema_hash in any::<u64>(),
        extra in prop::collection::vec(any::<u8>(), 1..16),
    ) {
        let message = encode(&Payload::Handshake(Handshake {
            version: PROTOCOL_VERSION,
            schema_hash,
            peer_id: PeerId(7),
            display_name: "fuzz".into(),
        }))
        .expect("encode");
        let mut frame = message.as_frame().to_vec();
        frame.extend(extra);
        let rejected = matches!(decode_frame(frame), Err(NetError::TrailingBytes { .. }));
        prop_assert!(rejected);
    }

    /// Property: Tile edits survive the wire unchanged
    #[test]
    fn tile_changed_roundtrips(
        x in -512i32..512,
        y in -512i32..512,
        layer in layer(),
        state in tile_state(),
        peer in 1u64..1000,
    ) {
        let payload = Payload::TileChanged(TileChanged {
            key: TileKey::new(x, y, layer),
            state,
            actor: Actor::new(PeerId(peer), "builder"),
        });
        let message = encode(&payload).expect("encode");
        let (_, decoded) = decode_frame(message.as_frame().to_vec()).expect("decode");
        prop_assert_eq!(decoded, payload);
    }

    /// Property: Tile batches keep their order and layer
    #[test]
    fn tile_batches_roundtrip(
        layer in layer(),
        tiles in prop::collection::vec(((-64i32..64, -64i32..64), tile_state()), 0..40),
    ) {
        let tiles: Vec<(TilePos, TileState)> = tiles
            .into_iter()
            .map(|((x, y), state)| (TilePos::new(x, y), state))
            .collect();
        let payload = Payload::TileUpdated(TileUpdated { layer, tiles });
        let message = encode(&payload).expect("encode");
        let (_, decoded) = decode_frame(message.as_frame().to_vec()).expect("decode");
        prop_assert_eq!(decoded, payload);
    }

    /// Property: Chat over the length limit is refused by the receiver
    #[test]
    fn oversized_chat_is_refused(extra in 1usize..64) {
        let payload = Payload::ChatMessage(ChatMessage {
            author: Actor::new(PeerId(3), "talker"),
            text: "a".repeat(MAX_CHAT_LEN + extra),
        });
        let message = encode(&payload).expect("encode");
        let refused = matches!(
            decode_frame(message.as_frame().to_vec()),
            Err(NetError::Limit { field: "text", .. })
        );
        prop_assert!(refused);
    }
}
