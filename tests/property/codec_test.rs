// tests/property/codec_test.rs

//! Property-based tests for `FrameCodec`.

use bytes::{Bytes, BytesMut};
use craftlink::core::protocol::{Frame, FrameCodec, MessageErrorCode};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn arb_error_code() -> impl Strategy<Value = MessageErrorCode> {
    any::<u8>().prop_map(MessageErrorCode::from)
}

fn arb_frame() -> impl Strategy<Value = Frame> {
    prop_oneof![
        (any::<u32>(), any::<u8>(), prop::collection::vec(any::<u8>(), 0..512)).prop_map(
            |(message_id, type_code, payload)| Frame::Message {
                message_id,
                type_code,
                payload: Bytes::from(payload),
            }
        ),
        (any::<u32>(), prop::collection::vec(any::<u8>(), 0..512)).prop_map(
            |(replying_to, payload)| Frame::MessageReply {
                replying_to,
                payload: Bytes::from(payload),
            }
        ),
        (any::<u32>(), arb_error_code()).prop_map(|(replying_to, error_code)| {
            Frame::MessageError {
                replying_to,
                error_code,
            }
        }),
        any::<u64>().prop_map(|sent_at_ms| Frame::Ping { sent_at_ms }),
        any::<u64>().prop_map(|ping_sent_at_ms| Frame::Pong { ping_sent_at_ms }),
        Just(Frame::SessionTermination),
    ]
}

fn encode_all(frames: &[Frame]) -> BytesMut {
    let mut buf = BytesMut::new();
    for frame in frames {
        FrameCodec.encode(frame.clone(), &mut buf).unwrap();
    }
    buf
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_chunked_stream_decodes_identically(
        frames in prop::collection::vec(arb_frame(), 1..20),
        chunk in 1usize..64,
    ) {
        let bytes = encode_all(&frames);
        let mut decoded = Vec::new();
        let mut buf = BytesMut::new();
        for piece in bytes.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(frame) = FrameCodec.decode(&mut buf).unwrap() {
                decoded.push(frame);
            }
        }
        prop_assert!(buf.is_empty());
        prop_assert_eq!(decoded, frames);
    }

    #[test]
    fn test_unknown_tags_are_skipped(
        before in prop::collection::vec(arb_frame(), 0..5),
        after in prop::collection::vec(arb_frame(), 0..5),
        tag in 7u8..=255,
        body in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut buf = encode_all(&before);
        buf.extend_from_slice(&[tag]);
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        buf.extend_from_slice(&encode_all(&after));

        let mut decoded = Vec::new();
        while let Some(frame) = FrameCodec.decode(&mut buf).unwrap() {
            decoded.push(frame);
        }
        let expected: Vec<Frame> = before.into_iter().chain(after).collect();
        prop_assert_eq!(decoded, expected);
    }

    #[test]
    fn test_message_body_layout(
        message_id in any::<u32>(),
        type_code in any::<u8>(),
        payload in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let frame = Frame::Message {
            message_id,
            type_code,
            payload: Bytes::from(payload.clone()),
        };
        let bytes = frame.encode_to_vec().unwrap();
        prop_assert_eq!(bytes[0], 1);
        let body_len = u32::from_le_bytes(bytes[1..5].try_into().unwrap()) as usize;
        prop_assert_eq!(body_len, 5 + payload.len());
        prop_assert_eq!(&bytes[5..9], &message_id.to_le_bytes()[..]);
        prop_assert_eq!(bytes[9], type_code);
        prop_assert_eq!(&bytes[10..], &payload[..]);
    }
}
