// src/core/protocol/frame.rs

//! Implements the wire frames exchanged after the handshake and the
//! corresponding `Encoder` and `Decoder` for network communication.
//!
//! Every frame is written as `[tag:u8][body_len:u32][body]`. The length prefix
//! lets a Message carry its payload as "the rest of the body" and lets the
//! decoder step over frames whose tag it does not know.

use crate::core::RpcError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Size of the `[tag][body_len]` prefix.
const HEADER_LEN: usize = 5;

/// Protocol-level limit to prevent a peer from forcing huge allocations.
pub const MAX_FRAME_BODY: usize = 64 * 1024 * 1024;

const TAG_MESSAGE: u8 = 1;
const TAG_MESSAGE_REPLY: u8 = 2;
const TAG_MESSAGE_ERROR: u8 = 3;
const TAG_PING: u8 = 4;
const TAG_PONG: u8 = 5;
const TAG_SESSION_TERMINATION: u8 = 6;

/// Error codes carried by a `MessageError` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageErrorCode {
    /// The receiver has no mapping for the message's type code.
    UnknownMessageType,
    /// The payload could not be decoded into the negotiated type.
    DeserializationFailed,
    /// The application handler failed or produced no reply.
    MessageHandlingError,
    /// A code this version does not know about.
    Other(u8),
}

impl MessageErrorCode {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageErrorCode::UnknownMessageType => 1,
            MessageErrorCode::DeserializationFailed => 2,
            MessageErrorCode::MessageHandlingError => 3,
            MessageErrorCode::Other(code) => code,
        }
    }
}

impl From<u8> for MessageErrorCode {
    fn from(code: u8) -> Self {
        match code {
            1 => MessageErrorCode::UnknownMessageType,
            2 => MessageErrorCode::DeserializationFailed,
            3 => MessageErrorCode::MessageHandlingError,
            other => MessageErrorCode::Other(other),
        }
    }
}

/// One wire-level unit of the frame loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message {
        message_id: u32,
        type_code: u8,
        payload: Bytes,
    },
    MessageReply {
        replying_to: u32,
        payload: Bytes,
    },
    MessageError {
        replying_to: u32,
        error_code: MessageErrorCode,
    },
    /// Liveness probe. The timestamp is echoed back in the matching `Pong`.
    Ping { sent_at_ms: u64 },
    Pong { ping_sent_at_ms: u64 },
    SessionTermination,
}

impl Frame {
    /// A short, stable name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Message { .. } => "Message",
            Frame::MessageReply { .. } => "MessageReply",
            Frame::MessageError { .. } => "MessageError",
            Frame::Ping { .. } => "Ping",
            Frame::Pong { .. } => "Pong",
            Frame::SessionTermination => "SessionTermination",
        }
    }

    /// The id of a `Message` frame, used to key the unacknowledged set.
    pub fn message_id(&self) -> Option<u32> {
        match self {
            Frame::Message { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }

    /// A convenience method to encode a frame into a `Vec<u8>`.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, RpcError> {
        let mut buf = BytesMut::new();
        FrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `Frame`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = RpcError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (tag, body_len) = match &item {
            Frame::Message { payload, .. } => (TAG_MESSAGE, 4 + 1 + payload.len()),
            Frame::MessageReply { payload, .. } => (TAG_MESSAGE_REPLY, 4 + payload.len()),
            Frame::MessageError { .. } => (TAG_MESSAGE_ERROR, 4 + 1),
            Frame::Ping { .. } => (TAG_PING, 8),
            Frame::Pong { .. } => (TAG_PONG, 8),
            Frame::SessionTermination => (TAG_SESSION_TERMINATION, 0),
        };
        if body_len > MAX_FRAME_BODY {
            return Err(RpcError::FrameTooLarge(body_len));
        }

        dst.reserve(HEADER_LEN + body_len);
        dst.put_u8(tag);
        dst.put_u32_le(body_len as u32);
        match item {
            Frame::Message {
                message_id,
                type_code,
                payload,
            } => {
                dst.put_u32_le(message_id);
                dst.put_u8(type_code);
                dst.extend_from_slice(&payload);
            }
            Frame::MessageReply {
                replying_to,
                payload,
            } => {
                dst.put_u32_le(replying_to);
                dst.extend_from_slice(&payload);
            }
            Frame::MessageError {
                replying_to,
                error_code,
            } => {
                dst.put_u32_le(replying_to);
                dst.put_u8(error_code.as_u8());
            }
            Frame::Ping { sent_at_ms } => dst.put_u64_le(sent_at_ms),
            Frame::Pong { ping_sent_at_ms } => dst.put_u64_le(ping_sent_at_ms),
            Frame::SessionTermination => {}
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RpcError;

    /// Decodes the next complete frame. Frames with an unknown tag or a truncated
    /// body are skipped and logged; the stream stays usable because their length
    /// is known.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            let tag = src[0];
            let body_len = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
            if body_len > MAX_FRAME_BODY {
                return Err(RpcError::FrameTooLarge(body_len));
            }
            if src.len() < HEADER_LEN + body_len {
                src.reserve(HEADER_LEN + body_len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_LEN);
            let mut body = src.split_to(body_len).freeze();
            match decode_body(tag, &mut body) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {
                    warn!(
                        "Dropping frame with unknown tag {} ({} byte body).",
                        tag, body_len
                    );
                }
                Err(e) => warn!("Dropping malformed frame: {}", e),
            }
        }
    }
}

fn decode_body(tag: u8, body: &mut Bytes) -> Result<Option<Frame>, RpcError> {
    let frame = match tag {
        TAG_MESSAGE => {
            ensure_len(body, 5, "Message")?;
            let message_id = body.get_u32_le();
            let type_code = body.get_u8();
            Frame::Message {
                message_id,
                type_code,
                payload: std::mem::take(body),
            }
        }
        TAG_MESSAGE_REPLY => {
            ensure_len(body, 4, "MessageReply")?;
            let replying_to = body.get_u32_le();
            Frame::MessageReply {
                replying_to,
                payload: std::mem::take(body),
            }
        }
        TAG_MESSAGE_ERROR => {
            ensure_len(body, 5, "MessageError")?;
            Frame::MessageError {
                replying_to: body.get_u32_le(),
                error_code: MessageErrorCode::from(body.get_u8()),
            }
        }
        TAG_PING => {
            ensure_len(body, 8, "Ping")?;
            Frame::Ping {
                sent_at_ms: body.get_u64_le(),
            }
        }
        TAG_PONG => {
            ensure_len(body, 8, "Pong")?;
            Frame::Pong {
                ping_sent_at_ms: body.get_u64_le(),
            }
        }
        TAG_SESSION_TERMINATION => Frame::SessionTermination,
        _ => return Ok(None),
    };
    Ok(Some(frame))
}

fn ensure_len(body: &Bytes, needed: usize, kind: &str) -> Result<(), RpcError> {
    if body.len() < needed {
        return Err(RpcError::Protocol(format!(
            "{kind} frame body too short: {} < {needed}",
            body.len()
        )));
    }
    Ok(())
}
