// src/core/protocol/mod.rs

pub mod frame;
pub mod primitives;
pub mod type_mapping;

pub use frame::{Frame, FrameCodec, MAX_FRAME_BODY, MessageErrorCode};
pub use primitives::{AUTH_SECRET_LEN, AuthSecret, AuthToken};
pub use type_mapping::{NegotiatedMappings, TypeMapping};
