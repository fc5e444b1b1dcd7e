// src/core/mod.rs

//! The transport-independent core of the RPC channel: wire format, handshake,
//! message registries and the per-session delivery machinery.

pub mod errors;
pub mod handshake;
pub mod messages;
pub mod protocol;
pub mod rpc;

pub use errors::RpcError;
pub use messages::{MessageKind, MessageRegistry, Reply, Request};
pub use protocol::Frame;
