// src/core/errors.rs

//! Defines the primary error type for the RPC channel.

use crate::core::handshake::AuthResult;
use crate::core::protocol::MessageErrorCode;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing every failure the RPC layer can surface.
/// Transport, handshake, protocol, handler and reply-wait failures are kept apart
/// so callers can decide whether to retry, reconnect, or give up.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("TLS Error: {0}")]
    Tls(String),

    #[error("Authentication rejected: {0:?}")]
    AuthRejected(AuthResult),

    #[error("Session was already closed and cannot be reused")]
    SessionAlreadyClosed,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame body of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("Unknown message type '{0}'")]
    UnknownMessageType(String),

    #[error("Message type '{0}' is not supported by the peer")]
    UnsupportedMessageType(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Message handler failed: {0}")]
    Handler(String),

    #[error("Peer reported an error for the request: {0:?}")]
    RemoteError(MessageErrorCode),

    #[error("Timed out waiting for a reply")]
    ReplyTimeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RpcError {
    /// Returns true for errors that end the current physical connection but not the session.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::Io(_) | RpcError::ConnectionClosed | RpcError::Tls(_)
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for RpcError {
    fn clone(&self) -> Self {
        match self {
            RpcError::Io(e) => RpcError::Io(Arc::clone(e)),
            RpcError::ConnectionClosed => RpcError::ConnectionClosed,
            RpcError::Tls(s) => RpcError::Tls(s.clone()),
            RpcError::AuthRejected(r) => RpcError::AuthRejected(*r),
            RpcError::SessionAlreadyClosed => RpcError::SessionAlreadyClosed,
            RpcError::HandshakeFailed(s) => RpcError::HandshakeFailed(s.clone()),
            RpcError::HandshakeTimeout => RpcError::HandshakeTimeout,
            RpcError::Protocol(s) => RpcError::Protocol(s.clone()),
            RpcError::FrameTooLarge(n) => RpcError::FrameTooLarge(*n),
            RpcError::UnknownMessageType(s) => RpcError::UnknownMessageType(s.clone()),
            RpcError::UnsupportedMessageType(s) => RpcError::UnsupportedMessageType(s),
            RpcError::Serialization(s) => RpcError::Serialization(s.clone()),
            RpcError::Handler(s) => RpcError::Handler(s.clone()),
            RpcError::RemoteError(c) => RpcError::RemoteError(*c),
            RpcError::ReplyTimeout => RpcError::ReplyTimeout,
            RpcError::Cancelled => RpcError::Cancelled,
            RpcError::SessionClosed => RpcError::SessionClosed,
            RpcError::Config(s) => RpcError::Config(s.clone()),
        }
    }
}

impl PartialEq for RpcError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RpcError::Io(e1), RpcError::Io(e2)) => e1.kind() == e2.kind(),
            (RpcError::Tls(s1), RpcError::Tls(s2)) => s1 == s2,
            (RpcError::AuthRejected(r1), RpcError::AuthRejected(r2)) => r1 == r2,
            (RpcError::HandshakeFailed(s1), RpcError::HandshakeFailed(s2)) => s1 == s2,
            (RpcError::Protocol(s1), RpcError::Protocol(s2)) => s1 == s2,
            (RpcError::FrameTooLarge(n1), RpcError::FrameTooLarge(n2)) => n1 == n2,
            (RpcError::UnknownMessageType(s1), RpcError::UnknownMessageType(s2)) => s1 == s2,
            (RpcError::UnsupportedMessageType(s1), RpcError::UnsupportedMessageType(s2)) => {
                s1 == s2
            }
            (RpcError::Serialization(s1), RpcError::Serialization(s2)) => s1 == s2,
            (RpcError::Handler(s1), RpcError::Handler(s2)) => s1 == s2,
            (RpcError::RemoteError(c1), RpcError::RemoteError(c2)) => c1 == c2,
            (RpcError::Config(s1), RpcError::Config(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return RpcError::ConnectionClosed;
        }
        RpcError::Io(Arc::new(e))
    }
}

impl From<bincode::error::EncodeError> for RpcError {
    fn from(e: bincode::error::EncodeError) -> Self {
        RpcError::Serialization(format!("encode failed: {e}"))
    }
}

impl From<bincode::error::DecodeError> for RpcError {
    fn from(e: bincode::error::DecodeError) -> Self {
        RpcError::Serialization(format!("decode failed: {e}"))
    }
}

impl From<rustls::Error> for RpcError {
    fn from(e: rustls::Error) -> Self {
        RpcError::Tls(e.to_string())
    }
}

impl From<uuid::Error> for RpcError {
    fn from(e: uuid::Error) -> Self {
        RpcError::Protocol(format!("invalid GUID: {e}"))
    }
}
