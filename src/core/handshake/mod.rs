// src/core/handshake/mod.rs

//! The connection handshake that runs once TLS is established.
//!
//! The exchange, in order:
//!
//! 1. client -> server: auth token (`[client guid:16][secret:32]`)
//! 2. server -> client: `AuthResult` byte; anything but `Success` ends the exchange
//! 3. client -> server: session guid
//! 4. server -> client: `SessionRegistrationResult` byte
//! 5. server -> client: ping interval (u16 seconds), to-client type list,
//!    to-server type list
//! 6. application hook with raw stream access (`HandshakeIo`)
//! 7. server -> client: `HandshakeOutcome` byte
//!
//! After step 7 both sides switch to the frame loop.

pub mod client;
pub mod server;
pub mod tls;

use crate::core::RpcError;
use crate::core::messages::MessageRegistry;
use crate::core::protocol::MAX_FRAME_BODY;
use crate::core::protocol::primitives::{self, AuthSecret};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Result of the auth-token check (step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    UnknownClient,
    InvalidSecret,
    Success,
}

impl AuthResult {
    pub fn as_u8(self) -> u8 {
        match self {
            AuthResult::UnknownClient => 0,
            AuthResult::InvalidSecret => 1,
            AuthResult::Success => 255,
        }
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(AuthResult::UnknownClient),
            1 => Some(AuthResult::InvalidSecret),
            255 => Some(AuthResult::Success),
            _ => None,
        }
    }
}

/// Result of binding the client's session guid (step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRegistrationResult {
    Success,
    /// The session guid was torn down earlier and must not be reused.
    AlreadyClosed,
}

impl SessionRegistrationResult {
    pub fn as_u8(self) -> u8 {
        match self {
            SessionRegistrationResult::Success => 255,
            SessionRegistrationResult::AlreadyClosed => 1,
        }
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            255 => Some(SessionRegistrationResult::Success),
            1 => Some(SessionRegistrationResult::AlreadyClosed),
            _ => None,
        }
    }
}

/// The final byte of the handshake (step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    NewSession,
    ReusedSession,
    /// The application hook failed on the server.
    Error,
}

impl HandshakeOutcome {
    pub fn as_u8(self) -> u8 {
        match self {
            HandshakeOutcome::Error => 0,
            HandshakeOutcome::NewSession => 1,
            HandshakeOutcome::ReusedSession => 2,
        }
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(HandshakeOutcome::Error),
            1 => Some(HandshakeOutcome::NewSession),
            2 => Some(HandshakeOutcome::ReusedSession),
            _ => None,
        }
    }
}

/// Resolves the expected secret for a client guid.
#[async_trait]
pub trait AuthSecretProvider: Send + Sync {
    async fn get_auth_secret(&self, client_guid: Uuid) -> Option<AuthSecret>;
}

/// An `AuthSecretProvider` backed by a fixed table, typically loaded from config.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthProvider {
    secrets: HashMap<Uuid, AuthSecret>,
}

impl StaticAuthProvider {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, client_guid: Uuid, secret: AuthSecret) {
        self.secrets.insert(client_guid, secret);
    }

    pub fn with_client(mut self, client_guid: Uuid, secret: AuthSecret) -> Self {
        self.insert(client_guid, secret);
        self
    }

    /// Builds a provider from `(guid, hex secret)` pairs.
    pub fn from_hex_entries<'a, I>(entries: I) -> Result<Self, RpcError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut provider = Self::new();
        for (guid, secret) in entries {
            let guid = Uuid::parse_str(guid)
                .map_err(|e| RpcError::Config(format!("invalid client guid '{guid}': {e}")))?;
            provider.insert(guid, AuthSecret::from_hex(secret)?);
        }
        Ok(provider)
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[async_trait]
impl AuthSecretProvider for StaticAuthProvider {
    async fn get_auth_secret(&self, client_guid: Uuid) -> Option<AuthSecret> {
        self.secrets.get(&client_guid).cloned()
    }
}

/// Any duplex byte stream the handshake can run over.
pub trait HandshakeStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> HandshakeStream for T {}

/// Raw access to the authenticated stream for the application hook (step 6).
///
/// Anything written here must be read by the peer's hook in the same order;
/// the channel itself does not frame it. `send_registration` and
/// `receive_registration` length-prefix a single registration message.
pub struct HandshakeIo<'a> {
    stream: &'a mut dyn HandshakeStream,
    client_guid: Uuid,
}

impl<'a> HandshakeIo<'a> {
    pub(crate) fn new(stream: &'a mut dyn HandshakeStream, client_guid: Uuid) -> Self {
        Self {
            stream,
            client_guid,
        }
    }

    /// The authenticated client's guid.
    pub fn client_guid(&self) -> Uuid {
        self.client_guid
    }

    /// The underlying stream, for hooks that speak their own format.
    pub fn stream(&mut self) -> &mut dyn HandshakeStream {
        &mut *self.stream
    }

    pub async fn flush(&mut self) -> Result<(), RpcError> {
        Ok(self.stream.flush().await?)
    }

    /// Sends the registry's registration message as `[len:u32][payload]`.
    /// Other kinds are rejected.
    pub async fn send_registration<M: MessageRegistry>(&mut self, message: &M) -> Result<(), RpcError> {
        let name = message.name();
        if !M::kind(name).is_some_and(|k| k.registration) {
            return Err(RpcError::UnsupportedMessageType(name));
        }
        let payload = message.encode_payload()?;
        if payload.len() > MAX_FRAME_BODY {
            return Err(RpcError::FrameTooLarge(payload.len()));
        }
        primitives::write_int(&mut *self.stream, payload.len() as u32).await?;
        self.stream.write_all(&payload).await?;
        self.flush().await
    }

    /// Receives the registration message written by the peer's `send_registration`.
    pub async fn receive_registration<M: MessageRegistry>(&mut self) -> Result<M, RpcError> {
        let kind = M::registration_kind().ok_or_else(|| {
            RpcError::Protocol("registry declares no registration message".to_string())
        })?;
        let len = primitives::read_int(&mut *self.stream).await? as usize;
        if len > MAX_FRAME_BODY {
            return Err(RpcError::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        M::decode_payload(kind.name, &payload)
    }
}

/// The server application's part of step 6.
#[async_trait]
pub trait ServerHandshakeHook: Send + Sync {
    async fn on_handshake(&self, io: &mut HandshakeIo<'_>) -> Result<(), RpcError>;
}

/// The client application's part of step 6.
#[async_trait]
pub trait ClientHandshakeHook: Send + Sync {
    async fn on_handshake(&self, io: &mut HandshakeIo<'_>) -> Result<(), RpcError>;
}

/// A hook that exchanges nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHandshakeHook;

#[async_trait]
impl ServerHandshakeHook for NoHandshakeHook {
    async fn on_handshake(&self, _io: &mut HandshakeIo<'_>) -> Result<(), RpcError> {
        Ok(())
    }
}

#[async_trait]
impl ClientHandshakeHook for NoHandshakeHook {
    async fn on_handshake(&self, _io: &mut HandshakeIo<'_>) -> Result<(), RpcError> {
        Ok(())
    }
}
