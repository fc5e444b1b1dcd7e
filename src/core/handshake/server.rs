// src/core/handshake/server.rs

//! The server side of the handshake.

use super::{
    AuthResult, AuthSecretProvider, HandshakeIo, HandshakeOutcome, HandshakeStream,
    ServerHandshakeHook, SessionRegistrationResult,
};
use crate::core::RpcError;
use crate::core::messages::MessageRegistry;
use crate::core::protocol::primitives;
use crate::core::protocol::{NegotiatedMappings, TypeMapping};
use std::marker::PhantomData;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Binds an authenticated client to its session during step 4.
pub trait SessionBinder: Send + Sync {
    type Session: Send + Sync;

    /// Returns the session for the pair, or `None` if the session guid was
    /// already closed. `created` is true if the session did not exist before.
    fn bind(&self, client_guid: Uuid, session_guid: Uuid) -> Option<BoundSession<Self::Session>>;

    /// Drops a session this handshake created after the handshake failed.
    fn discard(&self, session: &Self::Session);
}

/// A session resolved by a `SessionBinder`.
#[derive(Debug)]
pub struct BoundSession<S> {
    pub session: S,
    pub created: bool,
}

/// What the server announces in step 5.
#[derive(Debug, Clone)]
pub struct ServerHandshakeParams<ToClient, ToServer> {
    pub ping_interval: Duration,
    _registries: PhantomData<fn() -> (ToClient, ToServer)>,
}

impl<ToClient: MessageRegistry, ToServer: MessageRegistry> ServerHandshakeParams<ToClient, ToServer> {
    pub fn new(ping_interval: Duration) -> Self {
        Self {
            ping_interval,
            _registries: PhantomData,
        }
    }
}

/// A completed server handshake.
#[derive(Debug)]
pub struct AcceptedHandshake<S> {
    pub client_guid: Uuid,
    pub session_guid: Uuid,
    pub session: S,
    pub outcome: HandshakeOutcome,
    pub mappings: NegotiatedMappings,
}

/// Runs the server side of the handshake on an established stream.
///
/// No session is created before the client has authenticated. If the
/// application hook fails, `Error` is written. A session created by this
/// handshake is discarded unless the handshake completes, also when the
/// returned future is dropped midway.
pub async fn perform<S, B, ToClient, ToServer>(
    stream: &mut S,
    params: &ServerHandshakeParams<ToClient, ToServer>,
    auth: &dyn AuthSecretProvider,
    binder: &B,
    hook: &dyn ServerHandshakeHook,
) -> Result<AcceptedHandshake<B::Session>, RpcError>
where
    S: HandshakeStream,
    B: SessionBinder + ?Sized,
    ToClient: MessageRegistry,
    ToServer: MessageRegistry,
{
    // Steps 1 and 2: authenticate.
    let token = primitives::read_auth_token(stream).await?;
    let client_guid = token.client_guid;
    let auth_result = match auth.get_auth_secret(client_guid).await {
        None => AuthResult::UnknownClient,
        Some(expected) if !expected.fixed_time_eq(&token.secret) => AuthResult::InvalidSecret,
        Some(_) => AuthResult::Success,
    };
    primitives::write_byte(stream, auth_result.as_u8()).await?;
    stream.flush().await?;
    if auth_result != AuthResult::Success {
        warn!("Rejected client {}: {:?}.", client_guid, auth_result);
        return Err(RpcError::AuthRejected(auth_result));
    }

    // Steps 3 and 4: bind the session.
    let session_guid = primitives::read_guid(stream).await?;
    let Some(bound) = binder.bind(client_guid, session_guid) else {
        primitives::write_byte(stream, SessionRegistrationResult::AlreadyClosed.as_u8()).await?;
        stream.flush().await?;
        info!(
            "Client {} asked for session {} which is already closed.",
            client_guid, session_guid
        );
        return Err(RpcError::SessionAlreadyClosed);
    };

    // Until the outcome is on the wire, a session created here is discarded on
    // any exit, including this future being dropped by a timeout.
    let binding = CreatedBinding {
        binder,
        session: &bound.session,
        armed: bound.created,
    };

    let result = negotiate_and_run_hook::<S, ToClient, ToServer>(stream, params, client_guid, hook)
        .await;
    let mappings = match result {
        Ok(mappings) => mappings,
        Err(e) => {
            // Best effort: the stream may already be unusable.
            if !e.is_transport() {
                let _ = primitives::write_byte(stream, HandshakeOutcome::Error.as_u8()).await;
                let _ = stream.flush().await;
            }
            return Err(e);
        }
    };

    let outcome = if bound.created {
        HandshakeOutcome::NewSession
    } else {
        HandshakeOutcome::ReusedSession
    };
    primitives::write_byte(stream, outcome.as_u8()).await?;
    stream.flush().await?;
    binding.complete();
    debug!(
        "Handshake with client {} complete: {:?} {}.",
        client_guid, outcome, session_guid
    );
    Ok(AcceptedHandshake {
        client_guid,
        session_guid,
        session: bound.session,
        outcome,
        mappings,
    })
}

/// Discards a session created by the running handshake unless `complete` is called.
struct CreatedBinding<'a, B: SessionBinder + ?Sized> {
    binder: &'a B,
    session: &'a B::Session,
    armed: bool,
}

impl<B: SessionBinder + ?Sized> CreatedBinding<'_, B> {
    fn complete(mut self) {
        self.armed = false;
    }
}

impl<B: SessionBinder + ?Sized> Drop for CreatedBinding<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            self.binder.discard(self.session);
        }
    }
}

async fn negotiate_and_run_hook<S, ToClient, ToServer>(
    stream: &mut S,
    params: &ServerHandshakeParams<ToClient, ToServer>,
    client_guid: Uuid,
    hook: &dyn ServerHandshakeHook,
) -> Result<NegotiatedMappings, RpcError>
where
    S: HandshakeStream,
    ToClient: MessageRegistry,
    ToServer: MessageRegistry,
{
    let ping_secs = u16::try_from(params.ping_interval.as_secs())
        .unwrap_or(u16::MAX)
        .max(1);
    primitives::write_byte(stream, SessionRegistrationResult::Success.as_u8()).await?;
    primitives::write_short(stream, ping_secs).await?;
    primitives::write_type_list(stream, ToClient::names().as_slice()).await?;
    primitives::write_type_list(stream, ToServer::names().as_slice()).await?;
    stream.flush().await?;

    let mut io = HandshakeIo::new(stream, client_guid);
    hook.on_handshake(&mut io).await.map_err(hook_error)?;

    Ok(NegotiatedMappings {
        outbound: TypeMapping::local::<ToClient>(),
        inbound: TypeMapping::local::<ToServer>(),
    })
}

/// Hook failures other than transport errors fail the handshake as a whole.
pub(super) fn hook_error(e: RpcError) -> RpcError {
    if e.is_transport() || matches!(e, RpcError::HandshakeFailed(_)) {
        e
    } else {
        RpcError::HandshakeFailed(e.to_string())
    }
}
