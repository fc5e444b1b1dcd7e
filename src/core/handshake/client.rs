// src/core/handshake/client.rs

//! The client side of the handshake.

use super::server::hook_error;
use super::{
    AuthResult, ClientHandshakeHook, HandshakeIo, HandshakeOutcome, HandshakeStream,
    SessionRegistrationResult,
};
use crate::core::RpcError;
use crate::core::messages::MessageRegistry;
use crate::core::protocol::primitives::{self, AuthToken};
use crate::core::protocol::{NegotiatedMappings, TypeMapping};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// What the client learned from a successful handshake.
#[derive(Debug)]
pub struct EstablishedHandshake {
    /// `NewSession` or `ReusedSession`.
    pub outcome: HandshakeOutcome,
    pub ping_interval: Duration,
    pub mappings: NegotiatedMappings,
}

/// Runs the client side of the handshake. `In` is the registry of messages the
/// server sends, `Out` the registry of messages the client sends.
pub async fn perform<S, In, Out>(
    stream: &mut S,
    token: &AuthToken,
    session_guid: Uuid,
    hook: &dyn ClientHandshakeHook,
) -> Result<EstablishedHandshake, RpcError>
where
    S: HandshakeStream,
    In: MessageRegistry,
    Out: MessageRegistry,
{
    primitives::write_auth_token(stream, token).await?;
    stream.flush().await?;
    let auth_byte = primitives::read_byte(stream).await?;
    match AuthResult::from_u8(auth_byte) {
        Some(AuthResult::Success) => {}
        Some(rejected) => return Err(RpcError::AuthRejected(rejected)),
        None => {
            return Err(RpcError::Protocol(format!(
                "unexpected auth result byte {auth_byte}"
            )));
        }
    }

    primitives::write_guid(stream, &session_guid).await?;
    stream.flush().await?;
    let registration_byte = primitives::read_byte(stream).await?;
    match SessionRegistrationResult::from_u8(registration_byte) {
        Some(SessionRegistrationResult::Success) => {}
        Some(SessionRegistrationResult::AlreadyClosed) => {
            return Err(RpcError::SessionAlreadyClosed);
        }
        None => {
            return Err(RpcError::Protocol(format!(
                "unexpected session registration byte {registration_byte}"
            )));
        }
    }

    let ping_secs = primitives::read_short(stream).await?;
    if ping_secs == 0 {
        return Err(RpcError::Protocol("server announced a zero ping interval".to_string()));
    }
    let to_client = primitives::read_type_list(stream).await?;
    let to_server = primitives::read_type_list(stream).await?;
    let mappings = NegotiatedMappings {
        outbound: TypeMapping::from_announced::<Out, _>(&to_server[..]),
        inbound: TypeMapping::from_announced::<In, _>(&to_client[..]),
    };

    let mut io = HandshakeIo::new(stream, token.client_guid);
    hook.on_handshake(&mut io).await.map_err(hook_error)?;

    let outcome_byte = primitives::read_byte(stream).await?;
    let outcome = match HandshakeOutcome::from_u8(outcome_byte) {
        Some(HandshakeOutcome::Error) => {
            return Err(RpcError::HandshakeFailed(
                "server reported a handshake error".to_string(),
            ));
        }
        Some(outcome) => outcome,
        None => {
            return Err(RpcError::Protocol(format!(
                "unexpected handshake outcome byte {outcome_byte}"
            )));
        }
    };
    debug!(
        "Handshake complete: {:?}, ping interval {}s, {} outbound and {} inbound message types.",
        outcome,
        ping_secs,
        mappings.outbound.len(),
        mappings.inbound.len()
    );

    Ok(EstablishedHandshake {
        outcome,
        ping_interval: Duration::from_secs(u64::from(ping_secs)),
        mappings,
    })
}
