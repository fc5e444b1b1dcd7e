// src/server/context.rs

use super::registry::SessionRegistry;
use crate::config::RpcServerConfig;
use crate::core::handshake::AuthSecretProvider;
use crate::core::handshake::server::ServerHandshakeParams;
use crate::core::rpc::ConnectionIdSequence;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Holds everything a connection task needs. `In` is the registry of messages
/// the server receives, `Out` the registry it sends.
pub(crate) struct ServerContext<In, Out, A: ?Sized> {
    pub config: RpcServerConfig,
    pub app: Arc<A>,
    pub auth: Arc<dyn AuthSecretProvider>,
    pub registry: SessionRegistry,
    pub acceptor: Option<TlsAcceptor>,
    pub params: ServerHandshakeParams<Out, In>,
    pub connection_ids: ConnectionIdSequence,
}
