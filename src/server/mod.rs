// src/server/mod.rs

//! The server end of the channel: accepts clients, authenticates them and keeps
//! one `Session` per client across reconnects.

use crate::config::RpcServerConfig;
use crate::connection::{MessageReceiver, MessageSender};
use crate::core::RpcError;
use crate::core::handshake::server::ServerHandshakeParams;
use crate::core::handshake::{AuthSecretProvider, HandshakeOutcome, ServerHandshakeHook, tls};
use crate::core::messages::MessageRegistry;
use crate::core::rpc::ConnectionIdSequence;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

mod connection_loop;
mod context;
mod registry;
mod session;

use context::ServerContext;
pub use registry::{SessionRegistry, SessionSettings};
pub use session::{Session, SessionState};

/// A connection that completed its handshake and is about to start reading.
pub struct RegisteredConnection<Out> {
    pub client_guid: Uuid,
    pub session_guid: Uuid,
    pub outcome: HandshakeOutcome,
    pub peer: SocketAddr,
    /// Sends to this client. Stays valid across reconnects of the same session.
    pub sender: MessageSender<Out>,
}

/// The application behind an `RpcServer`. `In` is what clients send, `Out`
/// what the server sends back.
#[async_trait]
pub trait ServerApplication<In: MessageRegistry, Out: MessageRegistry>:
    ServerHandshakeHook + 'static
{
    /// Called once per accepted connection. The returned receiver handles every
    /// message read from it.
    async fn register(
        &self,
        connection: RegisteredConnection<Out>,
    ) -> Result<Arc<dyn MessageReceiver<In>>, RpcError>;
}

/// A bound but not yet running server.
pub struct RpcServer<In, Out, A> {
    ctx: Arc<ServerContext<In, Out, A>>,
    listener: TcpListener,
}

impl<In, Out, A> RpcServer<In, Out, A>
where
    In: MessageRegistry,
    Out: MessageRegistry,
    A: ServerApplication<In, Out>,
{
    /// Validates `config`, loads TLS material if enabled and binds the listener.
    pub async fn bind(
        config: RpcServerConfig,
        app: Arc<A>,
        auth: Arc<dyn AuthSecretProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let acceptor = if config.tls.enabled {
            info!("TLS is enabled. Loading certificate and key.");
            Some(tls::build_acceptor(&config.tls.cert_path, &config.tls.key_path)?)
        } else {
            None
        };

        let bind_addr = config.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind to address {bind_addr}"))?;
        info!(
            "craftlink {} server listening on {}",
            crate::VERSION,
            listener.local_addr()?
        );

        let settings = SessionSettings {
            frame_sender: config.queues.frame_sender(config.pong_timeout),
            disconnect_timeout: config.disconnect_session_timeout,
            grace_period: config.shutdown_grace_period,
        };
        let registry = SessionRegistry::new(settings);
        let params = ServerHandshakeParams::new(config.ping_interval());

        Ok(Self {
            ctx: Arc::new(ServerContext {
                config,
                app,
                auth,
                registry,
                acceptor,
                params,
                connection_ids: ConnectionIdSequence::default(),
            }),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The live session table.
    pub fn sessions(&self) -> SessionRegistry {
        self.ctx.registry.clone()
    }

    /// Serves until `shutdown` fires, then closes every session.
    pub async fn run(self, shutdown: CancellationToken) {
        connection_loop::run(self.ctx, self.listener, shutdown).await;
    }

    /// Serves until SIGINT or SIGTERM.
    pub async fn run_until_signal(self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| anyhow!("Failed to register SIGINT handler: {}", e))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow!("Failed to register SIGTERM handler: {}", e))?;

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
                _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
            }
            trigger.cancel();
        });

        self.run(shutdown).await;
        Ok(())
    }
}
