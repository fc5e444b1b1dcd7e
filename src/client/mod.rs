// src/client/mod.rs

//! The client end of the channel: connects, resumes its session across
//! reconnects, and keeps the outbound pipeline alive while disconnected.

use crate::config::RpcClientConfig;
use crate::connection::{
    AnyStream, ChannelSlot, ConnectionGuard, FrameReader, MessageReceiver, MessageSender,
    ReadOutcome, SessionChannel,
};
use crate::core::RpcError;
use crate::core::handshake::client::{self as handshake, EstablishedHandshake};
use crate::core::handshake::{ClientHandshakeHook, HandshakeOutcome, tls};
use crate::core::messages::MessageRegistry;
use crate::core::protocol::Frame;
use crate::core::protocol::primitives::AuthToken;
use crate::core::rpc::{BoxedReader, BoxedWriter, Connection, ConnectionIdSequence, MessageIdSequence};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::ServerName;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod backoff;

pub use backoff::Backoff;

/// The application behind an `RpcClient`. `In` is what the server sends,
/// `Out` what the client sends.
#[async_trait]
pub trait ClientApplication<In: MessageRegistry, Out: MessageRegistry>:
    ClientHandshakeHook + 'static
{
    /// Handles every inbound message, on every connection of this client.
    fn receiver(&self) -> Arc<dyn MessageReceiver<In>>;

    /// Called after each successful handshake, before frames are read.
    async fn on_connected(&self, _outcome: HandshakeOutcome) {}
}

/// How `RpcClient::run` ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// The caller's token fired; the server was told the session ended.
    Cancelled,
    /// The server ended the session. Its guid cannot be resumed.
    SessionTerminated,
}

type Established = (AnyStream, EstablishedHandshake);

/// A client with one session guid for its whole lifetime.
pub struct RpcClient<In, Out, A> {
    config: RpcClientConfig,
    app: Arc<A>,
    receiver: Arc<dyn MessageReceiver<In>>,
    token: AuthToken,
    session_guid: Uuid,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    slot: ChannelSlot,
    ids: Arc<MessageIdSequence>,
    connection_ids: ConnectionIdSequence,
    connected_once: AtomicBool,
    ready: Mutex<Option<Established>>,
    _registries: PhantomData<fn(In, Out)>,
}

impl<In, Out, A> RpcClient<In, Out, A>
where
    In: MessageRegistry,
    Out: MessageRegistry,
    A: ClientApplication<In, Out>,
{
    pub fn new(config: RpcClientConfig, app: Arc<A>) -> anyhow::Result<Self> {
        config.validate()?;
        let token = AuthToken {
            client_guid: config.client_guid,
            secret: config.auth_secret()?,
        };
        let tls = if config.tls.enabled {
            Some((
                tls::build_connector(
                    &config.tls.certificate_thumbprint,
                    &config.tls.allowed_signature_schemes,
                )?,
                tls::server_name(&config.tls.server_name)?,
            ))
        } else {
            None
        };
        let session_guid = Uuid::new_v4();
        let ids = Arc::new(MessageIdSequence::new());
        let channel = new_channel(&config, session_guid, ids.clone());
        info!(
            "Client {} using session {}.",
            config.client_guid, session_guid
        );

        Ok(Self {
            receiver: app.receiver(),
            app,
            token,
            session_guid,
            tls,
            slot: Arc::new(RwLock::new(channel)),
            ids,
            connection_ids: ConnectionIdSequence::default(),
            connected_once: AtomicBool::new(false),
            ready: Mutex::new(None),
            config,
            _registries: PhantomData,
        })
    }

    pub fn client_guid(&self) -> Uuid {
        self.token.client_guid
    }

    pub fn session_guid(&self) -> Uuid {
        self.session_guid
    }

    /// A sender that follows the client across reconnects and session restarts.
    pub fn sender(&self) -> MessageSender<Out> {
        MessageSender::new(self.slot.clone())
    }

    fn channel(&self) -> Arc<SessionChannel> {
        self.slot.read().clone()
    }

    /// Connects with the configured attempt limit. See `connect_with_retry`.
    pub async fn connect(&self) -> Result<HandshakeOutcome, RpcError> {
        self.connect_with_retry(self.config.backoff.max_attempts.unwrap_or(u32::MAX))
            .await
    }

    /// Establishes the first connection, trying at most `max_attempts` times.
    /// The connection is picked up by the next call to `run`.
    pub async fn connect_with_retry(&self, max_attempts: u32) -> Result<HandshakeOutcome, RpcError> {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        loop {
            match self.connect_once().await {
                Ok(established) => {
                    let outcome = established.1.outcome;
                    *self.ready.lock() = Some(established);
                    return Ok(outcome);
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    let delay = backoff.next_delay();
                    if backoff.attempts() >= max_attempts {
                        error!(
                            "Giving up on {} after {} attempts: {}",
                            self.config.server_address(),
                            backoff.attempts(),
                            e
                        );
                        return Err(e);
                    }
                    warn!(
                        "Connecting to {} failed (attempt {}): {}. Retrying in {:?}.",
                        self.config.server_address(),
                        backoff.attempts(),
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Keeps the client connected until `cancel` fires, the server ends the
    /// session, or the server rejects the client.
    ///
    /// Transport and handshake failures are retried forever with backoff.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ClientExit, RpcError> {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        loop {
            let ready = self.ready.lock().take();
            let attempt = match ready {
                Some(established) => Ok(established),
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.close_channel().await;
                        return Ok(ClientExit::Cancelled);
                    }
                    res = self.connect_once() => res,
                },
            };

            match attempt {
                Ok((stream, established)) => {
                    backoff.reset();
                    match self.serve(stream, established, &cancel).await {
                        ReadOutcome::Disconnected => {
                            info!("Disconnected from {}; reconnecting.", self.config.server_address());
                        }
                        ReadOutcome::SessionTerminated => {
                            self.close_channel().await;
                            return Ok(ClientExit::SessionTerminated);
                        }
                        ReadOutcome::Cancelled => return Ok(ClientExit::Cancelled),
                    }
                }
                Err(e) if is_fatal(&e) => {
                    error!("Server refused client {}: {}", self.token.client_guid, e);
                    self.close_channel().await;
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "Connecting to {} failed (attempt {}): {}. Retrying in {:?}.",
                        self.config.server_address(),
                        backoff.attempts(),
                        e,
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            self.close_channel().await;
                            return Ok(ClientExit::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<Established, RpcError> {
        let address = self.config.server_address();
        let socket = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                RpcError::from(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {address} timed out"),
                ))
            })??;
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", address, e);
        }

        let mut stream = match &self.tls {
            Some((connector, server_name)) => {
                let tls_stream = connector
                    .connect(server_name.clone(), socket)
                    .await
                    .map_err(|e| RpcError::Tls(e.to_string()))?;
                AnyStream::ClientTls(Box::new(tls_stream))
            }
            None => AnyStream::Tcp(socket),
        };

        let established = tokio::time::timeout(
            self.config.handshake_timeout,
            handshake::perform::<_, In, Out>(
                &mut stream,
                &self.token,
                self.session_guid,
                self.app.as_ref(),
            ),
        )
        .await
        .map_err(|_| RpcError::HandshakeTimeout)??;
        Ok((stream, established))
    }

    /// Runs one connection until it ends.
    async fn serve(
        &self,
        stream: AnyStream,
        established: EstablishedHandshake,
        cancel: &CancellationToken,
    ) -> ReadOutcome {
        let restarted = established.outcome == HandshakeOutcome::NewSession
            && self.connected_once.swap(true, Ordering::AcqRel);
        self.connected_once.store(true, Ordering::Release);
        let channel = if restarted {
            self.restart_session().await
        } else {
            self.channel()
        };
        info!(
            "Connected to {} ({:?}, session {}).",
            self.config.server_address(),
            established.outcome,
            self.session_guid
        );

        let (read_half, write_half) = tokio::io::split(stream);
        let connection = Arc::new(Connection::new(
            self.connection_ids.next_id(),
            self.config.server_address(),
            Box::new(write_half) as BoxedWriter,
            established.mappings,
            established.ping_interval,
        ));
        channel.attach(connection.clone());
        let _guard = ConnectionGuard::new(connection.clone(), channel.clone());

        self.app.on_connected(established.outcome).await;
        let reader = FrameReader::new(
            connection,
            channel.clone(),
            self.receiver.clone(),
            self.config.queues.max_concurrently_handled_messages,
        );
        let outcome = reader.run(Box::new(read_half) as BoxedReader, cancel).await;
        if outcome == ReadOutcome::Cancelled {
            self.terminate(&channel).await;
        }
        outcome
    }

    /// The server no longer knows our session: drop everything tied to it.
    async fn restart_session(&self) -> Arc<SessionChannel> {
        let fresh = new_channel(&self.config, self.session_guid, self.ids.clone());
        let previous = std::mem::replace(&mut *self.slot.write(), fresh.clone());
        warn!(
            "Server started a new session for client {}; discarding {} unacknowledged messages.",
            self.token.client_guid,
            previous.frames().unacknowledged_ids().len()
        );
        previous.close(std::time::Duration::ZERO).await;
        self.receiver.on_session_restarted().await;
        fresh
    }

    /// Tells the server the session is over, then drains and closes it.
    async fn terminate(&self, channel: &SessionChannel) {
        let grace = self.config.shutdown_grace_period;
        match tokio::time::timeout(grace, channel.frames().enqueue(Frame::SessionTermination)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("SessionTermination was not queued: {}", e),
            Err(_) => warn!("Frame queue stayed full; closing without SessionTermination."),
        }
        channel.close(grace).await;
        info!("Client {} ended session {}.", self.token.client_guid, self.session_guid);
    }

    async fn close_channel(&self) {
        self.channel().close(self.config.shutdown_grace_period).await;
    }
}

fn new_channel(
    config: &RpcClientConfig,
    session_guid: Uuid,
    ids: Arc<MessageIdSequence>,
) -> Arc<SessionChannel> {
    SessionChannel::new(
        format!("session {session_guid}"),
        config.queues.frame_sender(config.pong_timeout),
        ids,
    )
}

/// Errors after which retrying cannot succeed.
fn is_fatal(e: &RpcError) -> bool {
    matches!(e, RpcError::AuthRejected(_) | RpcError::SessionAlreadyClosed)
}
