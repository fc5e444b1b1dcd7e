// src/server/connection_loop.rs

//! Contains the accept loop and the lifecycle of a single accepted socket.

use super::context::ServerContext;
use super::session::Session;
use super::{RegisteredConnection, ServerApplication};
use crate::connection::{AnyStream, ConnectionGuard, FrameReader, ReadOutcome};
use crate::core::RpcError;
use crate::core::handshake::server as handshake;
use crate::core::messages::MessageRegistry;
use crate::core::rpc::{BoxedReader, BoxedWriter, Connection};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Accepts sockets until `shutdown` fires, then closes every session and waits
/// for all connection tasks to finish.
pub(crate) async fn run<In, Out, A>(
    ctx: Arc<ServerContext<In, Out, A>>,
    listener: TcpListener,
    shutdown: CancellationToken,
) where
    In: MessageRegistry,
    Out: MessageRegistry,
    A: ServerApplication<In, Out>,
{
    let mut client_tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("Shutdown requested, no longer accepting connections.");
                break;
            }

            res = listener.accept() => match res {
                Ok((socket, addr)) => {
                    info!("Accepted new connection from: {}", addr);
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }
                    let ctx = ctx.clone();
                    let shutdown = shutdown.clone();
                    client_tasks.spawn(async move {
                        if let Err(e) = handle_socket(ctx, socket, addr, shutdown).await {
                            warn!("Connection from {} terminated unexpectedly: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },

            Some(res) = client_tasks.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A client handler panicked: {e:?}");
                }
            },
        }
    }

    ctx.registry.close_all().await;

    // Shutdown is cooperative: every connection task observes the closed
    // sessions or the shutdown token on its own.
    while let Some(res) = client_tasks.join_next().await {
        if let Err(e) = res
            && e.is_panic()
        {
            error!("A client handler panicked during shutdown: {e:?}");
        }
    }
    info!("All client connections closed.");
}

async fn handle_socket<In, Out, A>(
    ctx: Arc<ServerContext<In, Out, A>>,
    socket: TcpStream,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), RpcError>
where
    In: MessageRegistry,
    Out: MessageRegistry,
    A: ServerApplication<In, Out>,
{
    let handshake_timeout = ctx.config.handshake_timeout;
    let established = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Ok(()),
        res = tokio::time::timeout(handshake_timeout, establish(&*ctx, socket, addr)) => match res {
            Ok(res) => res,
            Err(_) => {
                warn!("Handshake with {} did not finish within {:?}.", addr, handshake_timeout);
                return Err(RpcError::HandshakeTimeout);
            }
        },
    };
    let (stream, accepted) = match established {
        Ok(established) => established,
        Err(RpcError::AuthRejected(result)) => {
            info!("Client at {} failed authentication: {:?}", addr, result);
            return Ok(());
        }
        Err(RpcError::SessionAlreadyClosed) => return Ok(()),
        Err(e) => return Err(e),
    };

    let session = accepted.session;
    let (read_half, write_half) = tokio::io::split(stream);
    let connection = Arc::new(Connection::new(
        ctx.connection_ids.next_id(),
        addr.to_string(),
        Box::new(write_half) as BoxedWriter,
        accepted.mappings,
        ctx.config.ping_interval(),
    ));
    info!(
        "Client {} connected from {} ({:?}, session {}).",
        accepted.client_guid, addr, accepted.outcome, accepted.session_guid
    );

    ctx.registry.on_connected(&session, connection.clone());
    let registry = ctx.registry.clone();
    let released = session.clone();
    let _guard = ConnectionGuard::new(connection.clone(), session.channel().clone())
        .on_release(move |connection_id| registry.on_disconnected(&released, connection_id));

    let registered = RegisteredConnection {
        client_guid: accepted.client_guid,
        session_guid: accepted.session_guid,
        outcome: accepted.outcome,
        peer: addr,
        sender: session.sender::<Out>(),
    };
    let receiver = ctx.app.register(registered).await?;

    let reader = FrameReader::new(
        connection,
        session.channel().clone(),
        receiver,
        ctx.config.queues.max_concurrently_handled_messages,
    );
    let outcome = tokio::select! {
        outcome = reader.run(Box::new(read_half) as BoxedReader, session.cancel_token()) => outcome,
        _ = shutdown.cancelled() => {
            // Sessions created after shutdown began are not in `close_all`'s snapshot.
            ctx.registry.close(&session, true).await;
            // The close may be running in `close_all`; keep the connection until it has flushed.
            session.cancel_token().cancelled().await;
            ReadOutcome::Cancelled
        }
    };
    finish(&*ctx, &session, outcome, addr).await;
    Ok(())
}

/// TLS accept plus the protocol handshake.
async fn establish<In, Out, A>(
    ctx: &ServerContext<In, Out, A>,
    socket: TcpStream,
    addr: SocketAddr,
) -> Result<(AnyStream, handshake::AcceptedHandshake<Arc<Session>>), RpcError>
where
    In: MessageRegistry,
    Out: MessageRegistry,
    A: ServerApplication<In, Out>,
{
    let mut stream = match &ctx.acceptor {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(tls_stream) => {
                debug!("TLS handshake successful for {addr}");
                AnyStream::ServerTls(Box::new(tls_stream))
            }
            Err(e) => {
                warn!("TLS handshake error for {addr}: {e}");
                return Err(RpcError::Tls(e.to_string()));
            }
        },
        None => AnyStream::Tcp(socket),
    };
    let accepted = handshake::perform(
        &mut stream,
        &ctx.params,
        ctx.auth.as_ref(),
        &ctx.registry,
        ctx.app.as_ref(),
    )
    .await?;
    Ok((stream, accepted))
}

async fn finish<In, Out, A>(
    ctx: &ServerContext<In, Out, A>,
    session: &Arc<Session>,
    outcome: ReadOutcome,
    addr: SocketAddr,
) where
    A: ?Sized,
{
    match outcome {
        ReadOutcome::SessionTerminated => {
            info!(
                "Client {} at {} ended session {}.",
                session.client_guid(),
                addr,
                session.session_guid()
            );
            ctx.registry.close(session, false).await;
        }
        ReadOutcome::Disconnected => debug!("Connection from {} dropped.", addr),
        ReadOutcome::Cancelled => debug!("Connection from {} closed with its session.", addr),
    }
}
