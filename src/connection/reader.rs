// src/connection/reader.rs

//! Defines `FrameReader`, the inbound loop of one physical connection.

use super::channel::SessionChannel;
use super::receiver::MessageReceiver;
use crate::core::RpcError;
use crate::core::messages::{MessageKind, MessageRegistry};
use crate::core::protocol::{Frame, FrameCodec, MessageErrorCode};
use crate::core::rpc::{BoxedReader, Connection};
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The transport failed or reached EOF, or the connection was closed locally.
    Disconnected,
    /// The peer sent `SessionTermination`.
    SessionTerminated,
    /// The caller's cancellation token fired.
    Cancelled,
}

/// Reads frames from one connection, one at a time, and dispatches them.
pub struct FrameReader<M: MessageRegistry> {
    connection: Arc<Connection>,
    channel: Arc<SessionChannel>,
    receiver: Arc<dyn MessageReceiver<M>>,
    permits: Arc<Semaphore>,
}

impl<M: MessageRegistry> FrameReader<M> {
    /// `max_concurrent` caps how many handlers of this connection run at once.
    pub fn new(
        connection: Arc<Connection>,
        channel: Arc<SessionChannel>,
        receiver: Arc<dyn MessageReceiver<M>>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            connection,
            channel,
            receiver,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Runs until the connection drops, the peer ends the session, or `cancel` fires.
    pub async fn run(self, reader: BoxedReader, cancel: &CancellationToken) -> ReadOutcome {
        let mut frames = FramedRead::new(reader, FrameCodec);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ReadOutcome::Cancelled,
                _ = self.connection.closed() => {
                    // Closed from our side, e.g. a missed pong. Let the peer see EOF.
                    self.connection.shutdown().await;
                    return ReadOutcome::Disconnected;
                }
                next = frames.next() => next,
            };
            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    if e.is_transport() {
                        debug!(
                            "{}: connection {} read failed: {}",
                            self.channel.label(),
                            self.connection.id(),
                            e
                        );
                    } else {
                        warn!(
                            "{}: connection {} sent an unreadable stream: {}",
                            self.channel.label(),
                            self.connection.id(),
                            e
                        );
                    }
                    self.connection.shutdown().await;
                    return ReadOutcome::Disconnected;
                }
                None => {
                    debug!(
                        "{}: connection {} reached EOF.",
                        self.channel.label(),
                        self.connection.id()
                    );
                    self.connection.shutdown().await;
                    return ReadOutcome::Disconnected;
                }
            };
            if let ControlFlow::Break(outcome) = self.dispatch(frame, cancel).await {
                if outcome == ReadOutcome::Disconnected {
                    self.connection.shutdown().await;
                }
                return outcome;
            }
        }
    }

    async fn dispatch(&self, frame: Frame, cancel: &CancellationToken) -> ControlFlow<ReadOutcome> {
        match frame {
            Frame::Ping { sent_at_ms } => {
                let pong = Frame::Pong {
                    ping_sent_at_ms: sent_at_ms,
                };
                if let Err(e) = self.connection.write_frame(pong).await {
                    debug!("{}: failed to answer ping: {}", self.channel.label(), e);
                }
                self.receiver.on_ping().await;
            }
            Frame::Pong { ping_sent_at_ms } => self.channel.frames().on_pong(ping_sent_at_ms),
            Frame::MessageReply {
                replying_to,
                payload,
            } => {
                self.channel.frames().acknowledge(replying_to);
                self.channel.replies().receive_reply(replying_to, payload);
            }
            Frame::MessageError {
                replying_to,
                error_code,
            } => {
                debug!(
                    "{}: peer reported {:?} for message {}.",
                    self.channel.label(),
                    error_code,
                    replying_to
                );
                self.channel.frames().acknowledge(replying_to);
                self.channel.replies().fail_reply(replying_to, error_code);
            }
            Frame::Message {
                message_id,
                type_code,
                payload,
            } => {
                return self
                    .handle_message(message_id, type_code, payload, cancel)
                    .await;
            }
            Frame::SessionTermination => {
                info!(
                    "{}: peer terminated the session on connection {}.",
                    self.channel.label(),
                    self.connection.id()
                );
                self.receiver.on_session_terminated().await;
                return ControlFlow::Break(ReadOutcome::SessionTerminated);
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_message(
        &self,
        message_id: u32,
        type_code: u8,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> ControlFlow<ReadOutcome> {
        if !self.channel.observe_received(message_id) {
            debug!(
                "{}: dropping duplicate message {}.",
                self.channel.label(),
                message_id
            );
            return ControlFlow::Continue(());
        }

        let Some(kind) = self.connection.mappings().inbound.kind_of(type_code) else {
            error!(
                "{}: message {} has unknown type code {}; dropping it.",
                self.channel.label(),
                message_id,
                type_code
            );
            send_error(&self.channel, message_id, MessageErrorCode::UnknownMessageType).await;
            return ControlFlow::Continue(());
        };

        let message = match M::decode_payload(kind.name, &payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "{}: failed to decode {} message {}: {}",
                    self.channel.label(),
                    kind.name,
                    message_id,
                    e
                );
                if kind.has_reply {
                    send_error(&self.channel, message_id, MessageErrorCode::DeserializationFailed)
                        .await;
                }
                return ControlFlow::Continue(());
            }
        };

        let permit = match self.acquire_permit(cancel).await {
            Ok(permit) => permit,
            Err(outcome) => return ControlFlow::Break(outcome),
        };
        tokio::spawn(run_handler(
            self.channel.clone(),
            self.receiver.clone(),
            kind,
            message_id,
            message,
            permit,
        ));
        ControlFlow::Continue(())
    }

    /// Takes a handler slot before the next frame is read. This is what stalls
    /// the reader when handlers fall behind.
    async fn acquire_permit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, ReadOutcome> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(ReadOutcome::Disconnected),
            Err(TryAcquireError::NoPermits) => warn!(
                "{}: all message handlers are busy; pausing reads on connection {}.",
                self.channel.label(),
                self.connection.id()
            ),
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReadOutcome::Cancelled),
            _ = self.connection.closed() => Err(ReadOutcome::Disconnected),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| ReadOutcome::Disconnected)
            }
        }
    }
}

async fn run_handler<M: MessageRegistry>(
    channel: Arc<SessionChannel>,
    receiver: Arc<dyn MessageReceiver<M>>,
    kind: &'static MessageKind,
    message_id: u32,
    message: M,
    _permit: OwnedSemaphorePermit,
) {
    let result = AssertUnwindSafe(receiver.on_message(message))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(RpcError::Handler("message handler panicked".to_string())));

    match result {
        Ok(Some(reply)) if kind.has_reply => {
            let frame = Frame::MessageReply {
                replying_to: message_id,
                payload: reply.into_bytes(),
            };
            if let Err(e) = channel.frames().enqueue(frame).await {
                debug!(
                    "{}: reply to message {} was not queued: {}",
                    channel.label(),
                    message_id,
                    e
                );
            }
        }
        Ok(Some(_)) => debug!(
            "{}: ignoring reply to one-way {} message {}.",
            channel.label(),
            kind.name,
            message_id
        ),
        Ok(None) if kind.has_reply => {
            warn!(
                "{}: handler produced no reply for {} request {}.",
                channel.label(),
                kind.name,
                message_id
            );
            send_error(&channel, message_id, MessageErrorCode::MessageHandlingError).await;
        }
        Ok(None) => {}
        Err(e) => {
            warn!(
                "{}: handler for {} message {} failed: {}",
                channel.label(),
                kind.name,
                message_id,
                e
            );
            if kind.has_reply {
                send_error(&channel, message_id, MessageErrorCode::MessageHandlingError).await;
            }
        }
    }
}

async fn send_error(channel: &SessionChannel, replying_to: u32, error_code: MessageErrorCode) {
    let frame = Frame::MessageError {
        replying_to,
        error_code,
    };
    if let Err(e) = channel.frames().enqueue(frame).await {
        debug!(
            "{}: error reply for message {} was not queued: {}",
            channel.label(),
            replying_to,
            e
        );
    }
}
