// src/connection/receiver.rs

//! The application-facing side of inbound traffic.

use crate::config::QueueConfig;
use crate::core::RpcError;
use crate::core::messages::{MessageRegistry, Reply};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// Handles decoded inbound messages for one connection.
///
/// `on_message` may run concurrently for several messages, up to the
/// configured concurrency limit. Returning `Ok(None)` or an error for a
/// message that expects a reply makes the channel answer with a
/// `MessageHandlingError`.
#[async_trait]
pub trait MessageReceiver<M: MessageRegistry>: Send + Sync + 'static {
    async fn on_message(&self, message: M) -> Result<Option<Reply>, RpcError>;

    /// The peer pinged this side.
    async fn on_ping(&self) {}

    /// The client learned that the server started a new session for it; any
    /// state tied to the previous session is gone.
    async fn on_session_restarted(&self) {}

    /// The peer ended the session.
    async fn on_session_terminated(&self) {}
}

/// An event delivered through a `ChannelReceiver`.
#[derive(Debug)]
pub enum ChannelEvent<M> {
    Message(IncomingMessage<M>),
    Ping,
    SessionRestarted,
    SessionTerminated,
}

/// A received message together with the means to answer it.
///
/// Dropping it without calling `respond` counts as "no reply".
#[derive(Debug)]
pub struct IncomingMessage<M> {
    pub message: M,
    responder: oneshot::Sender<Result<Option<Reply>, RpcError>>,
}

impl<M> IncomingMessage<M> {
    pub fn respond(self, result: Result<Option<Reply>, RpcError>) {
        // The handler task may be gone if the session closed meanwhile.
        let _ = self.responder.send(result);
    }

    pub fn reply(self, reply: Reply) {
        self.respond(Ok(Some(reply)))
    }
}

/// A `MessageReceiver` that forwards everything into a bounded channel, for
/// applications that would rather pull messages than implement a trait.
///
/// A message's concurrency slot is held until it is answered or dropped, so a
/// slow consumer stalls the reader instead of buffering without bound.
pub struct ChannelReceiver<M> {
    tx: mpsc::Sender<ChannelEvent<M>>,
}

impl<M> Clone for ChannelReceiver<M> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<M: MessageRegistry> ChannelReceiver<M> {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChannelEvent<M>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// A receiver whose queue holds `message_queue_capacity` events.
    pub fn from_config(queues: &QueueConfig) -> (Self, mpsc::Receiver<ChannelEvent<M>>) {
        Self::new(queues.message_queue_capacity)
    }
}

#[async_trait]
impl<M: MessageRegistry> MessageReceiver<M> for ChannelReceiver<M> {
    async fn on_message(&self, message: M) -> Result<Option<Reply>, RpcError> {
        let (responder, answer) = oneshot::channel();
        self.tx
            .send(ChannelEvent::Message(IncomingMessage { message, responder }))
            .await
            .map_err(|_| RpcError::Handler("message consumer is gone".to_string()))?;
        answer.await.unwrap_or(Ok(None))
    }

    async fn on_ping(&self) {
        let _ = self.tx.try_send(ChannelEvent::Ping);
    }

    async fn on_session_restarted(&self) {
        let _ = self.tx.send(ChannelEvent::SessionRestarted).await;
    }

    async fn on_session_terminated(&self) {
        let _ = self.tx.send(ChannelEvent::SessionTerminated).await;
    }
}
