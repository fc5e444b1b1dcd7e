// src/connection/sender.rs

//! Defines `MessageSender`, the typed entry point for outbound messages.

use super::channel::SessionChannel;
use crate::core::RpcError;
use crate::core::messages::{MessageRegistry, Request};
use crate::core::protocol::Frame;
use bytes::Bytes;
use parking_lot::RwLock;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The slot holding a session's current channel. The client swaps its content
/// when the server reports a new session; senders observe the swap.
pub type ChannelSlot = Arc<RwLock<Arc<SessionChannel>>>;

/// Sends messages of registry `M` to the peer.
///
/// Cloning is cheap. A sender never blocks on the network: `send` returns once
/// the frame is queued, waiting only while the session's frame queue is full.
pub struct MessageSender<M> {
    slot: ChannelSlot,
    _registry: PhantomData<fn(M)>,
}

impl<M> Clone for MessageSender<M> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            _registry: PhantomData,
        }
    }
}

impl<M: MessageRegistry> MessageSender<M> {
    pub fn new(slot: ChannelSlot) -> Self {
        Self {
            slot,
            _registry: PhantomData,
        }
    }

    fn channel(&self) -> Arc<SessionChannel> {
        self.slot.read().clone()
    }

    /// Queues a one-way message and returns its id.
    pub async fn send(&self, message: impl Into<M>) -> Result<u32, RpcError> {
        let channel = self.channel();
        let (message_id, frame) = prepare(&channel, &message.into())?;
        channel.frames().enqueue(frame).await?;
        Ok(message_id)
    }

    /// Sends a request and waits for its typed reply.
    ///
    /// `timeout` bounds the whole call, including time spent waiting for queue
    /// space. Timeout and cancellation surface as distinct errors and both
    /// remove the pending entry.
    pub async fn send_request<Q>(
        &self,
        request: Q,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Q::Reply, RpcError>
    where
        Q: Request + Into<M>,
    {
        let deadline = Instant::now() + timeout;
        let channel = self.channel();
        let (message_id, frame) = prepare(&channel, &request.into())?;
        let pending = channel.replies().register(message_id);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RpcError::Cancelled),
            res = tokio::time::timeout_at(deadline, channel.frames().enqueue(frame)) => match res {
                Err(_) => return Err(RpcError::ReplyTimeout),
                Ok(Err(e)) => {
                    debug!("Request {} was not queued: {}", message_id, e);
                    return Err(e);
                }
                Ok(Ok(())) => {}
            }
        }

        pending
            .wait(deadline.saturating_duration_since(Instant::now()), cancel)
            .await
    }

    /// True once the current session has been closed.
    pub fn is_closed(&self) -> bool {
        self.channel().is_closed()
    }
}

fn prepare<M: MessageRegistry>(channel: &SessionChannel, message: &M) -> Result<(u32, Frame), RpcError> {
    let type_code = channel.outbound_code(message.name())?;
    let payload = Bytes::from(message.encode_payload()?);
    let message_id = channel.ids().next_id();
    Ok((
        message_id,
        Frame::Message {
            message_id,
            type_code,
            payload,
        },
    ))
}
