// src/core/rpc/reply_tracker.rs

//! Correlates outgoing request ids with the replies that resolve them.

use crate::core::RpcError;
use crate::core::messages;
use crate::core::protocol::MessageErrorCode;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type ReplyResult = Result<Bytes, RpcError>;

#[derive(Debug)]
struct PendingEntry {
    tx: oneshot::Sender<ReplyResult>,
    started: Instant,
}

/// Tracks requests that are waiting for a `MessageReply` or `MessageError`.
#[derive(Debug, Default)]
pub struct ReplyTracker {
    pending: DashMap<u32, PendingEntry>,
}

/// A registered request. Dropping it removes the pending entry, so every exit
/// path of a wait (success, timeout, cancellation, error) cleans up.
#[derive(Debug)]
pub struct PendingReply {
    message_id: u32,
    rx: oneshot::Receiver<ReplyResult>,
    tracker: Arc<ReplyTracker>,
}

impl ReplyTracker {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers `message_id` before the request is sent.
    pub fn register(self: &Arc<Self>, message_id: u32) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            tx,
            started: Instant::now(),
        };
        if self.pending.insert(message_id, entry).is_some() {
            debug!("Replaced a stale pending reply for message {}.", message_id);
        }
        PendingReply {
            message_id,
            rx,
            tracker: self.clone(),
        }
    }

    /// Waits for the reply to `pending` and decodes it as `T`.
    pub async fn wait_for_reply<T: bincode::Decode<()>>(
        &self,
        pending: PendingReply,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, RpcError> {
        pending.wait(timeout, cancel).await
    }

    /// Resolves a pending request. Returns false if nothing was waiting, e.g. for a
    /// duplicate reply or one that arrived after the caller gave up.
    pub fn receive_reply(&self, message_id: u32, payload: Bytes) -> bool {
        self.resolve(message_id, Ok(payload))
    }

    /// Faults a pending request with the error code the peer reported.
    pub fn fail_reply(&self, message_id: u32, code: MessageErrorCode) -> bool {
        self.resolve(message_id, Err(RpcError::RemoteError(code)))
    }

    /// Drops a pending entry whose request never made it onto the wire.
    pub fn forget_reply(&self, message_id: u32) {
        self.pending.remove(&message_id);
    }

    /// Faults every pending request, used when the owning session closes.
    pub fn fail_all(&self, error: RpcError) {
        let ids: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.resolve(id, Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, message_id: u32) -> bool {
        self.pending.contains_key(&message_id)
    }

    fn resolve(&self, message_id: u32, result: ReplyResult) -> bool {
        match self.pending.remove(&message_id) {
            Some((_, entry)) => {
                debug!(
                    "Reply for message {} arrived after {:?}.",
                    message_id,
                    entry.started.elapsed()
                );
                entry.tx.send(result).is_ok()
            }
            None => {
                debug!(
                    "Ignoring reply for message {} with no pending request.",
                    message_id
                );
                false
            }
        }
    }
}

impl PendingReply {
    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    /// Waits for resolution, distinguishing a timeout from external cancellation.
    pub async fn wait<T: bincode::Decode<()>>(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, RpcError> {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RpcError::Cancelled),
            res = tokio::time::timeout(timeout, &mut self.rx) => match res {
                Err(_) => return Err(RpcError::ReplyTimeout),
                // The sender is dropped only when the entry is removed without a result.
                Ok(Err(_)) => return Err(RpcError::SessionClosed),
                Ok(Ok(result)) => result?,
            },
        };
        messages::decode(&payload)
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.tracker.pending.remove(&self.message_id);
    }
}
