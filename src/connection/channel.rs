// src/connection/channel.rs

//! Defines `SessionChannel`, the delivery state one logical session keeps
//! across its physical connections.

use crate::core::RpcError;
use crate::core::protocol::TypeMapping;
use crate::core::rpc::{
    Connection, FrameSender, FrameSenderConfig, MessageIdSequence, ReceiveTracker, ReplyTracker,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// The frame sender, reply tracker and receive tracker of one session, plus the
/// outbound type mapping of its most recent connection.
pub struct SessionChannel {
    label: String,
    frames: Arc<FrameSender>,
    replies: Arc<ReplyTracker>,
    received: Mutex<ReceiveTracker>,
    outbound: RwLock<TypeMapping>,
    ids: Arc<MessageIdSequence>,
}

impl SessionChannel {
    /// Creates the channel and starts its frame sender.
    pub fn new(
        label: impl Into<String>,
        config: FrameSenderConfig,
        ids: Arc<MessageIdSequence>,
    ) -> Arc<Self> {
        let label = label.into();
        Arc::new(Self {
            frames: FrameSender::start(label.clone(), config),
            label,
            replies: Arc::new(ReplyTracker::new()),
            received: Mutex::new(ReceiveTracker::new()),
            outbound: RwLock::new(TypeMapping::default()),
            ids,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn frames(&self) -> &Arc<FrameSender> {
        &self.frames
    }

    pub fn replies(&self) -> &Arc<ReplyTracker> {
        &self.replies
    }

    pub(crate) fn ids(&self) -> &MessageIdSequence {
        &self.ids
    }

    /// Makes `connection` the live connection of the session.
    pub fn attach(&self, connection: Arc<Connection>) {
        *self.outbound.write() = connection.mappings().outbound.clone();
        self.frames.attach(connection);
    }

    pub fn detach(&self, connection_id: u64) -> bool {
        self.frames.detach(connection_id)
    }

    /// Resolves the wire code of an outbound kind on the current mapping.
    pub fn outbound_code(&self, name: &'static str) -> Result<u8, RpcError> {
        self.outbound
            .read()
            .code_of(name)
            .ok_or(RpcError::UnsupportedMessageType(name))
    }

    /// Records an inbound message id. False for a duplicate.
    pub fn observe_received(&self, message_id: u32) -> bool {
        self.received.lock().observe(message_id)
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }

    /// Stops the frame sender after letting it drain for up to `grace` and fails
    /// every pending request.
    pub async fn close(&self, grace: Duration) {
        self.frames.shutdown(grace).await;
        if !self.replies.is_empty() {
            debug!(
                "{}: failing {} pending requests.",
                self.label,
                self.replies.len()
            );
        }
        self.replies.fail_all(RpcError::SessionClosed);
        if let Some(connection) = self.frames.current_connection() {
            connection.shutdown().await;
        }
    }
}

impl std::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("label", &self.label)
            .field("pending_replies", &self.replies.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
