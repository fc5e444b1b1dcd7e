// src/server/session.rs

//! Defines `Session`, the server-side identity of a client that outlives its
//! physical connections.

use crate::connection::{MessageSender, SessionChannel};
use crate::core::messages::MessageRegistry;
use crate::core::rpc::Connection;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created by a handshake, no connection attached yet.
    New,
    /// A live connection is attached.
    Active,
    /// No connection attached; the disconnect timer is running.
    Disconnected,
    /// Terminal. The session is no longer in the registry.
    Closed,
}

#[derive(Debug)]
pub(crate) struct SessionInner {
    pub(crate) state: SessionState,
    pub(crate) connection: Option<Arc<Connection>>,
    pub(crate) disconnect_timer: Option<JoinHandle<()>>,
}

/// One `(client guid, session guid)` pair and the delivery state it owns.
#[derive(Debug)]
pub struct Session {
    client_guid: Uuid,
    session_guid: Uuid,
    channel: Arc<SessionChannel>,
    pub(crate) inner: Mutex<SessionInner>,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(client_guid: Uuid, session_guid: Uuid, channel: Arc<SessionChannel>) -> Self {
        Self {
            client_guid,
            session_guid,
            channel,
            inner: Mutex::new(SessionInner {
                state: SessionState::New,
                connection: None,
                disconnect_timer: None,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn client_guid(&self) -> Uuid {
        self.client_guid
    }

    pub fn session_guid(&self) -> Uuid {
        self.session_guid
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn channel(&self) -> &Arc<SessionChannel> {
        &self.channel
    }

    /// Cancelled when the session closes. Connection tasks of the session watch it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A sender for messages to this session's client.
    pub fn sender<M: MessageRegistry>(&self) -> MessageSender<M> {
        MessageSender::new(Arc::new(RwLock::new(self.channel.clone())))
    }

    /// The id of the attached connection, if any.
    pub fn connection_id(&self) -> Option<u64> {
        self.inner.lock().connection.as_ref().map(|c| c.id())
    }
}
