// src/server/registry.rs

//! Defines `SessionRegistry`, which maps client guids to their live session.

use super::session::{Session, SessionState};
use crate::connection::SessionChannel;
use crate::core::handshake::server::{BoundSession, SessionBinder};
use crate::core::protocol::Frame;
use crate::core::rpc::{Connection, FrameSenderConfig, MessageIdSequence};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Settings applied to every session the registry creates.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub frame_sender: FrameSenderConfig,
    /// How long a session survives with no connection attached.
    pub disconnect_timeout: Duration,
    /// How long a closing session may spend flushing queued frames.
    pub grace_period: Duration,
}

struct RegistryInner {
    sessions: DashMap<Uuid, Arc<Session>>,
    closed: DashSet<Uuid>,
    settings: SessionSettings,
}

/// The server's table of sessions, keyed by client guid. Cloning is cheap.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                closed: DashSet::new(),
                settings,
            }),
        }
    }

    /// Returns the session for `(client_guid, session_guid)`, creating it if
    /// needed. The flag is true for a newly created session.
    ///
    /// A different session guid for a known client replaces the old session,
    /// which is closed in the background. A session guid that was closed
    /// before yields `None`.
    pub fn get_or_create_session(
        &self,
        client_guid: Uuid,
        session_guid: Uuid,
    ) -> Option<(Arc<Session>, bool)> {
        if self.inner.closed.contains(&session_guid) {
            return None;
        }
        match self.inner.sessions.entry(client_guid) {
            Entry::Occupied(mut entry) => {
                if entry.get().session_guid() == session_guid {
                    return Some((entry.get().clone(), false));
                }
                let session = self.new_session(client_guid, session_guid);
                let previous = entry.insert(session.clone());
                info!(
                    "Client {} started session {}; closing previous session {}.",
                    client_guid,
                    session_guid,
                    previous.session_guid()
                );
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.close(&previous, true).await });
                Some((session, true))
            }
            Entry::Vacant(entry) => {
                let session = self.new_session(client_guid, session_guid);
                entry.insert(session.clone());
                debug!(
                    "Created session {} for client {}.",
                    session_guid, client_guid
                );
                Some((session, true))
            }
        }
    }

    /// Each session numbers its outbound messages from 1, so the client's dedup
    /// state stays a single contiguous range.
    fn new_session(&self, client_guid: Uuid, session_guid: Uuid) -> Arc<Session> {
        let channel = SessionChannel::new(
            format!("session {session_guid}"),
            self.inner.settings.frame_sender.clone(),
            Arc::new(MessageIdSequence::new()),
        );
        Arc::new(Session::new(client_guid, session_guid, channel))
    }

    /// Attaches a freshly handshaken connection and stops the disconnect timer.
    /// A connection that was still attached is torn down.
    pub fn on_connected(&self, session: &Arc<Session>, connection: Arc<Connection>) {
        let replaced = {
            let mut inner = session.inner.lock();
            if inner.state == SessionState::Closed {
                drop(inner);
                connection.close();
                return;
            }
            if let Some(timer) = inner.disconnect_timer.take() {
                timer.abort();
            }
            inner.state = SessionState::Active;
            inner.connection.replace(connection.clone())
        };
        if let Some(old) = replaced.filter(|old| old.id() != connection.id()) {
            debug!(
                "Session {}: replacing connection {} with {}.",
                session.session_guid(),
                old.id(),
                connection.id()
            );
            old.close();
        }
        session.channel().attach(connection);
    }

    /// Detaches `connection_id` and starts the disconnect timer. Ignored if a
    /// newer connection has already replaced it.
    pub fn on_disconnected(&self, session: &Arc<Session>, connection_id: u64) {
        let mut inner = session.inner.lock();
        if inner.state == SessionState::Closed
            || inner.connection.as_ref().map(|c| c.id()) != Some(connection_id)
        {
            return;
        }
        inner.connection = None;
        inner.state = SessionState::Disconnected;
        session.channel().detach(connection_id);

        let timeout = self.inner.settings.disconnect_timeout;
        let registry = self.inner.clone();
        let expiring = session.clone();
        if let Some(old) = inner.disconnect_timer.replace(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            {
                // Detach our own handle so `close` does not abort this task.
                let mut inner = expiring.inner.lock();
                if inner.state != SessionState::Disconnected {
                    return;
                }
                inner.disconnect_timer.take();
            }
            info!(
                "Session {} of client {} had no connection for {:?}; closing it.",
                expiring.session_guid(),
                expiring.client_guid(),
                timeout
            );
            registry.close(&expiring, false).await;
        })) {
            old.abort();
        }
        debug!(
            "Session {}: connection {} detached.",
            session.session_guid(),
            connection_id
        );
    }

    /// Closes `session`. A server-initiated close first tells the client with a
    /// `SessionTermination` frame.
    pub async fn close(&self, session: &Arc<Session>, initiated_by_server: bool) {
        self.inner.close(session, initiated_by_server).await
    }

    /// Closes every session, used on server shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if !sessions.is_empty() {
            info!("Closing {} sessions.", sessions.len());
        }
        futures::future::join_all(sessions.iter().map(|s| self.inner.close(s, true))).await;
    }

    pub fn get(&self, client_guid: &Uuid) -> Option<Arc<Session>> {
        self.inner.sessions.get(client_guid).map(|e| e.value().clone())
    }

    /// True if `session_guid` was closed and can no longer be resumed.
    pub fn is_closed(&self, session_guid: &Uuid) -> bool {
        self.inner.closed.contains(session_guid)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }
}

impl RegistryInner {
    async fn close(&self, session: &Arc<Session>, initiated_by_server: bool) {
        let attached = {
            let mut inner = session.inner.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            if let Some(timer) = inner.disconnect_timer.take() {
                timer.abort();
            }
            inner.connection.take()
        };
        self.closed.insert(session.session_guid());
        self.sessions
            .remove_if(&session.client_guid(), |_, s| Arc::ptr_eq(s, session));

        if initiated_by_server && attached.as_ref().is_some_and(|c| !c.is_closed()) {
            if let Err(e) = session.channel().frames().enqueue(Frame::SessionTermination).await {
                warn!(
                    "Session {}: could not queue SessionTermination: {}",
                    session.session_guid(),
                    e
                );
            }
        }
        session.channel().close(self.settings.grace_period).await;
        session.cancel_token().cancel();
        if let Some(connection) = attached {
            connection.shutdown().await;
        }
        info!(
            "Session {} of client {} closed ({}).",
            session.session_guid(),
            session.client_guid(),
            if initiated_by_server { "by server" } else { "by client or timeout" }
        );
    }

    /// Removes a session whose handshake failed before it was ever used.
    fn discard(&self, session: &Arc<Session>) {
        {
            let mut inner = session.inner.lock();
            if inner.state != SessionState::New {
                return;
            }
            inner.state = SessionState::Closed;
        }
        self.sessions
            .remove_if(&session.client_guid(), |_, s| Arc::ptr_eq(s, session));
        let channel = session.channel().clone();
        tokio::spawn(async move { channel.close(Duration::ZERO).await });
        debug!(
            "Discarded session {} after a failed handshake.",
            session.session_guid()
        );
    }
}

impl SessionBinder for SessionRegistry {
    type Session = Arc<Session>;

    fn bind(&self, client_guid: Uuid, session_guid: Uuid) -> Option<BoundSession<Arc<Session>>> {
        self.get_or_create_session(client_guid, session_guid)
            .map(|(session, created)| BoundSession { session, created })
    }

    fn discard(&self, session: &Arc<Session>) {
        self.inner.discard(session)
    }
}
