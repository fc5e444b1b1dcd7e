// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection resource management.

use super::channel::SessionChannel;
use crate::core::rpc::Connection;
use std::sync::Arc;
use tracing::debug;

type ReleaseHook = Box<dyn FnOnce(u64) + Send>;

/// Ensures a connection is closed and detached from its session however the
/// task that owns it exits, including by panic or cancellation.
pub struct ConnectionGuard {
    connection: Arc<Connection>,
    channel: Arc<SessionChannel>,
    on_release: Option<ReleaseHook>,
}

impl ConnectionGuard {
    pub fn new(connection: Arc<Connection>, channel: Arc<SessionChannel>) -> Self {
        Self {
            connection,
            channel,
            on_release: None,
        }
    }

    /// Runs `hook` with the connection id after the connection is detached.
    pub fn on_release(mut self, hook: impl FnOnce(u64) + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        debug!(
            "ConnectionGuard dropping, cleaning up connection {} ({}).",
            self.connection.id(),
            self.connection.peer()
        );
        self.connection.close();
        // Dropping the read half alone does not close the socket.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let connection = self.connection.clone();
            handle.spawn(async move { connection.shutdown().await });
        }
        self.channel.detach(self.connection.id());
        if let Some(hook) = self.on_release.take() {
            hook(self.connection.id());
        }
    }
}
