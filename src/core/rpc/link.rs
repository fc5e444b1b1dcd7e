// src/core/rpc/link.rs

//! Defines `Connection`, the write side of one physical, authenticated socket.

use crate::core::RpcError;
use crate::core::protocol::{Frame, FrameCodec, NegotiatedMappings};
use futures::SinkExt;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The write half of a transport, boxed so TLS and plain streams share one type.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
/// The read half of a transport.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// One physical connection: the framed writer, the negotiated ping interval and
/// the negotiated type mappings. Replaced on every reconnect.
pub struct Connection {
    id: u64,
    peer: String,
    writer: Mutex<FramedWrite<BoxedWriter, FrameCodec>>,
    mappings: NegotiatedMappings,
    ping_interval: Duration,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(
        id: u64,
        peer: impl Into<String>,
        writer: BoxedWriter,
        mappings: NegotiatedMappings,
        ping_interval: Duration,
    ) -> Self {
        Self {
            id,
            peer: peer.into(),
            writer: Mutex::new(FramedWrite::new(writer, FrameCodec)),
            mappings,
            ping_interval,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn mappings(&self) -> &NegotiatedMappings {
        &self.mappings
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Writes and flushes one frame. A failed write closes the connection.
    pub async fn write_frame(&self, frame: Frame) -> Result<(), RpcError> {
        if self.closed.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(RpcError::ConnectionClosed),
            res = writer.send(frame) => res,
        };
        if let Err(e) = &result {
            debug!("Write to connection {} ({}) failed: {}", self.id, self.peer, e);
            self.close();
        }
        result
    }

    /// Marks the connection dead. The reader loop and any pending write observe it.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Marks the connection closed and shuts down the write half.
    pub async fn shutdown(&self) {
        self.close();
        // Any in-flight write observes `closed` and releases the lock.
        let mut writer = self.writer.lock().await;
        let _ = tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer.get_mut().shutdown()).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("ping_interval", &self.ping_interval)
            .field("closed", &self.is_closed())
            .finish()
    }
}
