// src/core/rpc/frame_sender.rs

//! Implements the per-session outbound pipeline.
//!
//! A `FrameSender` outlives the physical connections of its session. Producers
//! push frames into a bounded queue and a single send loop writes them to
//! whichever connection is currently attached, waiting through reconnects
//! instead of failing. Message frames stay in an unacknowledged set until a
//! reply or error for their id arrives, and are retransmitted in ascending id
//! order whenever a new connection attaches. A second loop pings the peer on
//! the negotiated interval and closes the connection if the pong does not come
//! back in time.

use super::link::Connection;
use crate::core::RpcError;
use crate::core::protocol::Frame;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for a `FrameSender`.
#[derive(Debug, Clone)]
pub struct FrameSenderConfig {
    /// Capacity of the outbound frame queue. Producers wait when it is full.
    pub queue_capacity: usize,
    /// How long to wait for a pong before closing the connection. `None` uses
    /// the connection's ping interval.
    pub pong_timeout: Option<Duration>,
}

impl Default for FrameSenderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            pong_timeout: None,
        }
    }
}

type ConnectionSlot = Option<Arc<Connection>>;

/// One unit of `outstanding`, released on drop unless the frame reached the queue.
/// An `enqueue` abandoned by its caller's timeout must not hold up `shutdown`.
struct OutstandingSlot<'a> {
    sender: &'a FrameSender,
    queued: bool,
}

impl<'a> OutstandingSlot<'a> {
    fn reserve(sender: &'a FrameSender) -> Self {
        sender.outstanding.fetch_add(1, Ordering::AcqRel);
        Self {
            sender,
            queued: false,
        }
    }

    fn queued(mut self) {
        self.queued = true;
    }
}

impl Drop for OutstandingSlot<'_> {
    fn drop(&mut self) {
        if !self.queued {
            self.sender.frame_done();
        }
    }
}

/// The outbound pipeline of one session.
pub struct FrameSender {
    label: String,
    queue_tx: mpsc::Sender<Frame>,
    unacknowledged: Mutex<BTreeMap<u32, Frame>>,
    connection_tx: watch::Sender<ConnectionSlot>,
    pending_pong: Mutex<Option<(u64, oneshot::Sender<()>)>>,
    pong_timeout: Option<Duration>,
    /// Frames enqueued but not yet fully delivered.
    outstanding: AtomicUsize,
    drained: Notify,
    closing: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FrameSender {
    /// Creates the sender and spawns its send and ping loops.
    pub fn start(label: impl Into<String>, config: FrameSenderConfig) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (connection_tx, _) = watch::channel(None);
        let sender = Arc::new(Self {
            label: label.into(),
            queue_tx,
            unacknowledged: Mutex::new(BTreeMap::new()),
            connection_tx,
            pending_pong: Mutex::new(None),
            pong_timeout: config.pong_timeout,
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let send_loop = tokio::spawn(sender.clone().send_loop(queue_rx));
        let ping_loop = tokio::spawn(sender.clone().ping_loop());
        sender.tasks.lock().extend([send_loop, ping_loop]);
        sender
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queues a frame for delivery, waiting while the queue is full.
    pub async fn enqueue(&self, frame: Frame) -> Result<(), RpcError> {
        if self.closing.load(Ordering::Acquire) || self.cancel.is_cancelled() {
            return Err(RpcError::SessionClosed);
        }
        let slot = OutstandingSlot::reserve(self);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RpcError::SessionClosed),
            res = self.queue_tx.send(frame) => {
                res.map_err(|_| RpcError::SessionClosed)?;
                // The send loop now owns the count.
                slot.queued();
                Ok(())
            }
        }
    }

    /// Attaches a new live connection. Unacknowledged frames are replayed onto it
    /// before the queue is drained further.
    pub fn attach(&self, connection: Arc<Connection>) {
        debug!(
            "{}: attaching connection {} ({}).",
            self.label,
            connection.id(),
            connection.peer()
        );
        self.connection_tx.send_replace(Some(connection));
    }

    /// Detaches `connection_id` if it is the attached connection.
    pub fn detach(&self, connection_id: u64) -> bool {
        self.connection_tx.send_if_modified(|slot| {
            if slot.as_ref().is_some_and(|c| c.id() == connection_id) {
                *slot = None;
                true
            } else {
                false
            }
        })
    }

    pub fn current_connection(&self) -> Option<Arc<Connection>> {
        self.connection_tx
            .borrow()
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Marks `message_id` as acknowledged by a reply or error frame.
    pub fn acknowledge(&self, message_id: u32) -> bool {
        self.unacknowledged.lock().remove(&message_id).is_some()
    }

    /// Ids of frames that would be retransmitted on the next attach, ascending.
    pub fn unacknowledged_ids(&self) -> Vec<u32> {
        self.unacknowledged.lock().keys().copied().collect()
    }

    /// Resolves the outstanding ping if the timestamps match.
    pub fn on_pong(&self, ping_sent_at_ms: u64) {
        let mut pending = self.pending_pong.lock();
        if pending.as_ref().is_some_and(|(sent, _)| *sent == ping_sent_at_ms) {
            if let Some((_, tx)) = pending.take() {
                let _ = tx.send(());
            }
        } else {
            debug!(
                "{}: ignoring pong for a ping sent at {} that is not outstanding.",
                self.label, ping_sent_at_ms
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops accepting frames, lets the queue drain for up to `grace`, then stops
    /// both loops.
    pub async fn shutdown(&self, grace: Duration) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.drained.notified();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    "{}: {} frames still undelivered after the {:?} grace period; dropping them.",
                    self.label,
                    self.outstanding.load(Ordering::Acquire),
                    grace
                );
                break;
            }
        }
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("{}: frame sender stopped.", self.label);
    }

    fn frame_done(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn send_loop(self: Arc<Self>, mut queue_rx: mpsc::Receiver<Frame>) {
        let mut connection_rx = self.connection_tx.subscribe();
        let mut current: ConnectionSlot = None;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                changed = connection_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.adopt_latest(&mut connection_rx, &mut current).await;
                }
                next = queue_rx.recv() => {
                    let Some(frame) = next else { break };
                    self.deliver(frame, &mut connection_rx, &mut current).await;
                    self.frame_done();
                }
            }
        }
        debug!("{}: send loop exited.", self.label);
    }

    /// Writes one frame, retrying across reconnects until it is on the wire or the
    /// sender is cancelled.
    async fn deliver(
        &self,
        frame: Frame,
        connection_rx: &mut watch::Receiver<ConnectionSlot>,
        current: &mut ConnectionSlot,
    ) {
        let message_id = frame.message_id();
        if let Some(id) = message_id {
            self.unacknowledged.lock().insert(id, frame.clone());
        }
        loop {
            let Some((connection, replayed)) =
                self.usable_connection(connection_rx, current).await
            else {
                return;
            };
            // A replay already carried this message onto the new connection.
            if replayed && message_id.is_some() {
                return;
            }
            match connection.write_frame(frame.clone()).await {
                Ok(()) => return,
                Err(e) => debug!(
                    "{}: {} frame not delivered on connection {}: {}. Waiting for a reconnect.",
                    self.label,
                    frame.kind(),
                    connection.id(),
                    e
                ),
            }
        }
    }

    /// Returns a live connection, waiting for one to attach if necessary. The flag
    /// is true when the connection was adopted during this call, i.e. the
    /// unacknowledged set was just replayed onto it.
    async fn usable_connection(
        &self,
        connection_rx: &mut watch::Receiver<ConnectionSlot>,
        current: &mut ConnectionSlot,
    ) -> Option<(Arc<Connection>, bool)> {
        loop {
            if let Some(connection) = current.as_ref().filter(|c| !c.is_closed()) {
                return Some((connection.clone(), false));
            }
            if self.adopt_latest(connection_rx, current).await {
                if let Some(connection) = current.as_ref().filter(|c| !c.is_closed()) {
                    return Some((connection.clone(), true));
                }
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                changed = connection_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Switches to the latest attached connection if it is new, replaying the
    /// unacknowledged set onto it. Returns true if a switch happened.
    async fn adopt_latest(
        &self,
        connection_rx: &mut watch::Receiver<ConnectionSlot>,
        current: &mut ConnectionSlot,
    ) -> bool {
        let latest = connection_rx.borrow_and_update().clone();
        let Some(connection) = latest.filter(|c| !c.is_closed()) else {
            return false;
        };
        if current.as_ref().is_some_and(|c| c.id() == connection.id()) {
            return false;
        }
        if let Err(e) = self.replay_unacknowledged(&connection).await {
            debug!(
                "{}: replay onto connection {} failed: {}",
                self.label,
                connection.id(),
                e
            );
        }
        *current = Some(connection);
        true
    }

    async fn replay_unacknowledged(&self, connection: &Connection) -> Result<(), RpcError> {
        let frames: Vec<Frame> = self.unacknowledged.lock().values().cloned().collect();
        if frames.is_empty() {
            return Ok(());
        }
        let count = frames.len();
        for frame in frames {
            connection.write_frame(frame).await?;
        }
        info!(
            "{}: retransmitted {} unacknowledged messages on connection {}.",
            self.label,
            count,
            connection.id()
        );
        Ok(())
    }

    async fn ping_loop(self: Arc<Self>) {
        let mut connection_rx = self.connection_tx.subscribe();
        loop {
            let Some(connection) = self.wait_attached(&mut connection_rx).await else {
                return;
            };
            let interval = connection.ping_interval();
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let Some(connection) = self.current_connection() else {
                continue;
            };

            let sent_at_ms = unix_millis();
            let (tx, rx) = oneshot::channel();
            *self.pending_pong.lock() = Some((sent_at_ms, tx));
            if self.enqueue(Frame::Ping { sent_at_ms }).await.is_err() {
                return;
            }

            let pong_timeout = self.pong_timeout.unwrap_or(interval);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = rx => {
                    if res.is_ok() {
                        debug!(
                            "{}: pong received after {} ms.",
                            self.label,
                            unix_millis().saturating_sub(sent_at_ms)
                        );
                    }
                }
                _ = tokio::time::sleep(pong_timeout) => {
                    warn!(
                        "{}: no pong within {:?} on connection {} ({}); closing it.",
                        self.label,
                        pong_timeout,
                        connection.id(),
                        connection.peer()
                    );
                    connection.close();
                }
            }
            self.pending_pong.lock().take();
        }
    }

    async fn wait_attached(
        &self,
        connection_rx: &mut watch::Receiver<ConnectionSlot>,
    ) -> Option<Arc<Connection>> {
        loop {
            if let Some(connection) = self.current_connection() {
                return Some(connection);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                changed = connection_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
