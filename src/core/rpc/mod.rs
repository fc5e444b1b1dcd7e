// src/core/rpc/mod.rs

//! Session-scoped delivery machinery shared by the client and the server.

pub mod frame_sender;
pub mod link;
pub mod receive_tracker;
pub mod reply_tracker;

pub use frame_sender::{FrameSender, FrameSenderConfig};
pub use link::{BoxedReader, BoxedWriter, Connection};
pub use receive_tracker::ReceiveTracker;
pub use reply_tracker::{PendingReply, ReplyTracker};

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Allocates outbound message ids. Starts at 1 and only ever grows; each
/// client or server object owns its own sequence.
#[derive(Debug)]
pub struct MessageIdSequence(AtomicU32);

impl MessageIdSequence {
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    pub fn next_id(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MessageIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates ids for physical connections, used in log lines and to tell a
/// freshly attached connection from the previous one.
#[derive(Debug, Default)]
pub struct ConnectionIdSequence(AtomicU64);

impl ConnectionIdSequence {
    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}
