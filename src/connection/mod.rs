// src/connection/mod.rs

//! Per-connection and per-session plumbing shared by the client and the
//! server: the frame reader, the typed sender and the receiver surface.

mod channel;
mod guard;
mod reader;
mod receiver;
mod sender;
mod stream;

pub use channel::SessionChannel;
pub use guard::ConnectionGuard;
pub use reader::{FrameReader, ReadOutcome};
pub use receiver::{ChannelEvent, ChannelReceiver, IncomingMessage, MessageReceiver};
pub use sender::{ChannelSlot, MessageSender};
pub use stream::AnyStream;
