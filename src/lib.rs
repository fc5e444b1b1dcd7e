// src/lib.rs

pub mod client;
pub mod config;
pub mod connection;
pub mod core;
pub mod server;

/// The crate version, overridable at build time through `CRAFTLINK_VERSION`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export
pub use crate::client::{ClientApplication, ClientExit, RpcClient};
pub use crate::config::{RpcClientConfig, RpcServerConfig};
pub use crate::connection::{MessageReceiver, MessageSender};
pub use crate::core::handshake::{AuthSecretProvider, HandshakeOutcome, StaticAuthProvider};
pub use crate::core::protocol::{AuthSecret, AuthToken};
pub use crate::core::{MessageRegistry, Reply, Request, RpcError};
pub use crate::server::{RegisteredConnection, RpcServer, ServerApplication};
