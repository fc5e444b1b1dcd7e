// src/config.rs

//! Client and server configuration: loading from TOML, defaults, and validation.

use crate::core::handshake::StaticAuthProvider;
use crate::core::handshake::tls::{self, CertificateThumbprint};
use crate::core::protocol::AuthSecret;
use crate::core::rpc::FrameSenderConfig;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Queue sizes and the inbound concurrency cap, shared by both ends.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Capacity of the queue feeding a `ChannelReceiver`.
    #[serde(default = "default_message_queue_capacity")]
    pub message_queue_capacity: usize,
    /// Capacity of a session's outbound frame queue. Senders wait when it is full.
    #[serde(default = "default_frame_queue_capacity")]
    pub frame_queue_capacity: usize,
    /// How many inbound messages of one connection may be handled at once.
    #[serde(default = "default_max_concurrently_handled_messages")]
    pub max_concurrently_handled_messages: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            message_queue_capacity: default_message_queue_capacity(),
            frame_queue_capacity: default_frame_queue_capacity(),
            max_concurrently_handled_messages: default_max_concurrently_handled_messages(),
        }
    }
}

impl QueueConfig {
    pub fn frame_sender(&self, pong_timeout: Option<Duration>) -> FrameSenderConfig {
        FrameSenderConfig {
            queue_capacity: self.frame_queue_capacity,
            pong_timeout,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.message_queue_capacity == 0 {
            return Err(anyhow!("message_queue_capacity cannot be 0"));
        }
        if self.frame_queue_capacity == 0 {
            return Err(anyhow!("frame_queue_capacity cannot be 0"));
        }
        if self.max_concurrently_handled_messages == 0 {
            return Err(anyhow!("max_concurrently_handled_messages cannot be 0"));
        }
        Ok(())
    }
}

fn default_message_queue_capacity() -> usize {
    1024
}
fn default_frame_queue_capacity() -> usize {
    1024
}
fn default_max_concurrently_handled_messages() -> usize {
    16
}

/// Exponential reconnect backoff for the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde", default = "default_backoff_initial")]
    pub initial: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(with = "humantime_serde", default = "default_backoff_max")]
    pub max: Duration,
    /// Fraction of each delay added as random jitter, from 0.0 to 1.0.
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
    /// Attempt limit for the initial connection. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: default_backoff_initial(),
            multiplier: default_backoff_multiplier(),
            max: default_backoff_max(),
            jitter: default_backoff_jitter(),
            max_attempts: None,
        }
    }
}

fn default_backoff_initial() -> Duration {
    Duration::from_millis(500)
}
fn default_backoff_multiplier() -> f64 {
    1.5
}
fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}
fn default_backoff_jitter() -> f64 {
    0.1
}

/// TLS settings of the server.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ServerTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

fn default_cert_path() -> String {
    "craftlink.crt".to_string()
}
fn default_key_path() -> String {
    "craftlink.key".to_string()
}

/// TLS settings of the client. The server certificate is pinned by thumbprint.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ClientTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Hex SHA-1 (40 digits) or SHA-256 (64 digits) of the server certificate.
    #[serde(default)]
    pub certificate_thumbprint: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Accepted handshake signature schemes, e.g. `ECDSA_NISTP256_SHA256`.
    /// Empty means the built-in default set.
    #[serde(default)]
    pub allowed_signature_schemes: Vec<String>,
}

fn default_server_name() -> String {
    "localhost".to_string()
}

/// A client the server accepts, with its hex-encoded secret.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientCredentials {
    pub guid: Uuid,
    pub secret: String,
}

/// Configuration of an `RpcServer`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub queues: QueueConfig,
    /// Liveness cadence announced to every client.
    #[serde(default = "default_ping_interval_seconds")]
    pub ping_interval_seconds: u16,
    /// How long a session survives without a connection.
    #[serde(with = "humantime_serde", default = "default_disconnect_session_timeout")]
    pub disconnect_session_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_shutdown_grace_period")]
    pub shutdown_grace_period: Duration,
    /// Time to wait for a pong. Defaults to the ping interval.
    #[serde(default, with = "humantime_serde")]
    pub pong_timeout: Option<Duration>,
    #[serde(default)]
    pub tls: ServerTlsConfig,
    /// Clients accepted by the built-in static auth provider.
    #[serde(default)]
    pub clients: Vec<ClientCredentials>,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            queues: QueueConfig::default(),
            ping_interval_seconds: default_ping_interval_seconds(),
            disconnect_session_timeout: default_disconnect_session_timeout(),
            handshake_timeout: default_handshake_timeout(),
            shutdown_grace_period: default_shutdown_grace_period(),
            pong_timeout: None,
            tls: ServerTlsConfig::default(),
            clients: Vec::new(),
        }
    }
}

impl RpcServerConfig {
    /// Creates a new `RpcServerConfig` by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid server config in '{path}'"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: RpcServerConfig =
            toml::from_str(contents).context("Failed to parse server config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.ping_interval_seconds))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Builds the static auth provider from the `clients` table.
    pub fn auth_provider(&self) -> Result<StaticAuthProvider> {
        let mut provider = StaticAuthProvider::new();
        for client in &self.clients {
            let secret = AuthSecret::from_hex(&client.secret)
                .with_context(|| format!("Invalid secret for client {}", client.guid))?;
            provider.insert(client.guid, secret);
        }
        Ok(provider)
    }

    /// Validates the configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        self.queues.validate()?;
        if self.ping_interval_seconds == 0 {
            return Err(anyhow!("ping_interval_seconds cannot be 0"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(anyhow!("handshake_timeout cannot be 0"));
        }
        if self.pong_timeout.is_some_and(|t| t.is_zero()) {
            return Err(anyhow!("pong_timeout cannot be 0"));
        }
        if self.disconnect_session_timeout < self.ping_interval() {
            warn!(
                "disconnect_session_timeout ({:?}) is shorter than the ping interval; sessions may close during brief outages.",
                self.disconnect_session_timeout
            );
        }
        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }
        self.auth_provider()?;
        Ok(())
    }
}

/// Configuration of an `RpcClient`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcClientConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub client_guid: Uuid,
    /// Hex-encoded 32-byte secret.
    pub secret: String,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_shutdown_grace_period")]
    pub shutdown_grace_period: Duration,
    /// Time to wait for a pong. Defaults to the ping interval the server announces.
    #[serde(default, with = "humantime_serde")]
    pub pong_timeout: Option<Duration>,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub tls: ClientTlsConfig,
}

impl RpcClientConfig {
    /// A configuration with defaults for everything but the identity.
    pub fn new(client_guid: Uuid, secret: &AuthSecret) -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_guid,
            secret: secret.to_hex(),
            queues: QueueConfig::default(),
            connect_timeout: default_connect_timeout(),
            handshake_timeout: default_handshake_timeout(),
            shutdown_grace_period: default_shutdown_grace_period(),
            pong_timeout: None,
            backoff: BackoffConfig::default(),
            tls: ClientTlsConfig::default(),
        }
    }

    /// Creates a new `RpcClientConfig` by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid client config in '{path}'"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: RpcClientConfig =
            toml::from_str(contents).context("Failed to parse client config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn auth_secret(&self) -> Result<AuthSecret> {
        Ok(AuthSecret::from_hex(&self.secret)?)
    }

    /// Validates the configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        self.queues.validate()?;
        self.auth_secret()?;
        if self.pong_timeout.is_some_and(|t| t.is_zero()) {
            return Err(anyhow!("pong_timeout cannot be 0"));
        }
        if self.backoff.initial.is_zero() {
            return Err(anyhow!("backoff.initial cannot be 0"));
        }
        if !(self.backoff.multiplier >= 1.0) {
            return Err(anyhow!("backoff.multiplier must be at least 1.0"));
        }
        if self.backoff.max < self.backoff.initial {
            return Err(anyhow!("backoff.max cannot be shorter than backoff.initial"));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(anyhow!("backoff.jitter must be between 0.0 and 1.0"));
        }
        if self.backoff.max_attempts == Some(0) {
            return Err(anyhow!("backoff.max_attempts cannot be 0"));
        }
        if self.tls.enabled {
            CertificateThumbprint::parse(&self.tls.certificate_thumbprint)?;
            tls::server_name(&self.tls.server_name)?;
            tls::parse_signature_schemes(
                &self.tls.allowed_signature_schemes,
                &tls::crypto_provider(),
            )?;
        }
        Ok(())
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7712
}
fn default_ping_interval_seconds() -> u16 {
    10
}
fn default_disconnect_session_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}
fn default_handshake_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_shutdown_grace_period() -> Duration {
    Duration::from_secs(10)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
