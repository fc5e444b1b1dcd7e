// src/core/protocol/primitives.rs

//! Fixed-width binary read/write helpers used by the handshake.
//!
//! All integers are little-endian. GUIDs use the mixed-endian layout: the first
//! three fields little-endian, the trailing eight bytes as-is.

use crate::core::RpcError;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Length in bytes of a client's shared secret.
pub const AUTH_SECRET_LEN: usize = 32;

/// Upper bound on the number of names in a negotiated message-type list.
/// Codes are a single byte, so a list can address at most 256 kinds.
pub const MAX_TYPE_LIST_LEN: usize = 256;

/// A client's shared secret. Comparison runs in fixed time and `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthSecret([u8; AUTH_SECRET_LEN]);

impl AuthSecret {
    pub fn new(bytes: [u8; AUTH_SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Parses a hex-encoded secret, as written in configuration files.
    pub fn from_hex(s: &str) -> Result<Self, RpcError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| RpcError::Config(format!("secret is not valid hex: {e}")))?;
        let bytes: [u8; AUTH_SECRET_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            RpcError::Config(format!(
                "secret must be {AUTH_SECRET_LEN} bytes, got {}",
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Generates a random secret.
    pub fn random() -> Self {
        let mut bytes = [0u8; AUTH_SECRET_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AUTH_SECRET_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compares two secrets without short-circuiting on the first differing byte.
    pub fn fixed_time_eq(&self, other: &AuthSecret) -> bool {
        let diff = self
            .0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        std::hint::black_box(diff) == 0
    }
}

impl fmt::Debug for AuthSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthSecret(<redacted>)")
    }
}

/// The credentials a client presents at the start of the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthToken {
    pub client_guid: Uuid,
    pub secret: AuthSecret,
}

pub async fn read_byte<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<u8, RpcError> {
    Ok(r.read_u8().await?)
}

pub async fn read_short<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<u16, RpcError> {
    Ok(r.read_u16_le().await?)
}

pub async fn read_int<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<u32, RpcError> {
    Ok(r.read_u32_le().await?)
}

pub async fn read_long<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<u64, RpcError> {
    Ok(r.read_u64_le().await?)
}

pub async fn read_guid<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<Uuid, RpcError> {
    let mut buf = [0u8; 16];
    r.read_exact(&mut buf).await?;
    Ok(Uuid::from_bytes_le(buf))
}

pub async fn read_auth_token<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
) -> Result<AuthToken, RpcError> {
    let client_guid = read_guid(r).await?;
    let mut secret = [0u8; AUTH_SECRET_LEN];
    r.read_exact(&mut secret).await?;
    Ok(AuthToken {
        client_guid,
        secret: AuthSecret(secret),
    })
}

/// Reads a zero-length-terminated list of ASCII names.
pub async fn read_type_list<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
) -> Result<Vec<String>, RpcError> {
    let mut names = Vec::new();
    loop {
        let len = r.read_u8().await? as usize;
        if len == 0 {
            return Ok(names);
        }
        if names.len() == MAX_TYPE_LIST_LEN {
            return Err(RpcError::Protocol(format!(
                "message type list exceeds {MAX_TYPE_LIST_LEN} entries"
            )));
        }
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).await?;
        if !buf.is_ascii() {
            return Err(RpcError::Protocol(
                "message type name is not ASCII".to_string(),
            ));
        }
        names.push(String::from_utf8_lossy(&buf).into_owned());
    }
}

pub async fn write_byte<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, value: u8) -> Result<(), RpcError> {
    Ok(w.write_u8(value).await?)
}

pub async fn write_short<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    value: u16,
) -> Result<(), RpcError> {
    Ok(w.write_u16_le(value).await?)
}

pub async fn write_int<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, value: u32) -> Result<(), RpcError> {
    Ok(w.write_u32_le(value).await?)
}

pub async fn write_long<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    value: u64,
) -> Result<(), RpcError> {
    Ok(w.write_u64_le(value).await?)
}

pub async fn write_guid<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    guid: &Uuid,
) -> Result<(), RpcError> {
    Ok(w.write_all(&guid.to_bytes_le()).await?)
}

pub async fn write_auth_token<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    token: &AuthToken,
) -> Result<(), RpcError> {
    write_guid(w, &token.client_guid).await?;
    Ok(w.write_all(token.secret.as_bytes()).await?)
}

/// Writes `names` as a zero-length-terminated list. The whole list is buffered
/// and written with a single call.
pub async fn write_type_list<W: AsyncWrite + Unpin + ?Sized, S: AsRef<str>>(
    w: &mut W,
    names: &[S],
) -> Result<(), RpcError> {
    if names.len() > MAX_TYPE_LIST_LEN {
        return Err(RpcError::Protocol(format!(
            "cannot declare more than {MAX_TYPE_LIST_LEN} message types"
        )));
    }
    let mut buf = Vec::new();
    for name in names {
        let name = name.as_ref();
        if name.is_empty() || name.len() > u8::MAX as usize || !name.is_ascii() {
            return Err(RpcError::Protocol(format!(
                "invalid message type name '{name}'"
            )));
        }
        buf.push(name.len() as u8);
        buf.extend_from_slice(name.as_bytes());
    }
    buf.push(0);
    Ok(w.write_all(&buf).await?)
}
