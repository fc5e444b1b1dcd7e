// src/core/messages.rs

//! Compile-time message registries.
//!
//! Each direction of the channel has one registry: an ordered list of message
//! kinds with an explicit serializer and deserializer per kind. The order is the
//! order in which the server announces kinds during the handshake, so a kind's
//! wire code is its position in the announcing side's list.
//!
//! Registries are normally declared with [`message_registry!`](crate::message_registry):
//!
//! ```ignore
//! craftlink::message_registry! {
//!     pub enum ToController {
//!         #[registration]
//!         Hello(AgentHello),
//!         InstanceStatus(StatusReport),
//!         ListInstances(ListInstances) => InstanceList,
//!     }
//! }
//! ```
//!
//! `Variant(Type) => ReplyType` marks a request and implements [`Request`] for
//! `Type`. A `#[registration]` kind is the only one that may be exchanged
//! through [`HandshakeIo`](crate::core::handshake::HandshakeIo) before the
//! frame loop starts.

use crate::core::RpcError;
use bytes::Bytes;

/// Static description of one message kind in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageKind {
    /// The name announced on the wire. ASCII, 1 to 255 bytes.
    pub name: &'static str,
    /// True if the receiver owes the sender a reply.
    pub has_reply: bool,
    /// True for the kind that may be exchanged during the handshake.
    pub registration: bool,
}

/// An ordered, statically declared set of message kinds for one direction.
pub trait MessageRegistry: Sized + Send + Sync + 'static {
    /// Every kind this registry can carry, in declaration order.
    const KINDS: &'static [MessageKind];

    /// The wire name of this message's kind.
    fn name(&self) -> &'static str;

    /// Serializes the message body.
    fn encode_payload(&self) -> Result<Vec<u8>, RpcError>;

    /// Deserializes a body of the kind called `name`.
    fn decode_payload(name: &str, payload: &[u8]) -> Result<Self, RpcError>;

    /// Looks up a kind by its wire name.
    fn kind(name: &str) -> Option<&'static MessageKind> {
        Self::KINDS.iter().find(|k| k.name == name)
    }

    /// The wire names of every kind, in declaration order.
    fn names() -> Vec<&'static str> {
        Self::KINDS.iter().map(|k| k.name).collect()
    }

    /// The registration kind, if the registry declares one.
    fn registration_kind() -> Option<&'static MessageKind> {
        Self::KINDS.iter().find(|k| k.registration)
    }
}

/// A message that expects a typed reply.
pub trait Request: bincode::Encode + Send + 'static {
    type Reply: bincode::Encode + bincode::Decode<()> + Send + 'static;
}

/// Serializes a payload with the channel's bincode configuration.
pub fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, RpcError> {
    Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
}

/// Deserializes a payload with the channel's bincode configuration.
pub fn decode<T: bincode::Decode<()>>(payload: &[u8]) -> Result<T, RpcError> {
    let (value, _) = bincode::decode_from_slice(payload, bincode::config::standard())?;
    Ok(value)
}

/// An encoded reply produced by a message handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply(Bytes);

impl Reply {
    pub fn new<T: bincode::Encode>(value: &T) -> Result<Self, RpcError> {
        Ok(Self(Bytes::from(encode(value)?)))
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __registry_flag {
    () => {
        false
    };
    (registration) => {
        true
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __registry_has_reply {
    () => {
        false
    };
    ($reply:ty) => {
        true
    };
}

/// Declares a message registry enum. See the [module docs](crate::core::messages).
#[macro_export]
macro_rules! message_registry {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$flag:ident])?
                $variant:ident ( $ty:ty ) $(=> $reply:ty)?
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $($variant($ty)),+
        }

        impl $crate::core::messages::MessageRegistry for $name {
            const KINDS: &'static [$crate::core::messages::MessageKind] = &[
                $(
                    $crate::core::messages::MessageKind {
                        name: stringify!($variant),
                        has_reply: $crate::__registry_has_reply!($($reply)?),
                        registration: $crate::__registry_flag!($($flag)?),
                    }
                ),+
            ];

            fn name(&self) -> &'static str {
                match self {
                    $($name::$variant(_) => stringify!($variant)),+
                }
            }

            fn encode_payload(&self) -> Result<Vec<u8>, $crate::core::RpcError> {
                match self {
                    $($name::$variant(m) => $crate::core::messages::encode(m)),+
                }
            }

            fn decode_payload(
                name: &str,
                payload: &[u8],
            ) -> Result<Self, $crate::core::RpcError> {
                match name {
                    $(
                        stringify!($variant) => {
                            $crate::core::messages::decode::<$ty>(payload).map($name::$variant)
                        }
                    )+
                    other => Err($crate::core::RpcError::UnknownMessageType(other.to_string())),
                }
            }
        }

        $(
            impl From<$ty> for $name {
                fn from(message: $ty) -> Self {
                    $name::$variant(message)
                }
            }

            $(
                impl $crate::core::messages::Request for $ty {
                    type Reply = $reply;
                }
            )?
        )+
    };
}
