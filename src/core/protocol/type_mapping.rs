// src/core/protocol/type_mapping.rs

//! Per-connection tables between message kinds and their one-byte wire codes.

use crate::core::messages::{MessageKind, MessageRegistry};
use std::collections::HashMap;
use tracing::{debug, warn};

/// A connection-scoped, immutable mapping for one direction of the channel.
///
/// Codes are positions in the list the server announced. Names the local
/// registry does not know are skipped, so a code may map to nothing; frames
/// carrying such a code are dropped by the reader.
#[derive(Debug, Clone, Default)]
pub struct TypeMapping {
    by_name: HashMap<&'static str, u8>,
    by_code: Vec<Option<&'static MessageKind>>,
}

impl TypeMapping {
    /// Builds the mapping for registry `M` from an announced list of names.
    pub fn from_announced<M: MessageRegistry, S: AsRef<str>>(announced: &[S]) -> Self {
        let mut by_name = HashMap::new();
        let mut by_code = Vec::with_capacity(announced.len());
        for (code, name) in announced.iter().enumerate() {
            let name = name.as_ref();
            let Ok(code) = u8::try_from(code) else {
                warn!(
                    "Ignoring message type '{}': code space of 256 entries is exhausted.",
                    name
                );
                break;
            };
            match M::kind(name) {
                Some(kind) => {
                    by_name.insert(kind.name, code);
                    by_code.push(Some(kind));
                }
                None => {
                    warn!(
                        "Peer announced message type '{}' (code {}) which this side does not know; it will be ignored.",
                        name, code
                    );
                    by_code.push(None);
                }
            }
        }
        for kind in M::KINDS {
            if !by_name.contains_key(kind.name) {
                debug!(
                    "Message type '{}' was not announced by the peer and cannot be exchanged on this connection.",
                    kind.name
                );
            }
        }
        Self { by_name, by_code }
    }

    /// Builds the mapping the announcing side uses for its own registry.
    pub fn local<M: MessageRegistry>() -> Self {
        Self::from_announced::<M, _>(M::names().as_slice())
    }

    pub fn code_of(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    pub fn kind_of(&self, code: u8) -> Option<&'static MessageKind> {
        self.by_code.get(code as usize).copied().flatten()
    }

    /// Number of kinds usable on this connection.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// The pair of mappings negotiated for one connection.
#[derive(Debug, Clone, Default)]
pub struct NegotiatedMappings {
    /// Kinds this side sends.
    pub outbound: TypeMapping,
    /// Kinds this side receives.
    pub inbound: TypeMapping,
}
