//! Authority State Wire Codec
//!
//! Fixed-length binary block:
//!
//! ```text
//! [players_ready: u32][players_in_scene: u32][finish slot: u32] x N
//! ```
//!
//! Little-endian words, N = player cap. The transport's message length is
//! the only framing; a payload of any other length is corrupt.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::game::authority::AuthorityState;
use crate::network::protocol::CustomPayload;

/// Type tag reserved for authority snapshots.
pub const AUTHORITY_STATE_TYPE_TAG: u8 = b'R';

/// Bytes per encoded word.
pub const WORD_SIZE: usize = 4;

/// Number of counter words before the finish slots.
pub const HEADER_WORDS: usize = 2;

/// Codec errors. A failing payload is dropped whole.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Payload carries a different type tag.
    #[error("unexpected type tag {found:#04x}, expected {expected:#04x}")]
    WrongTag {
        /// Tag the codec handles.
        expected: u8,
        /// Tag on the payload.
        found: u8,
    },

    /// Payload length does not match the fixed layout.
    #[error("payload is {found} bytes, expected {expected}")]
    WrongLength {
        /// Fixed length for this cap.
        expected: usize,
        /// Received length.
        found: usize,
    },

    /// A counter exceeds the player cap.
    #[error("{counter} = {value} exceeds cap {cap}")]
    CounterOutOfRange {
        /// Counter name.
        counter: &'static str,
        /// Decoded value.
        value: u32,
        /// Player cap.
        cap: u32,
    },

    /// State was sized for a different cap.
    #[error("state has {found} finish slots, codec expects {expected}")]
    SlotCountMismatch {
        /// Codec cap.
        expected: usize,
        /// State cap.
        found: usize,
    },

    /// No type registered under this tag.
    #[error("no custom type registered for tag {0:#04x}")]
    Unregistered(u8),
}

// =============================================================================
// CUSTOM TYPE REGISTRY
// =============================================================================

/// Entry in the transport's custom-type registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisteredType {
    /// Human-readable type name.
    pub type_name: &'static str,
    /// Exact encoded length.
    pub encoded_len: usize,
}

/// Outcome of a registration attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// First registration for this tag.
    Registered,
    /// Tag already taken; the existing entry is kept.
    Conflict(RegisteredType),
}

/// Custom payload types known to a transport endpoint, keyed by tag byte.
#[derive(Clone, Debug, Default)]
pub struct CustomTypeRegistry {
    entries: BTreeMap<u8, RegisteredType>,
}

impl CustomTypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type under `tag`.
    ///
    /// A second attempt for the same tag never replaces the first entry.
    pub fn register(&mut self, tag: u8, entry: RegisteredType) -> Registration {
        match self.entries.get(&tag) {
            Some(existing) => {
                warn!(
                    "custom type tag {:#04x} already registered as {} ({} bytes), ignoring {}",
                    tag, existing.type_name, existing.encoded_len, entry.type_name
                );
                Registration::Conflict(*existing)
            }
            None => {
                debug!("registered custom type {} under tag {:#04x}", entry.type_name, tag);
                self.entries.insert(tag, entry);
                Registration::Registered
            }
        }
    }

    /// Look up a tag.
    pub fn get(&self, tag: u8) -> Option<&RegisteredType> {
        self.entries.get(&tag)
    }

    /// Check a payload against its registered shape.
    pub fn validate(&self, payload: &CustomPayload) -> Result<&RegisteredType, CodecError> {
        let entry = self.entries.get(&payload.tag).ok_or(CodecError::Unregistered(payload.tag))?;
        if payload.bytes.len() != entry.encoded_len {
            return Err(CodecError::WrongLength {
                expected: entry.encoded_len,
                found: payload.bytes.len(),
            });
        }
        Ok(entry)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// WIRE CODEC
// =============================================================================

/// Encoder/decoder for [`AuthorityState`] at a fixed player cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireCodec {
    max_players: usize,
}

impl WireCodec {
    /// Codec for rooms of `max_players`.
    pub fn new(max_players: u8) -> Self {
        Self { max_players: max_players as usize }
    }

    /// Encoded size: two counter words plus one word per slot.
    pub const fn encoded_len_for(max_players: usize) -> usize {
        (HEADER_WORDS + max_players) * WORD_SIZE
    }

    /// Encoded size for this codec.
    pub fn encoded_len(&self) -> usize {
        Self::encoded_len_for(self.max_players)
    }

    /// Registry entry describing this codec.
    pub fn registered_type(&self) -> RegisteredType {
        RegisteredType {
            type_name: "AuthorityState",
            encoded_len: self.encoded_len(),
        }
    }

    /// Register with a transport's registry. Safe to call repeatedly.
    pub fn register(&self, registry: &mut CustomTypeRegistry) -> Registration {
        registry.register(AUTHORITY_STATE_TYPE_TAG, self.registered_type())
    }

    /// Encode to the fixed block.
    pub fn encode(&self, state: &AuthorityState) -> Result<Vec<u8>, CodecError> {
        if state.finish_slots().len() != self.max_players {
            return Err(CodecError::SlotCountMismatch {
                expected: self.max_players,
                found: state.finish_slots().len(),
            });
        }

        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.extend_from_slice(&state.players_ready().to_le_bytes());
        bytes.extend_from_slice(&state.players_in_scene().to_le_bytes());
        for slot in state.finish_slots() {
            bytes.extend_from_slice(&slot.to_le_bytes());
        }
        Ok(bytes)
    }

    /// Decode the fixed block.
    pub fn decode(&self, data: &[u8]) -> Result<AuthorityState, CodecError> {
        if data.len() != self.encoded_len() {
            return Err(CodecError::WrongLength {
                expected: self.encoded_len(),
                found: data.len(),
            });
        }

        let mut words = data
            .chunks_exact(WORD_SIZE)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));

        let cap = self.max_players as u32;
        let mut counter = |name: &'static str| -> Result<u32, CodecError> {
            let value = words.next().unwrap_or_default();
            if value > cap {
                return Err(CodecError::CounterOutOfRange { counter: name, value, cap });
            }
            Ok(value)
        };

        let players_ready = counter("players_ready")?;
        let players_in_scene = counter("players_in_scene")?;
        let finish_slots: Vec<u32> = words.collect();

        Ok(AuthorityState::from_parts(players_ready, players_in_scene, finish_slots))
    }

    /// Encode into a tagged payload.
    pub fn to_payload(&self, state: &AuthorityState) -> Result<CustomPayload, CodecError> {
        Ok(CustomPayload {
            tag: AUTHORITY_STATE_TYPE_TAG,
            bytes: self.encode(state)?,
        })
    }

    /// Decode a tagged payload.
    pub fn from_payload(&self, payload: &CustomPayload) -> Result<AuthorityState, CodecError> {
        if payload.tag != AUTHORITY_STATE_TYPE_TAG {
            return Err(CodecError::WrongTag {
                expected: AUTHORITY_STATE_TYPE_TAG,
                found: payload.tag,
            });
        }
        self.decode(&payload.bytes)
    }
}
