//! Protocol Messages
//!
//! The session message catalogue. Every message the coordinator sends or
//! accepts is a variant of [`SessionMessage`]; each kind has exactly one
//! delivery route.
//!
//! Messages travel as bincode; JSON is kept for logs and debugging.
//! Externally tagged on purpose: bincode cannot decode internally tagged
//! enums.

use std::fmt;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::ids::ActorId;

// =============================================================================
// DELIVERY
// =============================================================================

/// Where the transport delivers a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Current authority holder only (may be the sender).
    MasterClient,
    /// Everyone including the sender, ordered through the server.
    AllViaServer,
    /// Everyone except the sender.
    Others,
    /// A single participant.
    Actor(ActorId),
}

/// Catalogue route of a message kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// `Target::MasterClient`.
    ToMaster,
    /// `Target::AllViaServer`.
    AllViaServer,
    /// `Target::Others`.
    Others,
    /// `Target::Actor`, addressee carried by the message.
    Directed,
}

// =============================================================================
// CUSTOM PAYLOAD
// =============================================================================

/// A registered custom type, tagged with its type byte.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomPayload {
    /// Reserved type tag.
    pub tag: u8,
    /// Fixed-length encoded body.
    pub bytes: Vec<u8>,
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Message kinds, one per catalogue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageKind {
    /// Local readiness delta.
    ReadyUpdate,
    /// Begin synchronized countdown.
    StartCountdown,
    /// Scene-entry accounting.
    UpdatePlayersInScene,
    /// Begin race-ready-up flow.
    ShowReadyUpInfo,
    /// Informational finish broadcast.
    RacerFinishedInfo,
    /// Terminal race-finished broadcast.
    RaceEnded,
    /// Pre-departure authority handoff.
    AuthoritySnapshotTransfer,
    /// Unrecoverable-error evacuation.
    ForceLeaveRoom,
}

impl MessageKind {
    /// Every kind in the catalogue.
    pub const ALL: [MessageKind; 8] = [
        MessageKind::ReadyUpdate,
        MessageKind::StartCountdown,
        MessageKind::UpdatePlayersInScene,
        MessageKind::ShowReadyUpInfo,
        MessageKind::RacerFinishedInfo,
        MessageKind::RaceEnded,
        MessageKind::AuthoritySnapshotTransfer,
        MessageKind::ForceLeaveRoom,
    ];

    /// Delivery route for this kind.
    pub fn route(self) -> Route {
        match self {
            MessageKind::ReadyUpdate | MessageKind::UpdatePlayersInScene => Route::ToMaster,
            MessageKind::StartCountdown
            | MessageKind::ShowReadyUpInfo
            | MessageKind::RacerFinishedInfo
            | MessageKind::RaceEnded => Route::AllViaServer,
            MessageKind::AuthoritySnapshotTransfer => Route::Directed,
            MessageKind::ForceLeaveRoom => Route::Others,
        }
    }

    /// Only the authority holder may send these.
    pub fn requires_authority(self) -> bool {
        matches!(
            self,
            MessageKind::StartCountdown
                | MessageKind::ShowReadyUpInfo
                | MessageKind::RacerFinishedInfo
                | MessageKind::RaceEnded
                | MessageKind::AuthoritySnapshotTransfer
                | MessageKind::ForceLeaveRoom
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Session messages exchanged between participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Local readiness changed.
    ReadyUpdate {
        /// New ready value.
        ready: bool,
    },

    /// Begin the synchronized countdown.
    StartCountdown,

    /// Sender entered or left the race scene.
    UpdatePlayersInScene {
        /// True on entry.
        joined: bool,
    },

    /// Begin the race ready-up flow.
    ShowReadyUpInfo,

    /// A racer crossed the line.
    RacerFinishedInfo {
        /// Finisher's actor number; the finisher ignores its own notice.
        finisher: ActorId,
        /// Finisher's nickname.
        name: String,
        /// Race time in milliseconds.
        elapsed_ms: u64,
        /// First to finish.
        is_winner: bool,
    },

    /// Every racer finished.
    RaceEnded,

    /// Authority snapshot for the holder's successor.
    AuthoritySnapshotTransfer {
        /// Addressee; everyone else ignores the message.
        successor: ActorId,
        /// Encoded authority state.
        snapshot: CustomPayload,
    },

    /// Leave the room now.
    ForceLeaveRoom,
}

impl SessionMessage {
    /// Catalogue kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            SessionMessage::ReadyUpdate { .. } => MessageKind::ReadyUpdate,
            SessionMessage::StartCountdown => MessageKind::StartCountdown,
            SessionMessage::UpdatePlayersInScene { .. } => MessageKind::UpdatePlayersInScene,
            SessionMessage::ShowReadyUpInfo => MessageKind::ShowReadyUpInfo,
            SessionMessage::RacerFinishedInfo { .. } => MessageKind::RacerFinishedInfo,
            SessionMessage::RaceEnded => MessageKind::RaceEnded,
            SessionMessage::AuthoritySnapshotTransfer { .. } => MessageKind::AuthoritySnapshotTransfer,
            SessionMessage::ForceLeaveRoom => MessageKind::ForceLeaveRoom,
        }
    }

    /// Transport target derived from the catalogue route.
    pub fn target(&self) -> Target {
        match self {
            SessionMessage::AuthoritySnapshotTransfer { successor, .. } => Target::Actor(*successor),
            other => match other.kind().route() {
                Route::ToMaster => Target::MasterClient,
                Route::AllViaServer => Target::AllViaServer,
                Route::Others => Target::Others,
                // Only snapshot transfers are directed.
                Route::Directed => Target::Others,
            },
        }
    }

    /// Build a finish notice.
    pub fn racer_finished(finisher: ActorId, name: impl Into<String>, elapsed: Duration, is_winner: bool) -> Self {
        SessionMessage::RacerFinishedInfo {
            finisher,
            name: name.into(),
            elapsed_ms: elapsed.as_millis() as u64,
            is_winner,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Message framing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Failed to encode a message.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// Failed to decode a message.
    #[error("failed to decode message: {0}")]
    Decode(String),
}
