//! Session Events
//!
//! Notifications fanned out to presentation and gameplay collaborators.
//! Nothing here is consulted for correctness: subscribers observe, the
//! coordinator decides.

use std::time::Duration;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::ids::ActorId;
use crate::game::phase::SessionPhase;

/// Which ready-up window produced a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyUpAttempt {
    /// First window after everyone reached the race scene.
    Initial,
    /// Retry after the first window failed; counters were reset.
    Reset,
}

/// Why the session is being left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveKind {
    /// Hand authority off first, then leave.
    Graceful,
    /// Leave immediately, no handoff.
    Forced,
}

/// Event emitted by the session coordinator.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Phase changed.
    PhaseChanged {
        /// Phase left.
        from: SessionPhase,
        /// Phase entered.
        to: SessionPhase,
    },

    /// Participant entered the room.
    PlayerJoined {
        /// New participant.
        actor: ActorId,
        /// Display name.
        nickname: String,
    },

    /// Participant left the room.
    PlayerLeft {
        /// Departed participant.
        actor: ActorId,
        /// Display name.
        nickname: String,
    },

    /// The local ready flag changed.
    LocalReadyChanged {
        /// New flag value.
        ready: bool,
    },

    /// Countdown crossed a whole-second boundary.
    CountdownTick {
        /// Whole seconds left, rounded up.
        seconds_remaining: u32,
    },

    /// Countdown reached zero with membership unchanged.
    CountdownCompleted {
        /// Phase the countdown ran in.
        phase: SessionPhase,
    },

    /// Countdown aborted because membership changed.
    CountdownAborted,

    /// Load the race scene.
    SceneLoadRequested,

    /// Membership changed while resettable; show lobby affordances again.
    SceneReset,

    /// Prompt the local participant to ready up for the race.
    ReadyUpRequested,

    /// Outcome of a ready-up window on the authority holder.
    ReadyUpResult {
        /// Everyone readied before the window closed.
        success: bool,
        /// Window that produced this result.
        attempt: ReadyUpAttempt,
    },

    /// Race started.
    RaceStarted,

    /// Another participant crossed the line.
    RacerFinished {
        /// Finishing participant.
        actor: ActorId,
        /// Display name.
        nickname: String,
        /// Race time, serialized in milliseconds.
        #[serde(with = "duration_ms")]
        elapsed: Duration,
        /// First across the line.
        is_winner: bool,
    },

    /// Every racer in the scene finished.
    RaceEnded,

    /// The authority holder changed.
    AuthorityChanged {
        /// New holder.
        holder: ActorId,
        /// The new holder is this participant.
        is_local: bool,
    },

    /// The last participant in the race scene will be sent back.
    ForcedLeaveScheduled {
        /// Time until the leave, serialized in milliseconds.
        #[serde(with = "duration_ms")]
        delay: Duration,
    },

    /// The coordinator asks its owner to leave the room.
    LeaveRequested {
        /// How to leave.
        kind: LeaveKind,
    },
}

mod duration_ms {
    use std::time::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

// =============================================================================
// EVENT BUS
// =============================================================================

/// Publish/subscribe channel owned by one session.
///
/// A subscription lives exactly as long as the returned receiver; dropping
/// it unsubscribes. Dropping the bus closes every receiver.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
