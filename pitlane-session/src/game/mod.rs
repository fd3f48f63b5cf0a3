//! Race Session Model
//!
//! Shared state and vocabulary of a race session, independent of any
//! transport.
//!
//! ## Module Structure
//!
//! - `authority`: Counters owned by the authority holder
//! - `phase`: Lobby / Setup / Racing / Finished state machine
//! - `events`: Events published to presentation and gameplay

pub mod authority;
pub mod phase;
pub mod events;

// Re-export key types
pub use authority::{AuthorityError, AuthorityState, FinishRecord, EMPTY_SLOT};
pub use phase::{InvalidTransition, SessionPhase};
pub use events::{EventBus, LeaveKind, ReadyUpAttempt, SessionEvent};
