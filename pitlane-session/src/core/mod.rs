//! Core primitives.
//!
//! Participant identity, room positions and the tick-driven waits the
//! session scheduler runs on. No networking here.

pub mod ids;
pub mod wait;

// Re-export core types
pub use ids::{successor_of, ActorId, Player, Roster};
pub use wait::{Countdown, CountdownStep, TimedWait, WaitStep};
