//! Session Phase State Machine
//!
//! `Lobby -> Setup -> Racing -> Finished`, forward only, plus the reset
//! path back to `Lobby`.

use std::fmt;
use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Phase of the shared session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Room lobby, readying up for the race scene.
    #[default]
    Lobby,
    /// Race scene loaded, waiting for everyone to arrive and ready up.
    Setup,
    /// Race in progress.
    Racing,
    /// Every racer in the scene has finished.
    Finished,
}

impl SessionPhase {
    /// Next phase on the forward path.
    pub fn next(self) -> Option<SessionPhase> {
        match self {
            SessionPhase::Lobby => Some(SessionPhase::Setup),
            SessionPhase::Setup => Some(SessionPhase::Racing),
            SessionPhase::Racing => Some(SessionPhase::Finished),
            SessionPhase::Finished => None,
        }
    }

    /// Membership changes reset the session in these phases.
    pub fn is_resettable(self) -> bool {
        matches!(self, SessionPhase::Lobby | SessionPhase::Setup)
    }

    /// The race scene is loaded in these phases.
    pub fn in_race_scene(self) -> bool {
        !matches!(self, SessionPhase::Lobby)
    }

    /// Check a transition without applying it.
    pub fn can_transition(self, to: SessionPhase) -> bool {
        self.next() == Some(to) || (to == SessionPhase::Lobby && self != SessionPhase::Lobby)
    }

    /// Apply a transition.
    pub fn transition(&mut self, to: SessionPhase) -> Result<SessionPhase, InvalidTransition> {
        if !self.can_transition(to) {
            return Err(InvalidTransition { from: *self, to });
        }
        let from = *self;
        *self = to;
        Ok(from)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Lobby => "lobby",
            SessionPhase::Setup => "setup",
            SessionPhase::Racing => "racing",
            SessionPhase::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// A transition the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid phase transition: {from} -> {to}")]
pub struct InvalidTransition {
    /// Phase the machine was in.
    pub from: SessionPhase,
    /// Requested phase.
    pub to: SessionPhase,
}
