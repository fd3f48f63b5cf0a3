//! Participant Identity and Room Positions
//!
//! Actor numbers are handed out by the transport in join order and never
//! reused within a room. Room positions are derived from them: dense,
//! 1-based, and renumbered whenever a participant departs.

use std::collections::BTreeMap;
use std::fmt;
use serde::{Serialize, Deserialize};

// =============================================================================
// ACTOR ID
// =============================================================================

/// Stable join-order identifier assigned by the transport.
///
/// Implements Ord so rosters iterate in join order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(pub u32);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pick the participant that inherits authority when `holder` departs.
///
/// The next-higher actor number after the holder's own, wrapping around to
/// the lowest. Returns `None` when nobody else is present. This is the same
/// rule the transport uses to elect a new master client, so the handoff
/// target and the elected holder always agree.
pub fn successor_of(holder: ActorId, actors: impl IntoIterator<Item = ActorId>) -> Option<ActorId> {
    let mut lowest: Option<ActorId> = None;
    let mut next_higher: Option<ActorId> = None;

    for actor in actors {
        if actor == holder {
            continue;
        }
        if lowest.map_or(true, |l| actor < l) {
            lowest = Some(actor);
        }
        if actor > holder && next_higher.map_or(true, |n| actor < n) {
            next_higher = Some(actor);
        }
    }

    next_higher.or(lowest)
}

// =============================================================================
// PLAYER
// =============================================================================

/// A participant in the room.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Player {
    /// Transport-assigned identifier.
    pub id: ActorId,
    /// Is this the participant running this process.
    pub is_local: bool,
    /// Display name.
    pub nickname: String,
    /// Presentational ready flag. Authoritative readiness lives in the
    /// authority holder's counters.
    pub ready: bool,
    /// Dense 1-based room position.
    pub position: u32,
}

// =============================================================================
// ROSTER
// =============================================================================

/// Participants currently in the room, keyed by actor number.
#[derive(Clone, Debug, Default)]
pub struct Roster {
    players: BTreeMap<ActorId, Player>,
}

impl Roster {
    /// Create an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant at the end of the join order.
    ///
    /// Returns false if the actor is already present.
    pub fn insert(&mut self, id: ActorId, nickname: impl Into<String>, is_local: bool) -> bool {
        if self.players.contains_key(&id) {
            return false;
        }

        self.players.insert(id, Player {
            id,
            is_local,
            nickname: nickname.into(),
            ready: false,
            position: 0,
        });
        self.renumber();
        true
    }

    /// Remove a participant.
    ///
    /// Every remaining participant above the departed position moves down
    /// by one so positions stay dense.
    pub fn remove(&mut self, id: ActorId) -> Option<Player> {
        let departed = self.players.remove(&id)?;
        for player in self.players.values_mut() {
            if player.position > departed.position {
                player.position -= 1;
            }
        }
        Some(departed)
    }

    fn renumber(&mut self) {
        for (idx, player) in self.players.values_mut().enumerate() {
            player.position = idx as u32 + 1;
        }
    }

    /// Look up a participant.
    pub fn get(&self, id: ActorId) -> Option<&Player> {
        self.players.get(&id)
    }

    /// Look up a participant mutably.
    pub fn get_mut(&mut self, id: ActorId) -> Option<&mut Player> {
        self.players.get_mut(&id)
    }

    /// Room position of a participant.
    pub fn position_of(&self, id: ActorId) -> Option<u32> {
        self.players.get(&id).map(|p| p.position)
    }

    /// Number of participants. The local participant is always listed,
    /// so a roster in use is never empty.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// Actor numbers in join order.
    pub fn actors(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.players.keys().copied()
    }

    /// Participants in join order.
    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Clear every presentational ready flag.
    pub fn clear_ready(&mut self) {
        for player in self.players.values_mut() {
            player.ready = false;
        }
    }
}
