//! Authority State
//!
//! Cross-participant counters that no single participant can compute alone.
//! Exactly one participant holds the live copy at a time; it moves between
//! holders only as a full snapshot.
//!
//! Counters can only be changed through the mutation methods below. There
//! is no setter: a finish slot, once written, stays written until the state
//! is discarded at the end of the race.

use thiserror::Error;

/// Finish slot value meaning "nobody".
pub const EMPTY_SLOT: u32 = 0;

/// Counter mutation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    /// Counter already at the player cap.
    #[error("{counter} already at cap {cap}")]
    AtCap {
        /// Counter name.
        counter: &'static str,
        /// Player cap.
        cap: u32,
    },

    /// Counter already at zero.
    #[error("{counter} already at zero")]
    AtZero {
        /// Counter name.
        counter: &'static str,
    },

    /// Room positions are 1-based.
    #[error("invalid room position {0}")]
    InvalidPosition(u32),

    /// Position already has a finish slot.
    #[error("position {0} already finished")]
    AlreadyFinished(u32),

    /// Every finish slot is taken.
    #[error("all {0} finish slots are taken")]
    SlotsFull(u32),
}

/// Result of recording a finisher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinishRecord {
    /// Slot index the finisher was written to.
    pub slot: usize,
    /// True if no slot was filled before this one.
    pub is_first: bool,
}

/// The replicated counters object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorityState {
    players_ready: u32,
    players_in_scene: u32,
    finish_slots: Vec<u32>,
}

impl AuthorityState {
    /// Fresh state for a room with `max_players` slots.
    pub fn new(max_players: u8) -> Self {
        Self {
            players_ready: 0,
            players_in_scene: 0,
            finish_slots: vec![EMPTY_SLOT; max_players as usize],
        }
    }

    /// Rebuild from decoded wire fields. Only the codec calls this.
    pub(crate) fn from_parts(players_ready: u32, players_in_scene: u32, finish_slots: Vec<u32>) -> Self {
        Self {
            players_ready,
            players_in_scene,
            finish_slots,
        }
    }

    /// Player cap this state was sized for.
    pub fn max_players(&self) -> u32 {
        self.finish_slots.len() as u32
    }

    /// Participants that reported ready.
    pub fn players_ready(&self) -> u32 {
        self.players_ready
    }

    /// Participants that loaded the race scene.
    pub fn players_in_scene(&self) -> u32 {
        self.players_in_scene
    }

    /// Finish slots in finish order.
    pub fn finish_slots(&self) -> &[u32] {
        &self.finish_slots
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Count one more ready participant.
    pub fn increment_ready(&mut self) -> Result<u32, AuthorityError> {
        if self.players_ready >= self.max_players() {
            return Err(AuthorityError::AtCap { counter: "players_ready", cap: self.max_players() });
        }
        self.players_ready += 1;
        Ok(self.players_ready)
    }

    /// Count one fewer ready participant.
    pub fn decrement_ready(&mut self) -> Result<u32, AuthorityError> {
        if self.players_ready == 0 {
            return Err(AuthorityError::AtZero { counter: "players_ready" });
        }
        self.players_ready -= 1;
        Ok(self.players_ready)
    }

    /// Forget every ready report.
    pub fn reset_ready(&mut self) {
        self.players_ready = 0;
    }

    /// Count one more participant in the race scene.
    pub fn increment_in_scene(&mut self) -> Result<u32, AuthorityError> {
        if self.players_in_scene >= self.max_players() {
            return Err(AuthorityError::AtCap { counter: "players_in_scene", cap: self.max_players() });
        }
        self.players_in_scene += 1;
        Ok(self.players_in_scene)
    }

    /// Count one fewer participant in the race scene.
    pub fn decrement_in_scene(&mut self) -> Result<u32, AuthorityError> {
        if self.players_in_scene == 0 {
            return Err(AuthorityError::AtZero { counter: "players_in_scene" });
        }
        self.players_in_scene -= 1;
        Ok(self.players_in_scene)
    }

    /// Write a finisher's position into the first empty slot.
    ///
    /// Positions must be the ones frozen at race start; live room positions
    /// shift when someone leaves and would alias another racer.
    pub fn mark_finished(&mut self, position: u32) -> Result<FinishRecord, AuthorityError> {
        if position == EMPTY_SLOT {
            return Err(AuthorityError::InvalidPosition(position));
        }
        if self.finish_slots.contains(&position) {
            return Err(AuthorityError::AlreadyFinished(position));
        }

        let is_first = self.finished_count() == 0;
        let slot = self
            .finish_slots
            .iter()
            .position(|&s| s == EMPTY_SLOT)
            .ok_or(AuthorityError::SlotsFull(self.max_players()))?;

        self.finish_slots[slot] = position;
        Ok(FinishRecord { slot, is_first })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Number of non-empty finish slots.
    pub fn finished_count(&self) -> u32 {
        self.finish_slots.iter().filter(|&&s| s != EMPTY_SLOT).count() as u32
    }

    /// Race is over once every participant in the scene has a finish slot.
    pub fn race_finished(&self) -> bool {
        self.finished_count() == self.players_in_scene
    }

    /// Every slot of the room is ready.
    pub fn all_ready(&self) -> bool {
        self.players_ready == self.max_players()
    }

    /// Every slot of the room has loaded the race scene.
    pub fn all_in_scene(&self) -> bool {
        self.players_in_scene == self.max_players()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_state_is_empty() {
        let state = AuthorityState::new(4);
        assert_eq!(state.players_ready(), 0);
        assert_eq!(state.players_in_scene(), 0);
        assert_eq!(state.finish_slots(), &[0, 0, 0, 0]);
        assert_eq!(state.max_players(), 4);
    }

    #[test]
    fn test_ready_counter_bounds() {
        let mut state = AuthorityState::new(2);
        assert_eq!(state.increment_ready(), Ok(1));
        assert_eq!(state.increment_ready(), Ok(2));
        assert!(state.all_ready());
        assert!(matches!(state.increment_ready(), Err(AuthorityError::AtCap { .. })));

        state.reset_ready();
        assert!(matches!(state.decrement_ready(), Err(AuthorityError::AtZero { .. })));
    }

    #[test]
    fn test_race_finished_predicate() {
        let mut state = AuthorityState::new(4);
        for _ in 0..3 {
            state.increment_in_scene().unwrap();
        }

        state.mark_finished(2).unwrap();
        state.mark_finished(1).unwrap();
        assert!(!state.race_finished());

        state.mark_finished(3).unwrap();
        assert!(state.race_finished());
    }

    #[test]
    fn test_first_finisher_flag() {
        let mut state = AuthorityState::new(3);
        let first = state.mark_finished(3).unwrap();
        let second = state.mark_finished(1).unwrap();

        assert_eq!(first, FinishRecord { slot: 0, is_first: true });
        assert_eq!(second, FinishRecord { slot: 1, is_first: false });
        assert_eq!(state.finish_slots(), &[3, 1, 0]);
    }

    #[test]
    fn test_finish_slots_are_monotonic() {
        let mut state = AuthorityState::new(2);
        state.mark_finished(1).unwrap();

        assert_eq!(state.mark_finished(1), Err(AuthorityError::AlreadyFinished(1)));
        assert_eq!(state.mark_finished(0), Err(AuthorityError::InvalidPosition(0)));

        state.mark_finished(2).unwrap();
        assert_eq!(state.mark_finished(3), Err(AuthorityError::SlotsFull(2)));
        assert_eq!(state.finish_slots(), &[1, 2]);
    }

    proptest! {
        #[test]
        fn prop_ready_stays_within_cap(cap in 1u8..=8, ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let mut state = AuthorityState::new(cap);
            let mut ready = 0u32;

            // Paired sequence: a participant only un-readies after readying.
            for up in ops {
                if up && ready < cap as u32 {
                    state.increment_ready().unwrap();
                    ready += 1;
                } else if !up && ready > 0 {
                    state.decrement_ready().unwrap();
                    ready -= 1;
                }
                prop_assert!(state.players_ready() <= state.max_players());
                prop_assert_eq!(state.players_ready(), ready);
            }
        }

        #[test]
        fn prop_unpaired_sequences_never_leave_bounds(cap in 1u8..=8, ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let mut state = AuthorityState::new(cap);
            for up in ops {
                let _ = if up { state.increment_ready() } else { state.decrement_ready() };
                let _ = if up { state.increment_in_scene() } else { state.decrement_in_scene() };
                prop_assert!(state.players_ready() <= cap as u32);
                prop_assert!(state.players_in_scene() <= cap as u32);
            }
        }
    }
}
