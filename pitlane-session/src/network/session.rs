//! Session Coordination
//!
//! The phase state machine and message router for one room. Exactly one
//! coordinator exists per joined room; it is created on join and dropped on
//! leave.
//!
//! Only the coordinator that currently holds authority mutates the
//! [`AuthorityState`]. Every mutation entry point checks its own
//! preconditions (phase, authority) and drops violations with a log line:
//! a remote sender cannot be made to retry synchronously.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SessionConfig;
use crate::core::ids::{ActorId, Roster};
use crate::core::wait::{Countdown, CountdownStep, TimedWait, WaitStep};
use crate::game::authority::AuthorityState;
use crate::game::events::{EventBus, LeaveKind, ReadyUpAttempt, SessionEvent};
use crate::game::phase::{InvalidTransition, SessionPhase};
use crate::network::codec::WireCodec;
use crate::network::protocol::{CustomPayload, SessionMessage};
use crate::network::transport::{NetworkEvent, RoomJoin, Transport};

/// Ready-up window run by the authority holder once everyone is in the
/// race scene.
#[derive(Clone, Debug)]
struct ReadyUpWindow {
    wait: TimedWait,
    attempt: ReadyUpAttempt,
    starting_count: usize,
}

/// Session coordinator for one room.
pub struct SessionCoordinator {
    config: SessionConfig,
    codec: WireCodec,
    local: ActorId,
    master: ActorId,
    phase: SessionPhase,
    roster: Roster,
    local_ready: bool,
    /// Ready prompt shown in `Setup`; readiness changes are accepted only then.
    ready_prompt_open: bool,
    /// Live counters while holding authority.
    authority: Option<AuthorityState>,
    /// Room positions frozen when the race started. Finish slots record
    /// these, so later renumbering cannot alias two racers.
    race_positions: BTreeMap<ActorId, u32>,
    countdown: Option<Countdown>,
    ready_up: Option<ReadyUpWindow>,
    /// Last-participant forced-leave delay.
    departure: Option<TimedWait>,
    leave_request: Option<LeaveKind>,
    events: EventBus,
}

impl SessionCoordinator {
    /// Create the coordinator for a freshly joined room.
    ///
    /// The room's creator is its first authority holder and starts with a
    /// fresh [`AuthorityState`].
    pub fn new(config: SessionConfig, join: &RoomJoin) -> Self {
        let mut roster = Roster::new();
        for (actor, nickname) in &join.players {
            roster.insert(*actor, nickname.clone(), *actor == join.local);
        }

        let authority = (join.master == join.local).then(|| AuthorityState::new(config.max_players));
        let events = EventBus::new(config.event_capacity);

        info!(
            "session for {} in room {} ({}/{} players, master {})",
            join.local, join.room.name, join.room.player_count, join.room.max_players, join.master
        );

        Self {
            codec: WireCodec::new(config.max_players),
            config,
            local: join.local,
            master: join.master,
            phase: SessionPhase::Lobby,
            roster,
            local_ready: false,
            ready_prompt_open: false,
            authority,
            race_positions: BTreeMap::new(),
            countdown: None,
            ready_up: None,
            departure: None,
            leave_request: None,
            events,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Local actor number.
    pub fn local(&self) -> ActorId {
        self.local
    }

    /// Current authority holder as reported by the transport.
    pub fn master(&self) -> ActorId {
        self.master
    }

    /// True while this participant holds authority and its counters.
    pub fn is_authority_holder(&self) -> bool {
        self.master == self.local && self.authority.is_some()
    }

    /// Live counters, if held.
    pub fn authority(&self) -> Option<&AuthorityState> {
        self.authority.as_ref()
    }

    /// Participants in the room.
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Local ready flag.
    pub fn local_ready(&self) -> bool {
        self.local_ready
    }

    /// Is a countdown running.
    pub fn countdown_active(&self) -> bool {
        self.countdown.is_some()
    }

    /// Is the last-participant departure delay running.
    pub fn departure_scheduled(&self) -> bool {
        self.departure.is_some()
    }

    /// Codec sized for this room.
    pub fn codec(&self) -> WireCodec {
        self.codec
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Pending request for the owner to leave the room.
    pub fn take_leave_request(&mut self) -> Option<LeaveKind> {
        self.leave_request.take()
    }

    /// Give up the live counters, e.g. to hand them to a successor.
    /// Afterwards this coordinator no longer acts as holder.
    pub fn take_authority(&mut self) -> Option<AuthorityState> {
        self.ready_up = None;
        self.authority.take()
    }

    // =========================================================================
    // Local operations
    // =========================================================================

    /// Change the local ready flag.
    ///
    /// Repeating the current value is a silent no-op. Returns true if the
    /// flag changed and a ready update was sent to the authority holder.
    pub fn set_local_ready(&mut self, ready: bool, net: &mut dyn Transport) -> bool {
        if ready == self.local_ready {
            return false;
        }

        let accepting = match self.phase {
            SessionPhase::Lobby => true,
            SessionPhase::Setup => self.ready_prompt_open,
            SessionPhase::Racing | SessionPhase::Finished => false,
        };
        if !accepting {
            debug!("ready change to {} ignored during {}", ready, self.phase);
            return false;
        }

        self.apply_local_ready(ready);
        self.send(SessionMessage::ReadyUpdate { ready }, net);
        true
    }

    /// Gameplay reports that `who` crossed the finish line.
    ///
    /// Only meaningful on the authority holder during `Racing`. Returns true
    /// if the finish was recorded.
    pub fn on_racer_finished(&mut self, who: ActorId, elapsed: Duration, net: &mut dyn Transport) -> bool {
        if self.phase != SessionPhase::Racing {
            debug!("finish of {} ignored during {}", who, self.phase);
            return false;
        }
        if !self.can_mutate("racer finished") {
            return false;
        }

        let Some(player) = self.roster.get(who) else {
            warn!("finish reported for unknown participant {}", who);
            return false;
        };
        let nickname = player.nickname.clone();
        let Some(&position) = self.race_positions.get(&who) else {
            warn!("finish reported for {} who was not on the grid", who);
            return false;
        };

        let Some(authority) = self.authority.as_mut() else {
            return false;
        };
        let record = match authority.mark_finished(position) {
            Ok(record) => record,
            Err(e) => {
                warn!("finish of {} dropped: {}", who, e);
                return false;
            }
        };
        let race_over = authority.race_finished();

        info!(
            "{} ({}) finished in slot {} after {:.3}s{}",
            nickname,
            who,
            record.slot,
            elapsed.as_secs_f64(),
            if record.is_first { ", winner" } else { "" }
        );

        if race_over {
            self.send(SessionMessage::RaceEnded, net);
        } else {
            self.send(SessionMessage::racer_finished(who, nickname, elapsed, record.is_first), net);
        }
        true
    }

    /// Leave the finished race and return to the lobby.
    ///
    /// Discards the race's counters; a holder starts over with fresh ones
    /// and reopens the room.
    pub fn return_to_lobby(&mut self, net: &mut dyn Transport) -> Result<(), InvalidTransition> {
        if self.phase != SessionPhase::Finished {
            return Err(InvalidTransition { from: self.phase, to: SessionPhase::Lobby });
        }

        self.set_phase(SessionPhase::Lobby);
        self.discard_race_state();
        self.set_room_open(true, net);
        Ok(())
    }

    // =========================================================================
    // Scheduler
    // =========================================================================

    /// Run one scheduler pass: departure delay, countdown, ready-up window.
    pub fn tick(&mut self, net: &mut dyn Transport) {
        if let Some(departure) = self.departure.as_mut() {
            if departure.advance(true, false).is_finished() {
                self.departure = None;
                info!("last participant delay elapsed, leaving room");
                self.request_leave(LeaveKind::Forced);
            }
            return;
        }

        if let Some(countdown) = self.countdown.as_mut() {
            match countdown.advance(self.roster.len()) {
                CountdownStep::Pending => {}
                CountdownStep::Second { remaining } => {
                    self.events.publish(SessionEvent::CountdownTick { seconds_remaining: remaining });
                }
                CountdownStep::Completed => {
                    self.countdown = None;
                    self.complete_countdown(net);
                }
                CountdownStep::Aborted => {
                    self.countdown = None;
                    info!("countdown aborted: membership changed");
                    self.events.publish(SessionEvent::CountdownAborted);
                }
            }
        }

        self.tick_ready_up(net);
    }

    fn tick_ready_up(&mut self, net: &mut dyn Transport) {
        let Some(window) = self.ready_up.as_mut() else {
            return;
        };

        let stable = self.roster.len() == window.starting_count;
        let satisfied = self.authority.as_ref().is_some_and(AuthorityState::all_ready);
        let attempt = window.attempt;

        match window.wait.advance(stable, satisfied) {
            WaitStep::Running { .. } => {}
            WaitStep::Satisfied => {
                self.ready_up = None;
                self.events.publish(SessionEvent::ReadyUpResult { success: true, attempt });
            }
            WaitStep::Elapsed | WaitStep::Cancelled => {
                self.ready_up = None;
                self.ready_up_failed(attempt, net);
            }
        }
    }

    fn complete_countdown(&mut self, net: &mut dyn Transport) {
        self.events.publish(SessionEvent::CountdownCompleted { phase: self.phase });

        match self.phase {
            SessionPhase::Lobby => {
                self.set_phase(SessionPhase::Setup);
                self.set_room_open(false, net);
                self.events.publish(SessionEvent::SceneLoadRequested);
                self.enter_setup(net);
            }
            SessionPhase::Setup => {
                self.ready_prompt_open = false;
                self.race_positions = self.roster.iter().map(|p| (p.id, p.position)).collect();
                self.set_phase(SessionPhase::Racing);
                self.events.publish(SessionEvent::RaceStarted);
            }
            SessionPhase::Racing | SessionPhase::Finished => {
                debug!("countdown completed during {}, nothing to do", self.phase);
            }
        }
    }

    fn enter_setup(&mut self, net: &mut dyn Transport) {
        self.clear_local_ready();
        self.ready_prompt_open = false;
        if let Some(authority) = self.authority.as_mut() {
            authority.reset_ready();
        }
        self.scene_loaded(net);
    }

    /// Report local race-scene entry to the authority holder.
    fn scene_loaded(&mut self, net: &mut dyn Transport) {
        self.send(SessionMessage::UpdatePlayersInScene { joined: true }, net);
    }

    fn ready_up_failed(&mut self, attempt: ReadyUpAttempt, net: &mut dyn Transport) {
        self.events.publish(SessionEvent::ReadyUpResult { success: false, attempt });

        match attempt {
            ReadyUpAttempt::Initial => {
                warn!("ready-up window failed, retrying with reset counters");
                if let Some(authority) = self.authority.as_mut() {
                    authority.reset_ready();
                }
                self.begin_ready_up(ReadyUpAttempt::Reset, net);
            }
            ReadyUpAttempt::Reset => {
                error!("ready-up reset failed, evacuating room");
                self.send(SessionMessage::ForceLeaveRoom, net);
                self.request_leave(LeaveKind::Forced);
            }
        }
    }

    fn begin_ready_up(&mut self, attempt: ReadyUpAttempt, net: &mut dyn Transport) {
        self.send(SessionMessage::ShowReadyUpInfo, net);
        self.ready_up = Some(ReadyUpWindow {
            wait: TimedWait::new(self.config.ticks_for(self.config.ready_up_timeout())),
            attempt,
            starting_count: self.roster.len(),
        });
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Apply one transport event.
    pub fn handle_network_event(&mut self, event: NetworkEvent, net: &mut dyn Transport) {
        match event {
            NetworkEvent::PlayerJoined { actor, nickname } => self.on_player_joined(actor, nickname),
            NetworkEvent::PlayerLeft { actor } => self.on_player_left(actor, net),
            NetworkEvent::MasterClientSwitched { master } => self.on_authority_holder_changed(master),
            NetworkEvent::Message { sender, payload } => self.dispatch(sender, &payload, net),
            NetworkEvent::Disconnected { reason } => {
                warn!("transport disconnected: {}", reason);
                self.request_leave(LeaveKind::Forced);
            }
        }
    }

    #[instrument(skip_all, fields(local = %self.local, sender = %sender))]
    fn dispatch(&mut self, sender: ActorId, payload: &[u8], net: &mut dyn Transport) {
        let message = match SessionMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("undecodable message ({} bytes): {}", payload.len(), e);
                return;
            }
        };

        let kind = message.kind();
        if kind.requires_authority() && sender != self.master {
            warn!("{} from non-holder dropped", kind);
            return;
        }
        debug!("dispatch {} during {}", kind, self.phase);

        match message {
            SessionMessage::ReadyUpdate { ready } => self.on_ready_update(sender, ready, net),
            SessionMessage::StartCountdown => self.on_countdown_requested(),
            SessionMessage::UpdatePlayersInScene { joined } => self.on_players_in_scene(sender, joined, net),
            SessionMessage::ShowReadyUpInfo => self.on_show_ready_up(),
            SessionMessage::RacerFinishedInfo { finisher, name, elapsed_ms, is_winner } => {
                self.on_racer_finished_info(finisher, name, Duration::from_millis(elapsed_ms), is_winner)
            }
            SessionMessage::RaceEnded => self.on_race_ended(),
            SessionMessage::AuthoritySnapshotTransfer { successor, snapshot } => {
                self.on_snapshot(sender, successor, &snapshot, net)
            }
            SessionMessage::ForceLeaveRoom => {
                warn!("forced to leave by {}", sender);
                self.request_leave(LeaveKind::Forced);
            }
        }
    }

    fn on_player_joined(&mut self, actor: ActorId, nickname: String) {
        if !self.roster.insert(actor, nickname.clone(), false) {
            debug!("duplicate join for {}", actor);
            return;
        }
        if self.phase != SessionPhase::Lobby {
            debug!("{} joined during {}", actor, self.phase);
        }
        info!("{} ({}) joined, {} in room", nickname, actor, self.roster.len());
        self.events.publish(SessionEvent::PlayerJoined { actor, nickname });
    }

    /// Membership loss: renumber, fix counters, maybe reset or wind down.
    fn on_player_left(&mut self, actor: ActorId, net: &mut dyn Transport) {
        let Some(departed) = self.roster.remove(actor) else {
            debug!("departure of unknown {}", actor);
            return;
        };
        info!("{} ({}) left, {} in room", departed.nickname, actor, self.roster.len());
        self.events.publish(SessionEvent::PlayerLeft { actor, nickname: departed.nickname });

        if self.departure.is_some() {
            return;
        }

        let holder = self.is_authority_holder();
        if holder {
            let in_scene = self.phase.in_race_scene() && self.on_grid(actor);
            if let Some(authority) = self.authority.as_mut() {
                if in_scene {
                    if let Err(e) = authority.decrement_in_scene() {
                        warn!("in-scene count not adjusted for {}: {}", actor, e);
                    }
                }
                authority.reset_ready();
            }
        }

        let racing_scene = matches!(self.phase, SessionPhase::Racing | SessionPhase::Finished);
        let alone = self.authority.as_ref().is_some_and(|a| a.players_in_scene() <= 1);
        if holder && racing_scene && alone {
            let delay = self.config.last_player_departure();
            info!("alone in the race scene, leaving in {:?}", delay);
            self.countdown = None;
            self.ready_up = None;
            self.departure = Some(TimedWait::new(self.config.ticks_for(delay)));
            self.events.publish(SessionEvent::ForcedLeaveScheduled { delay });
            return;
        }

        if self.phase.is_resettable() {
            self.reset_scene(net);
        } else if holder && self.phase == SessionPhase::Racing {
            let race_over = self
                .authority
                .as_ref()
                .is_some_and(|a| a.players_in_scene() > 0 && a.race_finished());
            if race_over {
                info!("remaining racers have all finished");
                self.send(SessionMessage::RaceEnded, net);
            }
        }
    }

    fn reset_scene(&mut self, net: &mut dyn Transport) {
        if self.phase == SessionPhase::Setup {
            self.set_phase(SessionPhase::Lobby);
            self.discard_race_state();
            self.set_room_open(true, net);
        } else {
            self.clear_local_ready();
            self.roster.clear_ready();
        }
        self.events.publish(SessionEvent::SceneReset);
    }

    /// Presentation refresh only; the counters move by handoff, not here.
    fn on_authority_holder_changed(&mut self, master: ActorId) {
        let previous = self.master;
        self.master = master;
        let is_local = master == self.local;
        info!("authority {} -> {}", previous, master);

        if is_local && self.authority.is_none() {
            // Holder vanished without a handoff. Rebuild what can be
            // observed locally: everyone still listed from the grid is in
            // the scene.
            warn!("became authority holder without a snapshot, rebuilding counters");
            let mut state = AuthorityState::new(self.config.max_players);
            if self.phase.in_race_scene() {
                let on_grid = self.roster.actors().filter(|a| self.on_grid(*a)).count();
                for _ in 0..on_grid {
                    if state.increment_in_scene().is_err() {
                        break;
                    }
                }
            }
            self.authority = Some(state);
        } else if !is_local && self.authority.is_some() {
            warn!("authority moved to {}, discarding local counters", master);
            self.authority = None;
            self.ready_up = None;
        }

        self.events.publish(SessionEvent::AuthorityChanged { holder: master, is_local });
    }

    fn on_ready_update(&mut self, sender: ActorId, ready: bool, net: &mut dyn Transport) {
        if !self.can_mutate("ready update") {
            return;
        }
        let accepted = match self.phase {
            SessionPhase::Lobby => true,
            SessionPhase::Setup => self.authority.as_ref().is_some_and(AuthorityState::all_in_scene),
            SessionPhase::Racing | SessionPhase::Finished => false,
        };
        if !accepted {
            debug!("ready update from {} ignored during {}", sender, self.phase);
            return;
        }

        let Some(authority) = self.authority.as_mut() else {
            return;
        };
        let result = if ready { authority.increment_ready() } else { authority.decrement_ready() };
        let all_ready = authority.all_ready();
        let count = authority.players_ready();

        match result {
            Ok(_) => {
                if let Some(player) = self.roster.get_mut(sender) {
                    player.ready = ready;
                }
                debug!("{} ready={} ({}/{})", sender, ready, count, self.config.max_players);
            }
            Err(e) => {
                warn!("ready update from {} dropped: {}", sender, e);
                return;
            }
        }

        if all_ready && ready && self.countdown.is_none() {
            info!("all {} participants ready, starting countdown", count);
            self.send(SessionMessage::StartCountdown, net);
        }
    }

    /// Every participant runs the same membership-gated countdown.
    fn on_countdown_requested(&mut self) {
        if !self.phase.is_resettable() {
            debug!("countdown request ignored during {}", self.phase);
            return;
        }
        if self.countdown.is_some() {
            debug!("countdown already running");
            return;
        }

        let ticks = self.config.ticks_for(self.config.countdown());
        let countdown = Countdown::new(ticks, self.config.tick_rate, self.roster.len());
        info!("countdown started with {} participants", countdown.starting_count());
        self.events.publish(SessionEvent::CountdownTick { seconds_remaining: countdown.seconds_remaining() });
        self.countdown = Some(countdown);
    }

    fn on_players_in_scene(&mut self, sender: ActorId, joined: bool, net: &mut dyn Transport) {
        if !self.can_mutate("scene update") {
            return;
        }
        // Participants may finish the countdown before the holder does.
        let accepted = match self.phase {
            SessionPhase::Setup => true,
            SessionPhase::Lobby => self.countdown.is_some(),
            SessionPhase::Racing | SessionPhase::Finished => false,
        };
        if !accepted {
            debug!("scene update from {} ignored during {}", sender, self.phase);
            return;
        }

        let Some(authority) = self.authority.as_mut() else {
            return;
        };
        let result = if joined { authority.increment_in_scene() } else { authority.decrement_in_scene() };
        if let Err(e) = result {
            warn!("scene update from {} dropped: {}", sender, e);
            return;
        }

        debug!("{} in scene: {} ({}/{})", sender, joined, authority.players_in_scene(), self.config.max_players);
        if joined && authority.all_in_scene() {
            self.on_all_players_in_scene(net);
        }
    }

    fn on_all_players_in_scene(&mut self, net: &mut dyn Transport) {
        info!("all participants in the race scene, opening ready-up");
        if let Some(authority) = self.authority.as_mut() {
            authority.reset_ready();
        }
        self.begin_ready_up(ReadyUpAttempt::Initial, net);
    }

    fn on_show_ready_up(&mut self) {
        if self.phase != SessionPhase::Setup {
            debug!("ready-up prompt ignored during {}", self.phase);
            return;
        }
        self.clear_local_ready();
        self.roster.clear_ready();
        self.ready_prompt_open = true;
        self.events.publish(SessionEvent::ReadyUpRequested);
    }

    fn on_racer_finished_info(&mut self, finisher: ActorId, name: String, elapsed: Duration, is_winner: bool) {
        if self.phase != SessionPhase::Racing || finisher == self.local {
            return;
        }
        self.events.publish(SessionEvent::RacerFinished {
            actor: finisher,
            nickname: name,
            elapsed,
            is_winner,
        });
    }

    fn on_race_ended(&mut self) {
        if self.phase != SessionPhase::Racing {
            debug!("race end ignored during {}", self.phase);
            return;
        }
        self.set_phase(SessionPhase::Finished);
        self.events.publish(SessionEvent::RaceEnded);
    }

    fn on_snapshot(&mut self, sender: ActorId, successor: ActorId, snapshot: &CustomPayload, net: &mut dyn Transport) {
        if successor != self.local {
            debug!("snapshot for {} ignored", successor);
            return;
        }

        if let Err(e) = net.custom_types().validate(snapshot) {
            error!("authority snapshot from {} rejected: {}", sender, e);
            return;
        }
        let state = match self.codec.from_payload(snapshot) {
            Ok(state) => state,
            Err(e) => {
                error!("authority snapshot from {} rejected: {}", sender, e);
                return;
            }
        };

        info!(
            "installed authority snapshot from {}: ready={} in_scene={} finished={} [{}]",
            sender,
            state.players_ready(),
            state.players_in_scene(),
            state.finished_count(),
            hex::encode(&snapshot.bytes)
        );
        self.authority = Some(state);
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn can_mutate(&self, what: &str) -> bool {
        if !self.is_authority_holder() {
            warn!("{} dropped: {} does not hold authority", what, self.local);
            return false;
        }
        if self.departure.is_some() {
            debug!("{} dropped: leaving the room", what);
            return false;
        }
        true
    }

    /// Was `actor` part of the race scene. Before the race starts the room
    /// is closed, so everyone listed counts.
    fn on_grid(&self, actor: ActorId) -> bool {
        self.race_positions.is_empty() || self.race_positions.contains_key(&actor)
    }

    /// Only the holder opens and closes the room; newcomers are admitted in
    /// the lobby alone.
    fn set_room_open(&self, open: bool, net: &mut dyn Transport) {
        if !self.is_authority_holder() {
            return;
        }
        match net.set_room_open(open) {
            Ok(()) => debug!("room {}", if open { "reopened" } else { "closed" }),
            Err(e) => warn!("failed to {} room: {}", if open { "reopen" } else { "close" }, e),
        }
    }

    fn apply_local_ready(&mut self, ready: bool) {
        self.local_ready = ready;
        if let Some(player) = self.roster.get_mut(self.local) {
            player.ready = ready;
        }
        self.events.publish(SessionEvent::LocalReadyChanged { ready });
    }

    fn clear_local_ready(&mut self) {
        if self.local_ready {
            self.apply_local_ready(false);
        }
    }

    fn discard_race_state(&mut self) {
        self.clear_local_ready();
        self.roster.clear_ready();
        self.ready_prompt_open = false;
        self.ready_up = None;
        self.race_positions.clear();
        if self.authority.is_some() {
            self.authority = Some(AuthorityState::new(self.config.max_players));
        }
    }

    fn set_phase(&mut self, to: SessionPhase) {
        match self.phase.transition(to) {
            Ok(from) => {
                info!("phase {} -> {}", from, to);
                self.events.publish(SessionEvent::PhaseChanged { from, to });
            }
            Err(e) => warn!("{}", e),
        }
    }

    fn request_leave(&mut self, kind: LeaveKind) {
        if self.leave_request.is_none() {
            self.leave_request = Some(kind);
            self.events.publish(SessionEvent::LeaveRequested { kind });
        }
    }

    fn send(&self, message: SessionMessage, net: &mut dyn Transport) {
        let target = message.target();
        let kind = message.kind();
        let payload = match message.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode {}: {}", kind, e);
                return;
            }
        };
        if let Err(e) = net.send(target.clone(), payload) {
            warn!("failed to send {} to {:?}: {}", kind, target, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::codec::AUTHORITY_STATE_TYPE_TAG;
    use crate::network::loopback::{LoopbackEndpoint, LoopbackService};
    use crate::network::protocol::Target;
    use crate::network::transport::TransportError;

    struct Peer {
        net: LoopbackEndpoint,
        session: SessionCoordinator,
        events: broadcast::Receiver<SessionEvent>,
    }

    impl Peer {
        fn pump(&mut self) {
            while let Some(event) = self.net.poll() {
                self.session.handle_network_event(event, &mut self.net);
            }
            self.session.tick(&mut self.net);
            self.net.flush().unwrap();
        }

        fn drain(&mut self) -> Vec<SessionEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    fn test_config(max_players: u8) -> SessionConfig {
        SessionConfig {
            max_players,
            countdown_ms: 1_000,
            ready_up_timeout_ms: 5_000,
            last_player_departure_ms: 500,
            tick_rate: 10,
            ..Default::default()
        }
    }

    fn room(n: u8, config: &SessionConfig) -> (LoopbackService, Vec<Peer>) {
        let service = LoopbackService::new();
        let mut peers = Vec::new();
        for i in 0..n {
            let mut net = service.endpoint();
            net.connect().unwrap();
            WireCodec::new(config.max_players).register(net.custom_types());
            let join = net.join_or_create_room(&format!("racer{}", i + 1), config.max_players).unwrap();
            let session = SessionCoordinator::new(config.clone(), &join);
            let events = session.subscribe();
            peers.push(Peer { net, session, events });
        }
        pump_all(&mut peers, 1);
        for peer in peers.iter_mut() {
            peer.drain();
        }
        (service, peers)
    }

    fn pump_all(peers: &mut [Peer], passes: usize) {
        for _ in 0..passes {
            for peer in peers.iter_mut() {
                peer.pump();
            }
        }
    }

    fn ready_all(peers: &mut [Peer]) {
        for peer in peers.iter_mut() {
            let Peer { net, session, .. } = peer;
            session.set_local_ready(true, net);
        }
    }

    /// Drive a full room from the lobby into `Racing`.
    fn race_started(n: u8) -> (LoopbackService, Vec<Peer>) {
        let config = test_config(n);
        let (service, mut peers) = room(n, &config);
        ready_all(&mut peers);
        pump_all(&mut peers, 15);
        assert!(peers.iter().all(|p| p.session.phase() == SessionPhase::Setup));

        ready_all(&mut peers);
        pump_all(&mut peers, 15);
        assert!(peers.iter().all(|p| p.session.phase() == SessionPhase::Racing));
        for peer in peers.iter_mut() {
            peer.drain();
        }
        (service, peers)
    }

    #[test]
    fn test_creator_holds_authority() {
        let (_service, peers) = room(3, &test_config(3));
        assert!(peers[0].session.is_authority_holder());
        assert!(!peers[1].session.is_authority_holder());
        assert_eq!(peers[2].session.roster().len(), 3);
        assert_eq!(peers[2].session.roster().position_of(ActorId(3)), Some(3));
    }

    #[test]
    fn test_set_local_ready_is_idempotent() {
        let (_service, mut peers) = room(2, &test_config(2));
        let Peer { net, session, events } = &mut peers[1];

        assert!(session.set_local_ready(true, net));
        assert!(!session.set_local_ready(true, net));
        assert_eq!(net.pending_outgoing(), 1);

        let mut changes = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::LocalReadyChanged { .. }) {
                changes += 1;
            }
        }
        assert_eq!(changes, 1);
    }

    #[test]
    fn test_holder_counts_ready_updates() {
        let (_service, mut peers) = room(3, &test_config(3));
        {
            let Peer { net, session, .. } = &mut peers[1];
            session.set_local_ready(true, net);
        }
        pump_all(&mut peers, 2);
        assert_eq!(peers[0].session.authority().unwrap().players_ready(), 1);

        {
            let Peer { net, session, .. } = &mut peers[1];
            session.set_local_ready(false, net);
        }
        pump_all(&mut peers, 2);
        assert_eq!(peers[0].session.authority().unwrap().players_ready(), 0);
        assert!(!peers[0].session.countdown_active());
    }

    #[test]
    fn test_all_ready_starts_countdown_everywhere() {
        let (service, mut peers) = room(3, &test_config(3));
        ready_all(&mut peers);
        pump_all(&mut peers, 3);
        assert!(peers.iter().all(|p| p.session.countdown_active()));
        assert_eq!(service.room().map(|r| r.is_open), Some(true));

        pump_all(&mut peers, 10);
        assert_eq!(service.room().map(|r| r.is_open), Some(false));
        for peer in peers.iter_mut() {
            assert_eq!(peer.session.phase(), SessionPhase::Setup);
            let events = peer.drain();
            assert!(events.contains(&SessionEvent::SceneLoadRequested));
            assert!(!peer.session.local_ready());
        }
    }

    #[test]
    fn test_non_holder_drops_ready_update() {
        let (_service, mut peers) = room(2, &test_config(2));
        let payload = SessionMessage::ReadyUpdate { ready: true }.to_bytes().unwrap();
        let Peer { net, session, .. } = &mut peers[1];
        session.handle_network_event(NetworkEvent::Message { sender: ActorId(1), payload }, net);
        assert!(session.authority().is_none());
        assert_eq!(net.pending_outgoing(), 0);
    }

    #[test]
    fn test_countdown_aborts_when_participant_leaves() {
        let (_service, mut peers) = room(4, &test_config(4));
        ready_all(&mut peers);
        pump_all(&mut peers, 3);
        assert!(peers[0].session.countdown_active());

        let mut leaver = peers.pop().unwrap();
        leaver.net.leave_room().unwrap();
        pump_all(&mut peers, 15);

        for peer in peers.iter_mut() {
            let events = peer.drain();
            assert!(events.contains(&SessionEvent::CountdownAborted));
            assert!(!events.iter().any(|e| matches!(e, SessionEvent::CountdownCompleted { .. })));
            assert!(!events.contains(&SessionEvent::SceneLoadRequested));
            assert_eq!(peer.session.phase(), SessionPhase::Lobby);
            assert!(!peer.session.local_ready());
        }
        assert_eq!(peers[0].session.authority().unwrap().players_ready(), 0);
    }

    #[test]
    fn test_setup_reaches_ready_up_and_race() {
        let config = test_config(2);
        let (_service, mut peers) = room(2, &config);
        ready_all(&mut peers);
        pump_all(&mut peers, 15);

        let holder = peers[0].session.authority().unwrap();
        assert_eq!(holder.players_in_scene(), 2);
        assert!(peers.iter_mut().all(|p| p.drain().contains(&SessionEvent::ReadyUpRequested)));

        ready_all(&mut peers);
        pump_all(&mut peers, 15);
        for peer in peers.iter_mut() {
            assert_eq!(peer.session.phase(), SessionPhase::Racing);
            assert!(peer.drain().contains(&SessionEvent::RaceStarted));
        }
    }

    #[test]
    fn test_ready_before_prompt_rejected_in_setup() {
        let (_service, mut peers) = room(2, &test_config(2));
        ready_all(&mut peers);
        // Countdown completes on every peer in the same pass; the prompt
        // arrives on later passes.
        pump_all(&mut peers, 11);
        let Peer { net, session, .. } = &mut peers[1];
        assert_eq!(session.phase(), SessionPhase::Setup);
        assert!(!session.set_local_ready(true, net));
    }

    #[test]
    fn test_finish_flow() {
        let (_service, mut peers) = race_started(3);

        {
            let Peer { net, session, .. } = &mut peers[0];
            assert!(session.on_racer_finished(ActorId(2), Duration::from_millis(61_000), net));
            assert!(!session.on_racer_finished(ActorId(2), Duration::from_millis(62_000), net));
        }
        pump_all(&mut peers, 1);

        let seen_by_third = peers[2].drain();
        assert!(seen_by_third.iter().any(|e| matches!(
            e,
            SessionEvent::RacerFinished { actor: ActorId(2), is_winner: true, .. }
        )));
        assert!(!peers[1].drain().iter().any(|e| matches!(e, SessionEvent::RacerFinished { .. })));

        {
            let Peer { net, session, .. } = &mut peers[0];
            session.on_racer_finished(ActorId(1), Duration::from_millis(63_000), net);
            session.on_racer_finished(ActorId(3), Duration::from_millis(64_000), net);
        }
        pump_all(&mut peers, 2);
        for peer in peers.iter_mut() {
            assert_eq!(peer.session.phase(), SessionPhase::Finished);
            assert!(peer.drain().contains(&SessionEvent::RaceEnded));
        }
        assert_eq!(peers[0].session.authority().unwrap().finish_slots(), &[2, 1, 3]);
    }

    #[test]
    fn test_finish_ignored_outside_racing() {
        let (_service, mut peers) = room(2, &test_config(2));
        let Peer { net, session, .. } = &mut peers[0];
        assert!(!session.on_racer_finished(ActorId(2), Duration::from_secs(1), net));
        assert_eq!(session.authority().unwrap().finished_count(), 0);
        assert_eq!(net.pending_outgoing(), 0);
    }

    #[test]
    fn test_return_to_lobby_discards_counters() {
        let (service, mut peers) = race_started(2);
        {
            let Peer { net, session, .. } = &mut peers[0];
            assert!(session.return_to_lobby(net).is_err());
            session.on_racer_finished(ActorId(1), Duration::from_secs(50), net);
            session.on_racer_finished(ActorId(2), Duration::from_secs(51), net);
        }
        pump_all(&mut peers, 2);
        assert_eq!(service.room().map(|r| r.is_open), Some(false));

        let Peer { net, session, .. } = &mut peers[0];
        assert_eq!(session.phase(), SessionPhase::Finished);
        session.return_to_lobby(net).unwrap();
        assert_eq!(session.phase(), SessionPhase::Lobby);
        assert_eq!(session.authority(), Some(&AuthorityState::new(2)));
        assert_eq!(service.room().map(|r| r.is_open), Some(true));
    }

    #[test]
    fn test_finish_slots_survive_renumbering() {
        let (_service, mut peers) = race_started(4);
        {
            let Peer { net, session, .. } = &mut peers[0];
            assert!(session.on_racer_finished(ActorId(3), Duration::from_secs(40), net));
        }
        pump_all(&mut peers, 1);

        let mut leaver = peers.remove(1);
        leaver.net.leave_room().unwrap();
        pump_all(&mut peers, 1);

        let Peer { net, session, .. } = &mut peers[0];
        // Actor 4 now sits at room position 3, the slot actor 3 finished in.
        assert_eq!(session.roster().position_of(ActorId(4)), Some(3));
        assert!(session.on_racer_finished(ActorId(4), Duration::from_secs(41), net));
        assert!(!session.on_racer_finished(ActorId(3), Duration::from_secs(42), net));
        assert_eq!(session.authority().unwrap().finish_slots(), &[3, 4, 0, 0]);
    }

    #[test]
    fn test_late_joiner_cannot_mask_last_participant() {
        let (service, mut peers) = race_started(3);
        assert_eq!(service.room().map(|r| r.is_open), Some(false));

        let mut third = peers.pop().unwrap();
        third.net.leave_room().unwrap();
        pump_all(&mut peers, 1);

        let mut late = service.endpoint();
        late.connect().unwrap();
        assert_eq!(late.join_or_create_room("late", 3), Err(TransportError::RoomClosed));

        // Reopened behind the holder's back: the newcomer is listed but never
        // entered the race scene.
        service.set_room_open(true).unwrap();
        assert_eq!(late.join_or_create_room("late", 3).unwrap().local, ActorId(4));
        pump_all(&mut peers, 1);
        assert_eq!(peers[0].session.roster().len(), 3);

        let mut second = peers.pop().unwrap();
        second.net.leave_room().unwrap();
        pump_all(&mut peers, 1);

        let holder = &peers[0].session;
        assert_eq!(holder.phase(), SessionPhase::Racing);
        assert_eq!(holder.roster().len(), 2);
        assert_eq!(holder.authority().unwrap().players_in_scene(), 1);
        assert!(holder.departure_scheduled());
    }

    #[test]
    fn test_setup_departure_reopens_room() {
        let (service, mut peers) = room(3, &test_config(3));
        ready_all(&mut peers);
        pump_all(&mut peers, 15);
        assert!(peers.iter().all(|p| p.session.phase() == SessionPhase::Setup));
        assert_eq!(service.room().map(|r| r.is_open), Some(false));

        let mut leaver = peers.pop().unwrap();
        leaver.net.leave_room().unwrap();
        pump_all(&mut peers, 1);

        assert!(peers.iter().all(|p| p.session.phase() == SessionPhase::Lobby));
        assert_eq!(service.room().map(|r| r.is_open), Some(true));
    }

    #[test]
    fn test_handoff_carries_ready_count() {
        let (_service, mut peers) = room(3, &test_config(3));
        for peer in peers[1..].iter_mut() {
            let Peer { net, session, .. } = peer;
            session.set_local_ready(true, net);
        }
        pump_all(&mut peers, 2);
        assert_eq!(peers[0].session.authority().unwrap().players_ready(), 2);
        assert!(!peers[0].session.countdown_active());

        {
            let Peer { net, session, .. } = &mut peers[0];
            let state = session.take_authority().unwrap();
            assert!(session.authority().is_none());
            assert!(!session.is_authority_holder());

            let snapshot = session.codec().to_payload(&state).unwrap();
            let payload = SessionMessage::AuthoritySnapshotTransfer { successor: ActorId(2), snapshot }
                .to_bytes()
                .unwrap();
            net.send(Target::Actor(ActorId(2)), payload).unwrap();
            net.flush().unwrap();
            net.leave_room().unwrap();
        }

        let Peer { net, session, .. } = &mut peers[1];

        let event = net.poll().unwrap();
        assert!(matches!(event, NetworkEvent::Message { sender: ActorId(1), .. }));
        session.handle_network_event(event, net);
        assert_eq!(session.authority().unwrap().players_ready(), 2);

        let event = net.poll().unwrap();
        assert_eq!(event, NetworkEvent::MasterClientSwitched { master: ActorId(2) });
        session.handle_network_event(event, net);
        assert!(session.is_authority_holder());
        assert_eq!(session.authority().unwrap().players_ready(), 2);

        // The departure itself resets readiness in the lobby.
        let event = net.poll().unwrap();
        assert_eq!(event, NetworkEvent::PlayerLeft { actor: ActorId(1) });
        session.handle_network_event(event, net);
        assert_eq!(session.authority().unwrap().players_ready(), 0);
        assert_eq!(session.roster().len(), 2);
    }

    #[test]
    fn test_last_participant_forced_leave() {
        let (_service, mut peers) = race_started(2);
        let mut leaver = peers.pop().unwrap();
        leaver.net.leave_room().unwrap();

        pump_all(&mut peers, 1);
        let holder = &mut peers[0];
        assert!(holder.session.departure_scheduled());
        let in_scene = holder.session.authority().unwrap().players_in_scene();
        assert_eq!(in_scene, 1);

        // No counter mutation while the delay runs.
        {
            let Peer { net, session, .. } = &mut *holder;
            assert!(!session.on_racer_finished(ActorId(1), Duration::from_secs(9), net));
        }
        for _ in 0..3 {
            holder.pump();
            assert!(holder.session.take_leave_request().is_none());
        }
        holder.pump();
        assert_eq!(holder.session.take_leave_request(), Some(LeaveKind::Forced));
        assert_eq!(holder.session.authority().unwrap().finished_count(), 0);
        assert_eq!(holder.session.authority().unwrap().players_in_scene(), in_scene);
    }

    #[test]
    fn test_departure_during_race_can_end_it() {
        let (_service, mut peers) = race_started(3);
        {
            let Peer { net, session, .. } = &mut peers[0];
            session.on_racer_finished(ActorId(1), Duration::from_secs(40), net);
            session.on_racer_finished(ActorId(2), Duration::from_secs(41), net);
        }
        pump_all(&mut peers, 1);

        let mut leaver = peers.pop().unwrap();
        leaver.net.leave_room().unwrap();
        pump_all(&mut peers, 2);
        assert!(peers.iter().all(|p| p.session.phase() == SessionPhase::Finished));
    }

    #[test]
    fn test_snapshot_for_other_successor_ignored() {
        let (_service, mut peers) = room(3, &test_config(3));
        let codec = WireCodec::new(3);
        let snapshot = codec.to_payload(&AuthorityState::new(3)).unwrap();
        let payload = SessionMessage::AuthoritySnapshotTransfer { successor: ActorId(2), snapshot }
            .to_bytes()
            .unwrap();

        let Peer { net, session, .. } = &mut peers[2];
        session.handle_network_event(NetworkEvent::Message { sender: ActorId(1), payload }, net);
        assert!(session.authority().is_none());
    }

    #[test]
    fn test_corrupt_snapshot_dropped_whole() {
        let (_service, mut peers) = room(3, &test_config(3));
        let snapshot = CustomPayload { tag: AUTHORITY_STATE_TYPE_TAG, bytes: vec![1, 0, 0, 0, 2] };
        let payload = SessionMessage::AuthoritySnapshotTransfer { successor: ActorId(2), snapshot }
            .to_bytes()
            .unwrap();

        let Peer { net, session, .. } = &mut peers[1];
        session.handle_network_event(NetworkEvent::Message { sender: ActorId(1), payload }, net);
        assert!(session.authority().is_none());
    }

    #[test]
    fn test_snapshot_from_non_holder_dropped() {
        let (_service, mut peers) = room(3, &test_config(3));
        let snapshot = WireCodec::new(3).to_payload(&AuthorityState::new(3)).unwrap();
        let payload = SessionMessage::AuthoritySnapshotTransfer { successor: ActorId(2), snapshot }
            .to_bytes()
            .unwrap();

        let Peer { net, session, .. } = &mut peers[1];
        session.handle_network_event(NetworkEvent::Message { sender: ActorId(3), payload }, net);
        assert!(session.authority().is_none());
    }

    #[test]
    fn test_authority_rebuilt_after_crash() {
        let (_service, mut peers) = race_started(3);
        let mut crashed = peers.remove(0);
        crashed.net.drop_connection().unwrap();
        pump_all(&mut peers, 1);

        let new_holder = &peers[0].session;
        assert_eq!(new_holder.master(), ActorId(2));
        assert!(new_holder.is_authority_holder());
        // Rebuilt with three in scene, then the crash was accounted for.
        assert_eq!(new_holder.authority().unwrap().players_in_scene(), 2);
        assert!(!peers[1].session.is_authority_holder());
    }

    #[test]
    fn test_force_leave_message_requests_leave() {
        let (_service, mut peers) = room(2, &test_config(2));
        {
            let Peer { net, .. } = &mut peers[0];
            net.send(Target::Others, SessionMessage::ForceLeaveRoom.to_bytes().unwrap()).unwrap();
        }
        pump_all(&mut peers, 1);
        assert_eq!(peers[1].session.take_leave_request(), Some(LeaveKind::Forced));
    }
}
