//! Matchmaking and Leave Handling
//!
//! Owns the transport for one participant: connects, registers the
//! authority payload type, joins or creates a room, installs the session
//! coordinator and drives it. Leaving gracefully hands the authority state
//! to the successor first; a forced leave skips the handoff.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::core::ids::{successor_of, ActorId};
use crate::game::events::{LeaveKind, SessionEvent};
use crate::game::phase::InvalidTransition;
use crate::network::codec::{CodecError, Registration, WireCodec};
use crate::network::protocol::{ProtocolError, SessionMessage, Target};
use crate::network::session::SessionCoordinator;
use crate::network::transport::{RoomJoin, Transport, TransportError};

/// Matchmaking errors.
#[derive(Debug, Error)]
pub enum MatchError {
    /// Transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Authority snapshot could not be encoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Session message could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Phase change not allowed.
    #[error("Phase error: {0}")]
    Phase(#[from] InvalidTransition),

    /// Operation needs a joined room.
    #[error("Not in a room")]
    NotInRoom,

    /// No participant left to receive the authority state.
    #[error("No successor for {0}")]
    SuccessorGone(ActorId),
}

/// One participant's matchmaking front end.
pub struct MatchController<T: Transport> {
    config: SessionConfig,
    transport: T,
    codec: WireCodec,
    registered: bool,
    session: Option<SessionCoordinator>,
}

impl<T: Transport> MatchController<T> {
    /// Create a controller over `transport`.
    pub fn new(config: SessionConfig, transport: T) -> Self {
        Self {
            codec: WireCodec::new(config.max_players),
            config,
            transport,
            registered: false,
            session: None,
        }
    }

    /// Connect and register the authority payload type.
    pub fn connect(&mut self) -> Result<(), MatchError> {
        if !self.transport.is_connected() {
            self.transport.connect()?;
            info!("Connected to matchmaking service");
        }

        if !self.registered {
            match self.codec.register(self.transport.custom_types()) {
                Registration::Registered => debug!("Authority payload type registered"),
                Registration::Conflict(existing) => {
                    warn!("Authority payload tag already taken by {}", existing.type_name)
                }
            }
            self.registered = true;
        }
        Ok(())
    }

    /// Nickname built from the configured prefix.
    pub fn generate_nickname(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.config.nickname_prefix, &id[..6])
    }

    /// Join any open room or create one, then install the coordinator.
    #[instrument(skip(self))]
    pub fn join(&mut self, nickname: &str) -> Result<RoomJoin, MatchError> {
        if self.session.is_some() {
            return Err(TransportError::AlreadyInRoom.into());
        }
        self.connect()?;

        let join = self.transport.join_or_create_room(nickname, self.config.max_players)?;
        if join.created {
            info!("Created room {} as {}", join.room.name, join.local);
        } else {
            info!("Joined room {} as {}", join.room.name, join.local);
        }
        if join.room.max_players != self.config.max_players {
            warn!(
                "Room cap {} differs from configured cap {}",
                join.room.max_players, self.config.max_players
            );
        }

        self.session = Some(SessionCoordinator::new(self.config.clone(), &join));
        Ok(join)
    }

    /// Coordinator for the joined room.
    pub fn session(&self) -> Option<&SessionCoordinator> {
        self.session.as_ref()
    }

    /// Is a room joined.
    pub fn in_room(&self) -> bool {
        self.session.is_some()
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Subscribe to the coordinator's events.
    pub fn subscribe_events(&self) -> Option<broadcast::Receiver<SessionEvent>> {
        self.session.as_ref().map(SessionCoordinator::subscribe)
    }

    /// Change the local ready flag.
    pub fn set_local_ready(&mut self, ready: bool) -> bool {
        match self.session.as_mut() {
            Some(session) => session.set_local_ready(ready, &mut self.transport),
            None => false,
        }
    }

    /// Report a finish on the authority holder.
    pub fn report_finish(&mut self, who: ActorId, elapsed: Duration) -> bool {
        match self.session.as_mut() {
            Some(session) => session.on_racer_finished(who, elapsed, &mut self.transport),
            None => false,
        }
    }

    /// Back to the lobby after the results.
    pub fn return_to_lobby(&mut self) -> Result<(), MatchError> {
        let session = self.session.as_mut().ok_or(MatchError::NotInRoom)?;
        session.return_to_lobby(&mut self.transport)?;
        Ok(())
    }

    /// One scheduler pass: inbound events, waits, outbound flush.
    ///
    /// Returns the kind of leave performed if the coordinator asked for one.
    pub fn pump(&mut self) -> Result<Option<LeaveKind>, MatchError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };

        while let Some(event) = self.transport.poll() {
            session.handle_network_event(event, &mut self.transport);
        }
        session.tick(&mut self.transport);
        self.transport.flush()?;

        match session.take_leave_request() {
            Some(kind) => {
                self.leave_with(kind)?;
                Ok(Some(kind))
            }
            None => Ok(None),
        }
    }

    /// Leave gracefully, handing authority to the successor first.
    pub fn leave(&mut self) -> Result<(), MatchError> {
        self.leave_with(LeaveKind::Graceful)
    }

    /// Leave without a handoff.
    pub fn force_leave(&mut self) -> Result<(), MatchError> {
        self.leave_with(LeaveKind::Forced)
    }

    #[instrument(skip(self))]
    fn leave_with(&mut self, kind: LeaveKind) -> Result<(), MatchError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        if kind == LeaveKind::Graceful {
            if let Err(e) = self.hand_off(&mut session) {
                warn!("Authority handoff failed, leaving anyway: {}", e);
            }
        }

        match self.transport.leave_room() {
            Ok(()) | Err(TransportError::NotInRoom) => {}
            Err(e) => return Err(e.into()),
        }
        info!("{} left the room during {}", session.local(), session.phase());
        Ok(())
    }

    /// Ship the authority state to the successor and flush before leaving,
    /// since unflushed messages are lost on leave.
    fn hand_off(&mut self, session: &mut SessionCoordinator) -> Result<(), MatchError> {
        let players = self.transport.players();
        if players.len() <= 1 || !session.is_authority_holder() {
            return Ok(());
        }

        let local = session.local();
        let successor = successor_of(local, players).ok_or(MatchError::SuccessorGone(local))?;

        let Some(state) = session.authority() else {
            return Ok(());
        };
        let snapshot = self.codec.to_payload(state)?;
        let message = SessionMessage::AuthoritySnapshotTransfer { successor, snapshot };
        let payload = message.to_bytes()?;

        self.transport.send(Target::Actor(successor), payload)?;
        self.transport.flush()?;
        session.take_authority();

        info!("Authority handed from {} to {}", local, successor);
        Ok(())
    }
}

impl<T: Transport> Drop for MatchController<T> {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.leave() {
                warn!("Leave on drop failed: {}", e);
            }
        }
    }
}
