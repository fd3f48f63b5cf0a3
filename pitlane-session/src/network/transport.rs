//! Transport Contract
//!
//! The networking layer the session core runs on. It owns message
//! delivery, room membership, actor numbering and master-client election;
//! the core only consumes what it reports.
//!
//! Contract:
//! - Actor numbers are assigned in join order and never reused in a room.
//! - `send` queues; `flush` pushes everything queued onto the wire in
//!   order. Anything still queued when the room is left may be lost.
//! - When the master client departs, the new master is the next-higher
//!   actor number after it, wrapping to the lowest. Remaining participants
//!   see `MasterClientSwitched` before the matching `PlayerLeft`.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::ids::ActorId;
use crate::network::codec::CustomTypeRegistry;
use crate::network::protocol::Target;

/// Read-only view of the joined room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    /// Room name.
    pub name: String,
    /// Participants currently in the room.
    pub player_count: u8,
    /// Player cap.
    pub max_players: u8,
    /// Accepting new participants.
    pub is_open: bool,
}

/// Result of a successful create-or-join.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomJoin {
    /// Local actor number in the room.
    pub local: ActorId,
    /// True if this call created the room.
    pub created: bool,
    /// Room view at join time.
    pub room: RoomInfo,
    /// Participants already present, including the local one.
    pub players: Vec<(ActorId, String)>,
    /// Master client at join time.
    pub master: ActorId,
}

/// Inbound notification from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A participant joined.
    PlayerJoined {
        /// New participant.
        actor: ActorId,
        /// Their nickname.
        nickname: String,
    },
    /// A participant left.
    PlayerLeft {
        /// Departed participant.
        actor: ActorId,
    },
    /// Authority moved to another participant.
    MasterClientSwitched {
        /// New master client.
        master: ActorId,
    },
    /// A session message.
    Message {
        /// Sending participant.
        sender: ActorId,
        /// Encoded `SessionMessage`.
        payload: Vec<u8>,
    },
    /// The connection to the service was lost.
    Disconnected {
        /// Reason reported by the service.
        reason: String,
    },
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Not connected to the matchmaking service.
    #[error("not connected")]
    NotConnected,

    /// Operation needs a joined room.
    #[error("not in a room")]
    NotInRoom,

    /// Already in a room.
    #[error("already in a room")]
    AlreadyInRoom,

    /// Room is full.
    #[error("room is full ({0} players)")]
    RoomFull(u8),

    /// Room is closed to new participants.
    #[error("room is closed")]
    RoomClosed,

    /// Addressed participant is not in the room.
    #[error("actor {0} is not in the room")]
    UnknownActor(ActorId),

    /// Underlying service failure.
    #[error("transport failure: {0}")]
    Failure(String),
}

/// Networking layer used by the session core.
pub trait Transport {
    /// Connect to the matchmaking service.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Is the service connection up.
    fn is_connected(&self) -> bool;

    /// Join any open room, or create one capped at `max_players`.
    fn join_or_create_room(&mut self, nickname: &str, max_players: u8) -> Result<RoomJoin, TransportError>;

    /// Current room view.
    fn room(&self) -> Option<RoomInfo>;

    /// Local actor number while in a room.
    fn local_actor(&self) -> Option<ActorId>;

    /// Current master client.
    fn master_client(&self) -> Option<ActorId>;

    /// Participants in join order.
    fn players(&self) -> Vec<ActorId>;

    /// Queue an encoded message.
    fn send(&mut self, target: Target, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Push every queued message onto the wire.
    ///
    /// A message addressed to one participant that is no longer in the room
    /// fails with [`TransportError::UnknownActor`]; the rest are still sent.
    fn flush(&mut self) -> Result<(), TransportError>;

    /// Next inbound event, if any.
    fn poll(&mut self) -> Option<NetworkEvent>;

    /// Leave the current room.
    fn leave_room(&mut self) -> Result<(), TransportError>;

    /// Open or close the current room to new participants.
    fn set_room_open(&mut self, open: bool) -> Result<(), TransportError>;

    /// Custom payload registry of this endpoint.
    fn custom_types(&mut self) -> &mut CustomTypeRegistry;
}
