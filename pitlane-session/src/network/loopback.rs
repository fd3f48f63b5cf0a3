//! Loopback Transport
//!
//! In-process implementation of the transport contract: one matchmaking
//! service hosting a single room, many endpoints. Used by the demo binary
//! and by the multi-participant tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::core::ids::{successor_of, ActorId};
use crate::network::codec::CustomTypeRegistry;
use crate::network::protocol::Target;
use crate::network::transport::{NetworkEvent, RoomInfo, RoomJoin, Transport, TransportError};

struct Member {
    nickname: String,
    inbox: VecDeque<NetworkEvent>,
}

struct Room {
    name: String,
    max_players: u8,
    is_open: bool,
    next_actor: u32,
    master: ActorId,
    members: BTreeMap<ActorId, Member>,
}

impl Room {
    fn info(&self) -> RoomInfo {
        RoomInfo {
            name: self.name.clone(),
            player_count: self.members.len() as u8,
            max_players: self.max_players,
            is_open: self.is_open,
        }
    }

    fn recipients(&self, sender: ActorId, target: &Target) -> Vec<ActorId> {
        match target {
            Target::MasterClient => vec![self.master],
            Target::AllViaServer => self.members.keys().copied().collect(),
            Target::Others => self.members.keys().copied().filter(|a| *a != sender).collect(),
            Target::Actor(actor) => vec![*actor],
        }
    }

    fn deliver(&mut self, actor: ActorId, event: NetworkEvent) {
        if let Some(member) = self.members.get_mut(&actor) {
            member.inbox.push_back(event);
        }
    }

    fn broadcast_except(&mut self, skip: ActorId, event: NetworkEvent) {
        for (actor, member) in self.members.iter_mut() {
            if *actor != skip {
                member.inbox.push_back(event.clone());
            }
        }
    }
}

#[derive(Default)]
struct ServiceState {
    room: Option<Room>,
}

/// In-process matchmaking service.
#[derive(Clone, Default)]
pub struct LoopbackService {
    state: Arc<Mutex<ServiceState>>,
}

impl LoopbackService {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// New endpoint attached to this service.
    pub fn endpoint(&self) -> LoopbackEndpoint {
        LoopbackEndpoint {
            service: self.clone(),
            connected: false,
            local: None,
            outgoing: Vec::new(),
            registry: CustomTypeRegistry::new(),
        }
    }

    /// Open or close the hosted room.
    pub fn set_room_open(&self, open: bool) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let room = state.room.as_mut().ok_or(TransportError::NotInRoom)?;
        room.is_open = open;
        Ok(())
    }

    /// Room view, if a room exists.
    pub fn room(&self) -> Option<RoomInfo> {
        self.lock().ok()?.room.as_ref().map(Room::info)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ServiceState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::Failure("loopback service poisoned".to_string()))
    }
}

/// One participant's connection to a [`LoopbackService`].
pub struct LoopbackEndpoint {
    service: LoopbackService,
    connected: bool,
    local: Option<ActorId>,
    outgoing: Vec<(Target, Vec<u8>)>,
    registry: CustomTypeRegistry,
}

impl LoopbackEndpoint {
    /// Messages queued but not yet flushed.
    pub fn pending_outgoing(&self) -> usize {
        self.outgoing.len()
    }

    /// Simulate a crash: vanish from the room without flushing or leaving
    /// cleanly.
    pub fn drop_connection(&mut self) -> Result<(), TransportError> {
        self.outgoing.clear();
        self.depart()?;
        self.connected = false;
        Ok(())
    }

    fn depart(&mut self) -> Result<(), TransportError> {
        let local = self.local.take().ok_or(TransportError::NotInRoom)?;
        let mut state = self.service.lock()?;

        let now_empty = match state.room.as_mut() {
            Some(room) => {
                room.members.remove(&local);

                if room.master == local {
                    if let Some(next) = successor_of(local, room.members.keys().copied()) {
                        room.master = next;
                        info!("loopback: master client {} -> {}", local, next);
                        room.broadcast_except(local, NetworkEvent::MasterClientSwitched { master: next });
                    }
                }

                room.broadcast_except(local, NetworkEvent::PlayerLeft { actor: local });
                room.members.is_empty()
            }
            None => true,
        };

        if now_empty {
            debug!("loopback: room closed after last departure");
            state.room = None;
        }
        Ok(())
    }
}

impl Transport for LoopbackEndpoint {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn join_or_create_room(&mut self, nickname: &str, max_players: u8) -> Result<RoomJoin, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.local.is_some() {
            return Err(TransportError::AlreadyInRoom);
        }

        let mut state = self.service.lock()?;
        let created = state.room.is_none();
        let room = state.room.get_or_insert_with(|| Room {
            name: uuid::Uuid::new_v4().to_string(),
            max_players,
            is_open: true,
            next_actor: 1,
            master: ActorId(1),
            members: BTreeMap::new(),
        });

        if !room.is_open {
            return Err(TransportError::RoomClosed);
        }
        if room.members.len() >= room.max_players as usize {
            return Err(TransportError::RoomFull(room.max_players));
        }

        let local = ActorId(room.next_actor);
        room.next_actor += 1;
        if room.members.is_empty() {
            room.master = local;
        }

        room.broadcast_except(local, NetworkEvent::PlayerJoined {
            actor: local,
            nickname: nickname.to_string(),
        });
        room.members.insert(local, Member {
            nickname: nickname.to_string(),
            inbox: VecDeque::new(),
        });

        let join = RoomJoin {
            local,
            created,
            room: room.info(),
            players: room.members.iter().map(|(a, m)| (*a, m.nickname.clone())).collect(),
            master: room.master,
        };
        drop(state);

        self.local = Some(local);
        Ok(join)
    }

    fn room(&self) -> Option<RoomInfo> {
        self.local?;
        self.service.room()
    }

    fn local_actor(&self) -> Option<ActorId> {
        self.local
    }

    fn master_client(&self) -> Option<ActorId> {
        self.local?;
        let state = self.service.lock().ok()?;
        state.room.as_ref().map(|r| r.master)
    }

    fn players(&self) -> Vec<ActorId> {
        if self.local.is_none() {
            return Vec::new();
        }
        match self.service.lock() {
            Ok(state) => state
                .room
                .as_ref()
                .map(|r| r.members.keys().copied().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    fn send(&mut self, target: Target, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.local.is_none() {
            return Err(TransportError::NotInRoom);
        }
        self.outgoing.push((target, payload));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        let Some(sender) = self.local else {
            self.outgoing.clear();
            return Ok(());
        };
        if self.outgoing.is_empty() {
            return Ok(());
        }

        let mut state = self.service.lock()?;
        let room = state.room.as_mut().ok_or(TransportError::NotInRoom)?;
        let mut unknown = None;

        for (target, payload) in self.outgoing.drain(..) {
            if let Target::Actor(actor) = target {
                if !room.members.contains_key(&actor) {
                    warn!("loopback: {} is not in the room, message from {} dropped", actor, sender);
                    unknown.get_or_insert(actor);
                    continue;
                }
            }
            for actor in room.recipients(sender, &target) {
                room.deliver(actor, NetworkEvent::Message {
                    sender,
                    payload: payload.clone(),
                });
            }
        }

        match unknown {
            Some(actor) => Err(TransportError::UnknownActor(actor)),
            None => Ok(()),
        }
    }

    fn poll(&mut self) -> Option<NetworkEvent> {
        let local = self.local?;
        let mut state = self.service.lock().ok()?;
        state.room.as_mut()?.members.get_mut(&local)?.inbox.pop_front()
    }

    fn leave_room(&mut self) -> Result<(), TransportError> {
        if !self.outgoing.is_empty() {
            debug!("loopback: dropping {} unflushed messages on leave", self.outgoing.len());
            self.outgoing.clear();
        }
        self.depart()
    }

    fn set_room_open(&mut self, open: bool) -> Result<(), TransportError> {
        if self.local.is_none() {
            return Err(TransportError::NotInRoom);
        }
        self.service.set_room_open(open)?;
        debug!("loopback: room {}", if open { "opened" } else { "closed" });
        Ok(())
    }

    fn custom_types(&mut self) -> &mut CustomTypeRegistry {
        &mut self.registry
    }
}
