//! Room routing for the relay.
//!
//! Each connected peer owns an outbox; the registry maps peers to rooms and
//! fans pre-encoded envelopes out to the right outboxes. Envelopes are
//! encoded once and shared as `Arc<String>` across recipients.
//!
//! Outboxes are bounded. A peer that falls `outbox_capacity` messages
//! behind is evicted: it leaves its room (announced like any departure)
//! and its outbox sender is dropped, which ends its connection task.

use std::collections::HashMap;
use std::sync::Arc;
use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{
    CodeSync, Envelope, EventPayload, JoinRoom, Participant, ParticipantId, ProtocolError,
    UserConnected, UserDisconnected,
};

/// Encoded envelope queued for one peer.
pub type Outbound = Arc<String>;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("unknown peer {0}")]
    UnknownPeer(ParticipantId),
    #[error("room id must not be empty")]
    EmptyRoomId,
    #[error("room {room} is full ({limit} clients)")]
    RoomFull { room: String, limit: usize },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct PeerEntry {
    outbox: mpsc::Sender<Outbound>,
    room: Option<String>,
}

#[derive(Default)]
struct RegistryState {
    peers: HashMap<ParticipantId, PeerEntry>,
    /// room id → members in join order, with display names
    rooms: HashMap<String, IndexMap<ParticipantId, String>>,
}

/// Peers whose outbox was full during a fan-out.
type Lagging = Vec<ParticipantId>;

impl RegistryState {
    /// Queue `message` for `id`. Returns `false` if its outbox is full.
    fn send(&self, id: &ParticipantId, message: &Outbound) -> bool {
        let Some(peer) = self.peers.get(id) else {
            return true;
        };
        match peer.outbox.try_send(message.clone()) {
            Ok(()) => true,
            // The connection is already tearing down.
            Err(TrySendError::Closed(_)) => true,
            Err(TrySendError::Full(_)) => false,
        }
    }

    fn broadcast(&self, room: &str, message: &Outbound) -> Lagging {
        let Some(members) = self.rooms.get(room) else {
            return Vec::new();
        };
        members
            .keys()
            .filter(|id| !self.send(id, message))
            .cloned()
            .collect()
    }

    /// Remove `id` from its room and tell whoever remains.
    fn leave(&mut self, id: &ParticipantId) -> Result<Lagging, ProtocolError> {
        let Some(room) = self.peers.get_mut(id).and_then(|peer| peer.room.take()) else {
            return Ok(Vec::new());
        };
        let Some(members) = self.rooms.get_mut(&room) else {
            return Ok(Vec::new());
        };
        let Some(user_name) = members.shift_remove(id) else {
            return Ok(Vec::new());
        };

        if members.is_empty() {
            self.rooms.remove(&room);
            log::debug!("Room {room} removed (empty)");
            return Ok(Vec::new());
        }

        let left = encode(&UserDisconnected {
            socket_id: id.clone(),
            user_name,
        })?;
        Ok(self.broadcast(&room, &left))
    }

    /// Drop peers that stopped draining their outbox.
    ///
    /// Each departure is announced, which may overflow further outboxes;
    /// those peers are evicted in turn.
    fn evict(&mut self, mut lagging: Lagging) -> Result<(), ProtocolError> {
        while let Some(id) = lagging.pop() {
            if !self.peers.contains_key(&id) {
                continue;
            }
            log::warn!("Peer {id} fell behind; dropping its connection");
            lagging.extend(self.leave(&id)?);
            self.peers.remove(&id);
        }
        Ok(())
    }
}

fn encode<P: EventPayload>(payload: &P) -> Result<Outbound, ProtocolError> {
    Ok(Arc::new(Envelope::from_payload(payload)?.encode()?))
}

/// Peers and rooms known to the relay.
pub struct RoomRegistry {
    state: RwLock<RegistryState>,
    max_clients_per_room: usize,
    outbox_capacity: usize,
}

impl RoomRegistry {
    /// `outbox_capacity` is how many messages may queue for one peer
    /// before it is evicted. Must be non-zero.
    pub fn new(max_clients_per_room: usize, outbox_capacity: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            max_clients_per_room,
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    /// Register a connection and return the receiving end of its outbox.
    ///
    /// The receiver yields `None` once the peer is unregistered or evicted.
    pub async fn register(&self, id: ParticipantId) -> mpsc::Receiver<Outbound> {
        let (outbox, rx) = mpsc::channel(self.outbox_capacity);
        let mut state = self.state.write().await;
        if state.peers.insert(id.clone(), PeerEntry { outbox, room: None }).is_some() {
            log::warn!("Peer {id} registered twice; previous outbox replaced");
        }
        rx
    }

    /// Put a peer in a room, leaving any room it was in before.
    ///
    /// Every member, the joiner included, receives `user-connected` with
    /// the full member list. Returns the new member count.
    pub async fn join(&self, id: &ParticipantId, request: JoinRoom) -> Result<usize, RoomError> {
        if request.room_id.trim().is_empty() {
            return Err(RoomError::EmptyRoomId);
        }

        let mut state = self.state.write().await;
        let current = match state.peers.get(id) {
            Some(peer) => peer.room.clone(),
            None => return Err(RoomError::UnknownPeer(id.clone())),
        };

        let rejoin = current.as_deref() == Some(request.room_id.as_str());
        if !rejoin {
            let size = state.rooms.get(&request.room_id).map_or(0, |m| m.len());
            if size >= self.max_clients_per_room {
                return Err(RoomError::RoomFull {
                    room: request.room_id,
                    limit: self.max_clients_per_room,
                });
            }
            let lagging = state.leave(id)?;
            state.evict(lagging)?;
        }

        let members = state.rooms.entry(request.room_id.clone()).or_default();
        members.insert(id.clone(), request.user_name.clone());
        let clients: Vec<Participant> = members
            .iter()
            .map(|(pid, name)| Participant::new(pid.clone(), name.clone()))
            .collect();
        let count = clients.len();

        if let Some(peer) = state.peers.get_mut(id) {
            peer.room = Some(request.room_id.clone());
        }

        let connected = encode(&UserConnected {
            clients,
            user_name: request.user_name.clone(),
            socket_id: id.clone(),
        })?;
        let lagging = state.broadcast(&request.room_id, &connected);
        state.evict(lagging)?;

        log::info!(
            "{} ({id}) joined room {} ({count} clients)",
            request.user_name,
            request.room_id
        );
        Ok(count)
    }

    /// Forward a `codesync` from `from`.
    ///
    /// Addressed syncs go to their target only, and only if it shares the
    /// sender's room. Unaddressed syncs go to every other member. Returns
    /// the number of recipients it was queued for; lagging recipients are
    /// evicted instead.
    pub async fn relay_code(
        &self,
        from: &ParticipantId,
        sync: CodeSync,
    ) -> Result<usize, RoomError> {
        let mut state = self.state.write().await;
        let Some(room) = state.peers.get(from).and_then(|peer| peer.room.as_ref()) else {
            return Err(RoomError::UnknownPeer(from.clone()));
        };
        let Some(members) = state.rooms.get(room) else {
            return Ok(0);
        };

        let recipients: Vec<ParticipantId> = match &sync.socket_id {
            Some(target) if members.contains_key(target) => vec![target.clone()],
            Some(target) => {
                log::debug!("Dropping codesync from {from} to {target}: not in room {room}");
                Vec::new()
            }
            None => members.keys().filter(|id| *id != from).cloned().collect(),
        };
        if recipients.is_empty() {
            return Ok(0);
        }

        let message = encode(&sync)?;
        let lagging: Lagging = recipients
            .iter()
            .filter(|id| !state.send(id, &message))
            .cloned()
            .collect();
        let delivered = recipients.len() - lagging.len();
        state.evict(lagging)?;
        Ok(delivered)
    }

    /// Forget a connection, announcing its departure to its room.
    pub async fn unregister(&self, id: &ParticipantId) -> Result<(), RoomError> {
        let mut state = self.state.write().await;
        let lagging = state.leave(id);
        state.peers.remove(id);
        state.evict(lagging?)?;
        Ok(())
    }

    /// Current members of `room`, in join order.
    pub async fn members(&self, room: &str) -> Vec<Participant> {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .map(|(id, name)| Participant::new(id.clone(), name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.read().await.peers.len()
    }

    pub fn max_clients_per_room(&self) -> usize {
        self.max_clients_per_room
    }

    pub fn outbox_capacity(&self) -> usize {
        self.outbox_capacity
    }
}
