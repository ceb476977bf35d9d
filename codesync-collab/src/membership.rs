//! Room membership derived from server events.
//!
//! The server is authoritative: every `user-connected` carries the full
//! member list and replaces the local view wholesale, and every
//! `user-disconnected` removes exactly one entry. Nothing is inferred
//! locally, and the local participant is never synthesized into the set.
//!
//! ```text
//! user-connected { clients, socketId }      user-disconnected { socketId }
//!       │                                          │
//!       ▼                                          ▼
//!  replace(clients)  ──►  JoinOutcome      shift_remove(socketId) ──► Option<Participant>
//!                         { participant, is_self }
//! ```

use indexmap::IndexMap;

use crate::protocol::{Participant, ParticipantId, UserConnected, UserDisconnected};

/// Who "we" are in the room.
///
/// The transport-assigned ID is authoritative once known. Before the
/// first connect only the display name is available, which is ambiguous
/// when two participants share a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    display_name: String,
    participant_id: Option<ParticipantId>,
}

impl LocalIdentity {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            participant_id: None,
        }
    }

    /// Record the ID assigned on (re)connect.
    pub fn assign(&mut self, participant_id: ParticipantId) {
        self.participant_id = Some(participant_id);
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn participant_id(&self) -> Option<&ParticipantId> {
        self.participant_id.as_ref()
    }

    /// Whether an event about (`id`, `name`) concerns the local participant.
    pub fn is_self(&self, id: &ParticipantId, name: &str) -> bool {
        match &self.participant_id {
            Some(own) => own == id,
            None => self.display_name == name,
        }
    }
}

/// Result of applying a `user-connected` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The participant whose join triggered the snapshot.
    pub participant: Participant,
    /// Whether that participant is us.
    pub is_self: bool,
}

/// Participants currently in the room, keyed by participant ID.
///
/// Iteration follows the order of the last snapshot.
#[derive(Debug, Clone, Default)]
pub struct RoomMembership {
    members: IndexMap<ParticipantId, Participant>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set with an authoritative snapshot.
    ///
    /// Duplicate IDs in the snapshot collapse to one entry.
    pub fn replace(&mut self, clients: Vec<Participant>) {
        self.members = clients
            .into_iter()
            .map(|p| (p.participant_id.clone(), p))
            .collect();
    }

    /// Apply a `user-connected` snapshot and classify the joiner.
    pub fn apply_user_connected(
        &mut self,
        event: UserConnected,
        local: &LocalIdentity,
    ) -> JoinOutcome {
        self.replace(event.clients);
        let is_self = local.is_self(&event.socket_id, &event.user_name);
        JoinOutcome {
            participant: Participant {
                participant_id: event.socket_id,
                display_name: event.user_name,
            },
            is_self,
        }
    }

    /// Apply a `user-disconnected` removal.
    ///
    /// Returns the removed participant, or `None` if it was not a member
    /// (in which case nothing changes).
    pub fn apply_user_disconnected(&mut self, event: UserDisconnected) -> Option<Participant> {
        self.members.shift_remove(&event.socket_id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.members.get(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.members.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ParticipantId> {
        self.members.keys()
    }

    /// Owned copy of the member list, for notifications.
    pub fn to_vec(&self) -> Vec<Participant> {
        self.members.values().cloned().collect()
    }
}
