//! Room protocol: named events and their JSON payloads.
//!
//! Wire format (one WebSocket text frame per event):
//! ```text
//! ┌───────────────────────┬──────────────────────────────────────────┐
//! │ "event"               │ "data"                                   │
//! │ join-room             │ { roomId, userName }                     │
//! │ user-connected        │ { clients: [{socketId, userName}],       │
//! │                       │   userName, socketId }                   │
//! │ user-disconnected     │ { socketId, userName }                   │
//! │ codesync              │ { code, socketId }                       │
//! │ handshake             │ { socketId }           (relay → client)  │
//! └───────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Connection lifecycle (connect, disconnect, errors) is never framed as an
//! envelope; see [`ChannelEvent`](crate::channel::ChannelEvent).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Client asks the server to add it to a room.
pub const JOIN_ROOM: &str = "join-room";
/// Server announces a join, with the full member list.
pub const USER_CONNECTED: &str = "user-connected";
/// Server announces a departure.
pub const USER_DISCONNECTED: &str = "user-disconnected";
/// Document handoff, relayed to a single participant.
pub const CODESYNC: &str = "codesync";
/// First frame from the relay, carrying the assigned socket ID.
pub const HANDSHAKE: &str = "handshake";

/// Transport-assigned participant identifier.
///
/// Opaque: only ever compared for equality (and ordered for the
/// lowest-participant handoff policy).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier (UUID v4, simple form).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One connected member of a room.
///
/// `display_name` is not unique; never key anything by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "socketId")]
    pub participant_id: ParticipantId,
    #[serde(rename = "userName")]
    pub display_name: String,
}

impl Participant {
    pub fn new(participant_id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// A payload type bound to its event name.
pub trait EventPayload: Serialize {
    const EVENT: &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_id: String,
    pub user_name: String,
}

impl EventPayload for JoinRoom {
    const EVENT: &'static str = JOIN_ROOM;
}

/// Authoritative membership snapshot plus the participant who just joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConnected {
    pub clients: Vec<Participant>,
    pub user_name: String,
    pub socket_id: ParticipantId,
}

impl EventPayload for UserConnected {
    const EVENT: &'static str = USER_CONNECTED;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDisconnected {
    pub socket_id: ParticipantId,
    pub user_name: String,
}

impl EventPayload for UserDisconnected {
    const EVENT: &'static str = USER_DISCONNECTED;
}

/// Full document text addressed to one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSync {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<ParticipantId>,
}

impl CodeSync {
    /// Handoff of `code` to `target`.
    pub fn to(target: ParticipantId, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            socket_id: Some(target),
        }
    }
}

impl EventPayload for CodeSync {
    const EVENT: &'static str = CODESYNC;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub socket_id: ParticipantId,
}

impl EventPayload for Handshake {
    const EVENT: &'static str = HANDSHAKE;
}

/// A named event with an untyped payload, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Wrap a typed payload under its event name.
    pub fn from_payload<P: EventPayload>(payload: &P) -> Result<Self, ProtocolError> {
        let data = serde_json::to_value(payload)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            event: P::EVENT.to_string(),
            data,
        })
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Interpret the payload as `T`.
    ///
    /// Missing or mistyped fields yield [`ProtocolError::Malformed`].
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.data).map_err(|e| ProtocolError::Malformed {
            event: self.event.clone(),
            reason: e.to_string(),
        })
    }
}

/// Server-originated events a session reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    UserConnected(UserConnected),
    UserDisconnected(UserDisconnected),
    CodeSync(CodeSync),
}

impl RoomEvent {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        match envelope.event.as_str() {
            USER_CONNECTED => Ok(Self::UserConnected(envelope.payload()?)),
            USER_DISCONNECTED => Ok(Self::UserDisconnected(envelope.payload()?)),
            CODESYNC => Ok(Self::CodeSync(envelope.payload()?)),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

/// Client-originated events the relay reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    JoinRoom(JoinRoom),
    CodeSync(CodeSync),
}

impl ClientEvent {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        match envelope.event.as_str() {
            JOIN_ROOM => Ok(Self::JoinRoom(envelope.payload()?)),
            CODESYNC => Ok(Self::CodeSync(envelope.payload()?)),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("malformed `{event}` payload: {reason}")]
    Malformed { event: String, reason: String },
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
}
