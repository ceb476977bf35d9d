//! # codesync-collab: Room sessions for collaborative code editing
//!
//! Joins a shared room, keeps the list of connected participants in sync
//! with the server, and hands the current document to anyone who joins
//! after us.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ChannelEvent    ┌─────────────┐   WebSocket    ┌─────────────┐
//! │  Session    │ ◄──────────────── │  WsChannel  │ ◄────────────► │ RelayServer │
//! │ (per room)  │ ────────────────► │ (reconnect) │   JSON frames  │ (fan-out)   │
//! └──────┬──────┘     Envelope      └─────────────┘                └──────┬──────┘
//!        │                                                               │
//!        ├── RoomMembership  (snapshot / removal)                        ▼
//!        ├── DocumentHandoff (codesync on join)                   ┌─────────────┐
//!        ▼                                                        │RoomRegistry │
//!   SessionEvent ──► caller (UI)                                  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Event names, payloads and the JSON envelope
//! - [`channel`]: Transport contract consumed by a session, plus an in-memory channel
//! - [`transport`]: WebSocket channel with timeout and automatic reconnection
//! - [`membership`]: Participant set derived from server events
//! - [`handoff`]: Initial document delivery to newly joined participants
//! - [`session`]: Connection state machine tying it all together
//! - [`rooms`]: Server-side room registry
//! - [`server`]: WebSocket relay server

pub mod protocol;
pub mod channel;
pub mod transport;
pub mod membership;
pub mod handoff;
pub mod session;
pub mod rooms;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    CodeSync, Envelope, JoinRoom, Participant, ParticipantId, ProtocolError, RoomEvent,
    UserConnected, UserDisconnected,
};
pub use channel::{
    Channel, ChannelError, ChannelEvent, MemoryChannel, MemoryChannelHandle, TransportError,
};
pub use transport::{ChannelConfig, WsChannel};
pub use membership::{LocalIdentity, RoomMembership};
pub use handoff::{DocumentHandoff, HandoffPolicy};
pub use session::{ConnectionState, Session, SessionConfig, SessionError, SessionEvent};
pub use rooms::{RoomError, RoomRegistry};
pub use server::{RelayConfig, RelayServer, RelayStats};
