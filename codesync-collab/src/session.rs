//! Room session: connection state machine, membership and handoff.
//!
//! A [`Session`] owns one [`Channel`] for its whole life. It reacts to
//! channel events one at a time and never blocks:
//!
//! ```text
//!            open()
//!              │
//!              ▼
//!   ┌──── Connecting ◄──── Reconnecting ────┐
//!   │          │                            │
//!   │   Connect│ (emit join-room)           │
//!   │          ▼                            │
//!   │      Connected ──── Disconnect ──► Disconnected
//!   │
//!   └─ ConnectError / ConnectFailed / close() ──► Disconnected (final)
//! ```
//!
//! Observable changes are published as [`SessionEvent`]s on an unbounded
//! channel created by [`Session::take_event_rx`]. Until someone subscribes
//! nothing is queued; state stays readable through the accessors.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelError, ChannelEvent, TransportError};
use crate::handoff::{DocumentHandoff, HandoffPolicy};
use crate::membership::{LocalIdentity, RoomMembership};
use crate::protocol::{
    EventPayload, Envelope, JoinRoom, Participant, ParticipantId, ProtocolError, RoomEvent,
};
use crate::transport::{ChannelConfig, WsChannel};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Notifications for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connection state moved
    ConnectionStateChanged(ConnectionState),
    /// Someone else joined the room
    MemberJoined(Participant),
    /// A member left the room
    MemberLeft(Participant),
    /// Member list after any change
    MembershipChanged(Vec<Participant>),
    /// Document handed to us by an existing member
    DocumentReceived(String),
    /// Transport failure; the session is already torn down
    Failed(TransportError),
}

/// Session configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub handoff_policy: HandoffPolicy,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("display name must not be empty")]
    EmptyDisplayName,
    #[error("room id must not be empty")]
    EmptyRoomId,
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One participant's presence in one room.
pub struct Session<C: Channel> {
    room_id: String,
    identity: LocalIdentity,
    state: ConnectionState,
    closed: bool,
    channel: C,
    /// Channel events; `None` once handlers are unregistered.
    inbound: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    membership: RoomMembership,
    handoff: DocumentHandoff,
    /// Notification sink; `None` until [`Session::take_event_rx`].
    event_tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl Session<WsChannel> {
    /// Open a session over a WebSocket channel.
    pub fn connect(
        config: ChannelConfig,
        room_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<Self, SessionError> {
        Self::open(WsChannel::new(config), room_id, display_name)
    }
}

impl<C: Channel> Session<C> {
    /// Open a session with the default configuration.
    pub fn open(
        channel: C,
        room_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<Self, SessionError> {
        Self::open_with(channel, room_id, display_name, SessionConfig::default())
    }

    /// Open a session: validate, start the channel, and wait for `connect`
    /// to send the join request.
    pub fn open_with(
        mut channel: C,
        room_id: impl Into<String>,
        display_name: impl Into<String>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let room_id = room_id.into();
        let display_name = display_name.into();
        if room_id.trim().is_empty() {
            return Err(SessionError::EmptyRoomId);
        }
        if display_name.trim().is_empty() {
            return Err(SessionError::EmptyDisplayName);
        }

        let inbound = channel.open();
        log::info!("Opening session for room {room_id} as {display_name}");

        let mut session = Self {
            room_id,
            identity: LocalIdentity::new(display_name),
            state: ConnectionState::Disconnected,
            closed: false,
            channel,
            inbound: Some(inbound),
            membership: RoomMembership::new(),
            handoff: DocumentHandoff::new(config.handoff_policy),
            event_tx: None,
        };
        session.set_state(ConnectionState::Connecting);
        Ok(session)
    }

    /// Subscribe to notifications (can only be called once).
    ///
    /// Only changes after this call are delivered.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        if self.event_tx.is_some() {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_tx = Some(tx);
        Some(rx)
    }

    /// Leave the room. Idempotent.
    ///
    /// Handlers are unregistered before this returns, so nothing the
    /// channel delivers afterwards has any effect.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.inbound = None;
        self.channel.close();
        self.set_state(ConnectionState::Disconnected);
        log::info!("Left room {}", self.room_id);
    }

    /// Wait for the next channel event and react to it.
    ///
    /// Returns `false` once the session is closed or the channel ended.
    /// Cancel-safe.
    pub async fn process_next(&mut self) -> bool {
        let Some(inbound) = self.inbound.as_mut() else {
            return false;
        };
        match inbound.recv().await {
            Some(event) => {
                self.handle_event(event);
                !self.closed
            }
            None => {
                log::debug!("Channel for room {} ended", self.room_id);
                self.inbound = None;
                false
            }
        }
    }

    /// Process channel events until the session closes.
    pub async fn run(&mut self) {
        while self.process_next().await {}
    }

    /// React to a single channel event.
    pub fn handle_event(&mut self, event: ChannelEvent) {
        if self.closed {
            log::trace!("Dropping {event:?} after close");
            return;
        }

        match event {
            ChannelEvent::Connect { participant_id } => {
                log::info!("Connected to room {} as {participant_id}", self.room_id);
                self.identity.assign(participant_id);
                self.set_state(ConnectionState::Connected);
                self.send_join();
            }
            ChannelEvent::Reconnecting { attempt } => {
                log::debug!("Reconnecting to room {} (attempt {attempt})", self.room_id);
                self.set_state(ConnectionState::Connecting);
            }
            ChannelEvent::Disconnect { reason } => {
                log::info!("Disconnected from room {}: {reason}", self.room_id);
                self.set_state(ConnectionState::Disconnected);
            }
            ChannelEvent::ConnectError { reason } => {
                self.fail(TransportError::ConnectError(reason))
            }
            ChannelEvent::ConnectFailed { reason } => {
                self.fail(TransportError::ConnectFailed(reason))
            }
            ChannelEvent::Message(envelope) => self.handle_message(&envelope),
        }
    }

    /// Record the local document so it can be handed to later joiners.
    pub fn set_document(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.handoff.set_local(text);
        Ok(())
    }

    /// Latest known document: our own edits or the last handoff received.
    pub fn document(&self) -> Option<&str> {
        self.handoff.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn display_name(&self) -> &str {
        self.identity.display_name()
    }

    /// Our transport-assigned ID, once connected.
    pub fn participant_id(&self) -> Option<&ParticipantId> {
        self.identity.participant_id()
    }

    pub fn members(&self) -> &RoomMembership {
        &self.membership
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    fn handle_message(&mut self, envelope: &Envelope) {
        let event = match RoomEvent::from_envelope(envelope) {
            Ok(event) => event,
            Err(e) => {
                log::debug!("Discarding event in room {}: {e}", self.room_id);
                return;
            }
        };

        match event {
            RoomEvent::UserConnected(ev) => {
                let outcome = self.membership.apply_user_connected(ev, &self.identity);
                if outcome.is_self {
                    log::debug!("Join acknowledged for room {}", self.room_id);
                } else {
                    let joined = outcome.participant;
                    log::info!("{} joined room {}", joined.display_name, self.room_id);
                    self.notify(SessionEvent::MemberJoined(joined.clone()));

                    let offer = self.handoff.offer_for(
                        &joined.participant_id,
                        self.identity.participant_id(),
                        &self.membership,
                    );
                    if let Some(sync) = offer {
                        if let Err(e) = self.send(&sync) {
                            log::warn!("Document handoff to {} failed: {e}", joined.participant_id);
                        }
                    }
                }
                self.notify(SessionEvent::MembershipChanged(self.membership.to_vec()));
            }
            RoomEvent::UserDisconnected(ev) => match self.membership.apply_user_disconnected(ev) {
                Some(left) => {
                    log::info!("{} left room {}", left.display_name, self.room_id);
                    self.notify(SessionEvent::MemberLeft(left));
                    self.notify(SessionEvent::MembershipChanged(self.membership.to_vec()));
                }
                None => log::debug!("Ignoring departure of a non-member"),
            },
            RoomEvent::CodeSync(sync) => {
                if let Some(code) = self.handoff.receive(sync, self.identity.participant_id()) {
                    log::debug!("Received document ({} bytes)", code.len());
                    self.notify(SessionEvent::DocumentReceived(code));
                }
            }
        }
    }

    fn send_join(&self) {
        let join = JoinRoom {
            room_id: self.room_id.clone(),
            user_name: self.identity.display_name().to_string(),
        };
        if let Err(e) = self.send(&join) {
            log::warn!("Failed to send join for room {}: {e}", self.room_id);
        }
    }

    fn send<P: EventPayload>(&self, payload: &P) -> Result<(), SessionError> {
        let envelope = Envelope::from_payload(payload)?;
        self.channel.emit(envelope)?;
        Ok(())
    }

    /// Tear down after a transport failure and report it once.
    fn fail(&mut self, error: TransportError) {
        log::error!("Session for room {} failed: {error}", self.room_id);
        self.close();
        self.notify(SessionEvent::Failed(error));
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.notify(SessionEvent::ConnectionStateChanged(state));
        }
    }

    fn notify(&self, event: SessionEvent) {
        if let Some(tx) = &self.event_tx {
            // A dropped receiver is fine; the state is still readable.
            let _ = tx.send(event);
        }
    }
}

impl<C: Channel> Drop for Session<C> {
    fn drop(&mut self) {
        self.close();
    }
}
