//! Channel contract consumed by a [`Session`](crate::session::Session).
//!
//! A channel is an ordered, reconnecting, bidirectional event transport.
//! The session only sees it through [`Channel`]: it emits envelopes and
//! receives [`ChannelEvent`]s on the receiver handed out by
//! [`Channel::open`]. Dropping that receiver unregisters every handler.
//!
//! [`MemoryChannel`] is an in-process implementation driven by a
//! [`MemoryChannelHandle`], for tests and for embedding the session in a
//! UI without a network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{Envelope, EventPayload, ParticipantId, ProtocolError};

/// Events delivered by a channel, lifecycle and application alike.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Transport connected; carries the identifier the server assigned us.
    Connect { participant_id: ParticipantId },
    /// Transport lost the connection and is retrying.
    Reconnecting { attempt: u32 },
    /// Connection dropped.
    Disconnect { reason: String },
    /// A connection attempt failed (includes the connect timeout).
    ConnectError { reason: String },
    /// The transport gave up reconnecting.
    ConnectFailed { reason: String },
    /// Application event from the server.
    Message(Envelope),
}

/// Transport-level failure, fatal to the session that sees it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    ConnectError(String),
    #[error("connection failed: {0}")]
    ConnectFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The transport a session owns for its lifetime.
pub trait Channel: Send {
    /// Start connecting. Every event is delivered on the returned receiver,
    /// in order. Called once per channel.
    fn open(&mut self) -> mpsc::UnboundedReceiver<ChannelEvent>;

    /// Queue an envelope for the server. Never blocks.
    fn emit(&self, envelope: Envelope) -> Result<(), ChannelError>;

    /// Disconnect and stop reconnecting. Safe to call repeatedly and before
    /// the transport ever connected.
    fn close(&mut self);
}

/// In-memory channel. Events are injected and emitted envelopes inspected
/// through the paired [`MemoryChannelHandle`].
pub struct MemoryChannel {
    inbound_rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    outgoing_tx: mpsc::UnboundedSender<Envelope>,
    closed: Arc<AtomicBool>,
}

/// Test-side end of a [`MemoryChannel`].
pub struct MemoryChannelHandle {
    inbound_tx: mpsc::UnboundedSender<ChannelEvent>,
    outgoing_rx: mpsc::UnboundedReceiver<Envelope>,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    pub fn new() -> (Self, MemoryChannelHandle) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                inbound_rx: Some(inbound_rx),
                outgoing_tx,
                closed: closed.clone(),
            },
            MemoryChannelHandle {
                inbound_tx,
                outgoing_rx,
                closed,
            },
        )
    }
}

impl Channel for MemoryChannel {
    fn open(&mut self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        match self.inbound_rx.take() {
            Some(rx) => rx,
            None => {
                log::warn!("MemoryChannel opened twice");
                mpsc::unbounded_channel().1
            }
        }
    }

    fn emit(&self, envelope: Envelope) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.outgoing_tx.send(envelope).map_err(|_| ChannelError::Closed)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl MemoryChannelHandle {
    /// Deliver an event. Returns `false` once the session stopped listening.
    pub fn inject(&self, event: ChannelEvent) -> bool {
        self.inbound_tx.send(event).is_ok()
    }

    pub fn connect(&self, participant_id: impl Into<ParticipantId>) -> bool {
        self.inject(ChannelEvent::Connect {
            participant_id: participant_id.into(),
        })
    }

    pub fn disconnect(&self, reason: impl Into<String>) -> bool {
        self.inject(ChannelEvent::Disconnect {
            reason: reason.into(),
        })
    }

    /// Deliver a typed server event.
    pub fn deliver<P: EventPayload>(&self, payload: &P) -> Result<bool, ProtocolError> {
        Ok(self.inject(ChannelEvent::Message(Envelope::from_payload(payload)?)))
    }

    /// Drain everything the session emitted so far.
    pub fn emitted(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.outgoing_rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    /// Whether the session closed its end.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
