//! WebSocket relay server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌──► user-connected / user-disconnected
//!             ├── handshake { socketId } │    (every member of the room)
//! Client B ──┘          │               │
//!                       ▼               │
//!                 RoomRegistry ─────────┴──► codesync
//!                 room → members             (addressed member only)
//! ```
//!
//! The relay holds no document state. It assigns each connection a
//! participant ID, tracks which room it joined, and forwards JSON
//! envelopes between room members.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientEvent, Envelope, Handshake, ParticipantId};
use crate::rooms::RoomRegistry;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum clients per room
    pub max_clients_per_room: usize,
    /// Messages buffered per peer before a lagging peer is dropped
    pub outbox_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            max_clients_per_room: 100,
            outbox_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(
            config.max_clients_per_room,
            config.outbox_capacity,
        ));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until an accept fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let id = ParticipantId::generate();
        let mut outbox = registry.register(id.clone()).await;
        log::info!("WebSocket connection established from {addr} as {id}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = async {
            let hello = Envelope::from_payload(&Handshake { socket_id: id.clone() })?.encode()?;
            ws_sender.send(Message::text(hello)).await?;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.write().await.total_messages += 1;
                            Self::dispatch(&id, text.as_str(), &registry).await;
                            stats.write().await.active_rooms = registry.room_count().await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    },

                    out = outbox.recv() => match out {
                        Some(text) => {
                            ws_sender.send(Message::text(text.as_str().to_owned())).await?;
                        }
                        None => {
                            log::info!("Closing connection from {addr}: outbox dropped");
                            break;
                        }
                    },
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        // Cleanup runs whether the connection ended cleanly or not
        if let Err(e) = registry.unregister(&id).await {
            log::error!("Failed to announce departure of {id}: {e}");
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = registry.room_count().await;
        }

        result
    }

    async fn dispatch(id: &ParticipantId, text: &str, registry: &RoomRegistry) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Failed to decode message from {id}: {e}");
                return;
            }
        };

        match ClientEvent::from_envelope(&envelope) {
            Ok(ClientEvent::JoinRoom(join)) => {
                if let Err(e) = registry.join(id, join).await {
                    log::warn!("Join from {id} rejected: {e}");
                }
            }
            Ok(ClientEvent::CodeSync(sync)) => match registry.relay_code(id, sync).await {
                Ok(n) => log::trace!("codesync from {id} delivered to {n} peer(s)"),
                Err(e) => log::debug!("codesync from {id} dropped: {e}"),
            },
            Err(e) => log::debug!("Ignoring event from {id}: {e}"),
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}
