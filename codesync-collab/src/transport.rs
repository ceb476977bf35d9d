//! WebSocket channel with connection timeout and automatic reconnection.
//!
//! Provides:
//! - Connection lifecycle (connect, handshake, disconnect, reconnect)
//! - JSON envelope send/receive over text frames
//! - Bounded exponential backoff between reconnection attempts
//!
//! ```text
//!            ┌──────────── timeout ────────────┐
//!  open() ──►│ connect_async ──► handshake     │──► Connect { id }
//!            └────────────┬────────────────────┘
//!                 error / │ timeout
//!                         ▼
//!                  ConnectError ──► backoff ──► Reconnecting { n } ──┐
//!                         ▲                                          │
//!                         └──────────────────────────────────────────┘
//! ```
//!
//! Outgoing envelopes are queued while disconnected and flushed once the
//! next connection is established.

use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::channel::{Channel, ChannelError, ChannelEvent};
use crate::protocol::{Envelope, Handshake, ParticipantId, ProtocolError, HANDSHAKE};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:8000`
    pub url: String,
    /// Bound on connect + handshake for a single attempt
    pub connect_timeout: Duration,
    /// Whether to reconnect after a drop or failed attempt
    pub reconnection: bool,
    /// Maximum consecutive reconnection attempts (None = unlimited)
    pub reconnection_attempts: Option<u32>,
    /// Initial delay between attempts
    pub reconnection_delay: Duration,
    /// Upper bound on the delay between attempts
    pub reconnection_delay_max: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000".to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnection: true,
            reconnection_attempts: None,
            reconnection_delay: Duration::from_secs(1),
            reconnection_delay_max: Duration::from_secs(5),
        }
    }
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Delay before reconnection attempt `attempt` (1-based), doubling from
    /// `reconnection_delay` up to `reconnection_delay_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.reconnection_delay
            .saturating_mul(1u32 << shift)
            .min(self.reconnection_delay_max)
    }
}

#[derive(Debug, Error)]
enum HandshakeError {
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connection closed before handshake")]
    Closed,
}

/// Why a live connection stopped.
enum PumpExit {
    Shutdown,
    Lost(String),
}

/// Channel over a WebSocket to a [`RelayServer`](crate::server::RelayServer).
///
/// The IO runs on a background task spawned by [`Channel::open`], so `open`
/// must be called from within a tokio runtime.
pub struct WsChannel {
    config: ChannelConfig,
    outgoing_tx: Option<mpsc::UnboundedSender<String>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl WsChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            outgoing_tx: None,
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Whether the background connection task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Channel for WsChannel {
    fn open(&mut self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        if self.task.is_some() {
            log::warn!("WsChannel for {} opened twice", self.config.url);
            return event_rx;
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.outgoing_tx = Some(out_tx);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(tokio::spawn(run_connection(
            self.config.clone(),
            out_rx,
            event_tx,
            shutdown_rx,
        )));
        event_rx
    }

    fn emit(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let text = envelope.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ChannelError::Closed)?;
        tx.send(text).map_err(|_| ChannelError::Closed)
    }

    fn close(&mut self) {
        self.outgoing_tx = None;
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        // The task sends a close frame and exits on the shutdown signal.
        self.task = None;
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connection loop: connect, pump, and retry until shut down or exhausted.
async fn run_connection(
    config: ChannelConfig,
    mut outgoing_rx: mpsc::UnboundedReceiver<String>,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        let result = tokio::select! {
            res = tokio::time::timeout(config.connect_timeout, handshake(&config.url)) => res,
            _ = shutdown_rx.changed() => return,
        };

        let outcome = match result {
            Ok(Ok((ws, participant_id))) => {
                attempt = 0;
                log::info!("Connected to {} as {participant_id}", config.url);
                if event_tx.send(ChannelEvent::Connect { participant_id }).is_err() {
                    return;
                }
                match pump(ws, &mut outgoing_rx, &event_tx, &mut shutdown_rx).await {
                    PumpExit::Shutdown => return,
                    PumpExit::Lost(reason) => ChannelEvent::Disconnect { reason },
                }
            }
            Ok(Err(e)) => {
                log::warn!("Connection to {} failed: {e}", config.url);
                ChannelEvent::ConnectError { reason: e.to_string() }
            }
            Err(_) => {
                log::warn!(
                    "Connection to {} timed out after {:?}",
                    config.url,
                    config.connect_timeout
                );
                ChannelEvent::ConnectError {
                    reason: format!("timed out after {:?}", config.connect_timeout),
                }
            }
        };
        if event_tx.send(outcome).is_err() {
            return;
        }

        if !config.reconnection {
            let _ = event_tx.send(ChannelEvent::ConnectFailed {
                reason: "reconnection disabled".to_string(),
            });
            return;
        }

        attempt += 1;
        if config.reconnection_attempts.is_some_and(|max| attempt > max) {
            log::error!("Giving up on {} after {} attempts", config.url, attempt - 1);
            let _ = event_tx.send(ChannelEvent::ConnectFailed {
                reason: format!("gave up after {} reconnection attempts", attempt - 1),
            });
            return;
        }

        if event_tx.send(ChannelEvent::Reconnecting { attempt }).is_err() {
            return;
        }
        let delay = config.backoff(attempt);
        log::debug!("Reconnecting to {} in {delay:?} (attempt {attempt})", config.url);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return,
        }
    }
}

/// Open the WebSocket and wait for the relay's handshake frame.
async fn handshake(url: &str) -> Result<(WsStream, ParticipantId), HandshakeError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;

    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => {
                let envelope = Envelope::decode(text.as_str())?;
                if envelope.event == HANDSHAKE {
                    let handshake: Handshake = envelope.payload()?;
                    return Ok((ws, handshake.socket_id));
                }
                log::debug!("Ignoring `{}` before handshake", envelope.event);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Err(HandshakeError::Closed)
}

/// Shuttle frames between the socket and the channel until it drops.
async fn pump(
    ws: WsStream,
    outgoing_rx: &mut mpsc::UnboundedReceiver<String>,
    event_tx: &mpsc::UnboundedSender<ChannelEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> PumpExit {
    let (mut writer, mut reader) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = writer.send(Message::Close(None)).await;
                return PumpExit::Shutdown;
            }

            out = outgoing_rx.recv() => match out {
                Some(text) => {
                    if let Err(e) = writer.send(Message::text(text)).await {
                        return PumpExit::Lost(e.to_string());
                    }
                }
                None => {
                    let _ = writer.send(Message::Close(None)).await;
                    return PumpExit::Shutdown;
                }
            },

            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => match Envelope::decode(text.as_str()) {
                    Ok(envelope) => {
                        if event_tx.send(ChannelEvent::Message(envelope)).is_err() {
                            let _ = writer.send(Message::Close(None)).await;
                            return PumpExit::Shutdown;
                        }
                    }
                    Err(e) => log::debug!("Dropping undecodable frame: {e}"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_owned())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "server closed the connection".to_string());
                    return PumpExit::Lost(reason);
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = writer.send(Message::Pong(data)).await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                None => return PumpExit::Lost("connection reset".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_config_default() {
        let config = ChannelConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:8000");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.reconnection);
        assert!(config.reconnection_attempts.is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ChannelConfig {
            reconnection_delay: Duration::from_millis(100),
            reconnection_delay_max: Duration::from_millis(500),
            ..ChannelConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(500));
        assert_eq!(config.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_emit_before_open_is_closed() {
        let channel = WsChannel::new(ChannelConfig::default());
        let envelope = Envelope {
            event: "join-room".into(),
            data: serde_json::Value::Null,
        };
        assert_eq!(channel.emit(envelope), Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn test_connection_refused_reports_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut channel = WsChannel::new(ChannelConfig {
            reconnection: false,
            ..ChannelConfig::new(format!("ws://127.0.0.1:{port}"))
        });
        let mut events = channel.open();

        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(matches!(first, Some(ChannelEvent::ConnectError { .. })));

        let second = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(matches!(second, Some(ChannelEvent::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut channel = WsChannel::new(ChannelConfig::new("ws://127.0.0.1:9"));
        let _events = channel.open();
        channel.close();
        channel.close();
        assert!(!channel.is_running());
    }
}
