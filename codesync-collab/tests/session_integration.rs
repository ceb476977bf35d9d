//! Integration tests for room sessions over a real relay.
//!
//! These tests start a relay on a free port and connect real WebSocket
//! sessions, verifying join, handoff and departure end to end.

use codesync_collab::channel::Channel;
use codesync_collab::protocol::Participant;
use codesync_collab::server::{RelayConfig, RelayServer};
use codesync_collab::session::{ConnectionState, Session, SessionEvent};
use codesync_collab::transport::{ChannelConfig, WsChannel};
use codesync_collab::TransportError;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout_at, Duration, Instant};

/// Start a relay on a free port, return its URL.
async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(RelayConfig {
        bind_addr: addr.to_string(),
        max_clients_per_room: 10,
        ..RelayConfig::default()
    });
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://{addr}")
}

fn config(url: &str) -> ChannelConfig {
    ChannelConfig {
        connect_timeout: Duration::from_secs(2),
        reconnection_delay: Duration::from_millis(50),
        reconnection_delay_max: Duration::from_millis(200),
        ..ChannelConfig::new(url)
    }
}

fn join(
    url: &str,
    room: &str,
    name: &str,
) -> (Session<WsChannel>, UnboundedReceiver<SessionEvent>) {
    let mut session = Session::connect(config(url), room, name).unwrap();
    let events = session.take_event_rx().unwrap();
    (session, events)
}

/// Drive `session` until it publishes an event matching `pred`.
async fn wait_for<C: Channel>(
    session: &mut Session<C>,
    events: &mut UnboundedReceiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut ended = false;
    loop {
        while let Ok(event) = events.try_recv() {
            if pred(&event) {
                return event;
            }
        }
        if ended {
            panic!("session ended before the expected event");
        }
        match timeout_at(deadline, session.process_next()).await {
            Ok(true) => {}
            Ok(false) => ended = true,
            Err(_) => panic!("timed out waiting for session event"),
        }
    }
}

fn member_count(n: usize) -> impl FnMut(&SessionEvent) -> bool {
    move |event| matches!(event, SessionEvent::MembershipChanged(members) if members.len() == n)
}

#[tokio::test]
async fn test_session_connects_and_joins() {
    let url = start_relay().await;
    let (mut alice, mut events) = join(&url, "r1", "Alice");
    assert_eq!(alice.connection_state(), ConnectionState::Connecting);

    wait_for(&mut alice, &mut events, member_count(1)).await;

    assert_eq!(alice.connection_state(), ConnectionState::Connected);
    let own_id = alice.participant_id().cloned().unwrap();
    assert_eq!(
        alice.members().to_vec(),
        vec![Participant::new(own_id, "Alice")]
    );
}

#[tokio::test]
async fn test_late_joiner_receives_document() {
    let url = start_relay().await;

    let (mut alice, mut alice_events) = join(&url, "r1", "Alice");
    wait_for(&mut alice, &mut alice_events, member_count(1)).await;
    alice.set_document("fn main() {}").unwrap();

    let (mut bob, mut bob_events) = join(&url, "r1", "Bob");
    wait_for(&mut bob, &mut bob_events, member_count(2)).await;

    // Alice learns about Bob and hands him the document
    let joined = wait_for(&mut alice, &mut alice_events, |e| {
        matches!(e, SessionEvent::MemberJoined(_))
    })
    .await;
    assert!(matches!(joined, SessionEvent::MemberJoined(p) if p.display_name == "Bob"));

    let received = wait_for(&mut bob, &mut bob_events, |e| {
        matches!(e, SessionEvent::DocumentReceived(_))
    })
    .await;
    assert_eq!(received, SessionEvent::DocumentReceived("fn main() {}".into()));
    assert_eq!(bob.document(), Some("fn main() {}"));

    // Bob leaves; Alice sees him go
    bob.close();
    let left = wait_for(&mut alice, &mut alice_events, |e| {
        matches!(e, SessionEvent::MemberLeft(_))
    })
    .await;
    assert!(matches!(left, SessionEvent::MemberLeft(p) if p.display_name == "Bob"));
    assert_eq!(alice.members().len(), 1);
}

#[tokio::test]
async fn test_rooms_do_not_leak() {
    let url = start_relay().await;

    let (mut alice, mut alice_events) = join(&url, "r1", "Alice");
    wait_for(&mut alice, &mut alice_events, member_count(1)).await;

    let (mut carol, mut carol_events) = join(&url, "r2", "Carol");
    wait_for(&mut carol, &mut carol_events, member_count(1)).await;

    // A second member in r1 is the next thing Alice hears about
    let (mut bob, mut bob_events) = join(&url, "r1", "Bob");
    wait_for(&mut bob, &mut bob_events, member_count(2)).await;

    let changed = wait_for(&mut alice, &mut alice_events, |e| {
        matches!(e, SessionEvent::MembershipChanged(_))
    })
    .await;
    let SessionEvent::MembershipChanged(members) = changed else {
        unreachable!()
    };
    let names: Vec<&str> = members.iter().map(|p| p.display_name.as_str()).collect();
    assert_eq!(names, vec!["Alice", "Bob"]);
}

#[tokio::test]
async fn test_connection_refused_fails_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let (mut session, mut events) = join(&url, "r1", "Alice");
    let failed = wait_for(&mut session, &mut events, |e| {
        matches!(e, SessionEvent::Failed(_))
    })
    .await;
    assert!(matches!(failed, SessionEvent::Failed(TransportError::ConnectError(_))));

    // Reconnection attempts that race the teardown have no effect
    assert!(session.is_closed());
    assert!(!session.process_next().await);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::Failed(_)));
    }
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_timeout() {
    // Accepts TCP but never answers the WebSocket upgrade
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let channel = WsChannel::new(ChannelConfig {
        connect_timeout: Duration::from_millis(200),
        ..ChannelConfig::new(url)
    });
    let mut session = Session::open(channel, "r1", "Alice").unwrap();
    let mut events = session.take_event_rx().unwrap();

    let failed = wait_for(&mut session, &mut events, |e| {
        matches!(e, SessionEvent::Failed(_))
    })
    .await;
    match failed {
        SessionEvent::Failed(TransportError::ConnectError(reason)) => {
            assert!(reason.contains("timed out"), "unexpected reason: {reason}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    drop(listener);
}
