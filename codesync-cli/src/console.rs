//! Terminal rendering of session notifications.

use codesync_collab::{ConnectionState, Participant, SessionEvent};

/// One printable line per session event.
pub fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::ConnectionStateChanged(state) => format!("[status] {}", status_label(*state)),
        SessionEvent::MemberJoined(p) => format!("[join] {} joined", p.display_name),
        SessionEvent::MemberLeft(p) => format!("[leave] {} left", p.display_name),
        SessionEvent::MembershipChanged(members) => {
            format!("[members] {} ({})", roster(members), members.len())
        }
        SessionEvent::DocumentReceived(code) => format!(
            "[document] received {} line(s), {} bytes",
            code.lines().count(),
            code.len()
        ),
        SessionEvent::Failed(e) => format!("[error] {e}"),
    }
}

fn status_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
    }
}

/// Comma-separated display names, in room order.
fn roster(members: &[Participant]) -> String {
    if members.is_empty() {
        return "nobody".to_string();
    }
    members
        .iter()
        .map(|p| p.display_name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
