//! Initial document delivery to newly joined participants.
//!
//! Whoever already holds a non-empty document when someone joins sends it
//! to them in a `codesync` addressed to the joiner. Every existing member
//! may do so; the joiner keeps whichever copy arrives last. Content is the
//! same in every copy, so duplicates are harmless.
//!
//! [`HandoffPolicy::LowestParticipant`] trades that redundancy for a single
//! sender: only the existing member with the smallest participant ID sends.

use crate::membership::RoomMembership;
use crate::protocol::{CodeSync, ParticipantId};

/// Which existing members send the document to a joiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandoffPolicy {
    /// Every member holding a document sends it.
    #[default]
    EveryMember,
    /// Only the member with the lowest participant ID sends it.
    ///
    /// The election ignores whether that member holds a document. If it
    /// has none yet (its own handoff is still in flight), nobody sends and
    /// the joiner starts empty.
    LowestParticipant,
}

/// Holds the local document snapshot and decides when to ship it.
#[derive(Debug, Clone, Default)]
pub struct DocumentHandoff {
    policy: HandoffPolicy,
    snapshot: Option<String>,
}

impl DocumentHandoff {
    pub fn new(policy: HandoffPolicy) -> Self {
        Self {
            policy,
            snapshot: None,
        }
    }

    pub fn policy(&self) -> HandoffPolicy {
        self.policy
    }

    /// Record the caller's current document text.
    pub fn set_local(&mut self, text: impl Into<String>) {
        self.snapshot = Some(text.into());
    }

    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    /// Build the `codesync` for `joined`, if we should send one.
    ///
    /// `members` is the membership after the join was applied; `local` is
    /// our own ID when known.
    pub fn offer_for(
        &self,
        joined: &ParticipantId,
        local: Option<&ParticipantId>,
        members: &RoomMembership,
    ) -> Option<CodeSync> {
        let code = self.snapshot.as_deref().filter(|code| !code.is_empty())?;
        if local == Some(joined) {
            return None;
        }

        if self.policy == HandoffPolicy::LowestParticipant {
            let local = local?;
            let elected = members.ids().filter(|id| *id != joined).min();
            if elected != Some(local) {
                return None;
            }
        }

        Some(CodeSync::to(joined.clone(), code))
    }

    /// Apply an incoming `codesync`, overwriting the snapshot.
    ///
    /// Returns the new text, or `None` when the handoff names a different
    /// participant than `local`.
    pub fn receive(&mut self, sync: CodeSync, local: Option<&ParticipantId>) -> Option<String> {
        if let (Some(target), Some(own)) = (sync.socket_id.as_ref(), local) {
            if target != own {
                log::debug!("Ignoring codesync addressed to {target}");
                return None;
            }
        }
        self.snapshot = Some(sync.code.clone());
        Some(sync.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Participant;

    fn room(ids: &[&str]) -> RoomMembership {
        let mut members = RoomMembership::new();
        members.replace(ids.iter().map(|id| Participant::new(*id, id.to_uppercase())).collect());
        members
    }

    #[test]
    fn test_no_offer_without_document() {
        let handoff = DocumentHandoff::default();
        let members = room(&["a", "b"]);
        assert!(handoff.offer_for(&"b".into(), Some(&"a".into()), &members).is_none());
    }

    #[test]
    fn test_no_offer_for_empty_document() {
        let mut handoff = DocumentHandoff::default();
        handoff.set_local("");
        let members = room(&["a", "b"]);
        assert!(handoff.offer_for(&"b".into(), Some(&"a".into()), &members).is_none());
    }

    #[test]
    fn test_offer_addressed_to_joiner() {
        let mut handoff = DocumentHandoff::default();
        handoff.set_local("fn main() {}");
        let members = room(&["a", "b"]);

        let sync = handoff.offer_for(&"b".into(), Some(&"a".into()), &members).unwrap();
        assert_eq!(sync.code, "fn main() {}");
        assert_eq!(sync.socket_id, Some("b".into()));
    }

    #[test]
    fn test_never_offer_to_self() {
        let mut handoff = DocumentHandoff::default();
        handoff.set_local("text");
        let members = room(&["a"]);
        assert!(handoff.offer_for(&"a".into(), Some(&"a".into()), &members).is_none());
    }

    #[test]
    fn test_every_member_policy_sends_from_all() {
        let mut handoff = DocumentHandoff::new(HandoffPolicy::EveryMember);
        handoff.set_local("text");
        let members = room(&["a", "c", "b"]);

        assert!(handoff.offer_for(&"b".into(), Some(&"a".into()), &members).is_some());
        assert!(handoff.offer_for(&"b".into(), Some(&"c".into()), &members).is_some());
    }

    #[test]
    fn test_lowest_participant_policy_elects_one() {
        let mut handoff = DocumentHandoff::new(HandoffPolicy::LowestParticipant);
        handoff.set_local("text");
        // "a" joins; existing members are "b" and "c"
        let members = room(&["b", "c", "a"]);

        assert!(handoff.offer_for(&"a".into(), Some(&"b".into()), &members).is_some());
        assert!(handoff.offer_for(&"a".into(), Some(&"c".into()), &members).is_none());
    }

    #[test]
    fn test_lowest_participant_requires_identity() {
        let mut handoff = DocumentHandoff::new(HandoffPolicy::LowestParticipant);
        handoff.set_local("text");
        let members = room(&["a", "b"]);
        assert!(handoff.offer_for(&"b".into(), None, &members).is_none());
    }

    #[test]
    fn test_lowest_participant_without_document_leaves_joiner_empty() {
        // "b" is elected but holds nothing; "c" has text and stays quiet
        let elected = DocumentHandoff::new(HandoffPolicy::LowestParticipant);
        let mut other = DocumentHandoff::new(HandoffPolicy::LowestParticipant);
        other.set_local("text");
        let members = room(&["b", "c", "d"]);

        assert!(elected.offer_for(&"d".into(), Some(&"b".into()), &members).is_none());
        assert!(other.offer_for(&"d".into(), Some(&"c".into()), &members).is_none());
    }

    #[test]
    fn test_receive_overwrites_unconditionally() {
        let mut handoff = DocumentHandoff::default();
        handoff.set_local("mine");

        let first = handoff.receive(CodeSync::to("b".into(), "theirs"), Some(&"b".into()));
        assert_eq!(first.as_deref(), Some("theirs"));

        // A duplicate from another member changes nothing observable
        let dup = handoff.receive(CodeSync::to("b".into(), "theirs"), Some(&"b".into()));
        assert_eq!(dup.as_deref(), Some("theirs"));
        assert_eq!(handoff.snapshot(), Some("theirs"));
    }

    #[test]
    fn test_receive_ignores_misaddressed() {
        let mut handoff = DocumentHandoff::default();
        handoff.set_local("mine");

        let result = handoff.receive(CodeSync::to("c".into(), "theirs"), Some(&"b".into()));
        assert!(result.is_none());
        assert_eq!(handoff.snapshot(), Some("mine"));
    }

    #[test]
    fn test_receive_untargeted() {
        let mut handoff = DocumentHandoff::default();
        let sync = CodeSync {
            code: "x".into(),
            socket_id: None,
        };
        assert_eq!(handoff.receive(sync, Some(&"b".into())).as_deref(), Some("x"));
    }
}
