//! SIP dialog identity and per-dialog sequence counters

use crate::domain::call::value_object::{CallDirection, CallState};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// `{uuid}@{local_ip}`
pub fn new_call_id(local_ip: &str) -> String {
    format!("{}@{}", Uuid::new_v4().simple(), local_ip)
}

/// Eight random bytes, hex encoded
pub fn new_tag() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; 8]>())
}

/// Branch for REGISTER, de-REGISTER and SUBSCRIBE
pub fn registration_branch() -> String {
    format!(
        "z9hG4bK-d87543-{}-1--d87543-",
        hex::encode(rand::thread_rng().gen::<[u8; 8]>())
    )
}

/// Branch for INVITE, MESSAGE, REFER and in-dialog requests
pub fn dialog_branch(call_id: &str) -> String {
    let stem: String = call_id
        .chars()
        .filter(|c| *c != '@' && *c != '.')
        .take(25)
        .collect();
    format!(
        "z9hG4bK{}{}",
        stem,
        hex::encode(rand::thread_rng().gen::<[u8; 4]>())
    )
}

/// CSeq counter shared by every request of one method family in a dialog
///
/// Holds the last number handed out. Numbers are never reused unless the
/// counter is explicitly reset for a fresh dialog.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU32);

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(last: u32) -> Self {
        Self(AtomicU32::new(last))
    }

    /// Take the next number
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Last number handed out
    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Identifiers a request needs to be placed inside a dialog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogIds {
    pub call_id: String,
    /// Our tag (From in our requests)
    pub local_tag: String,
    /// Peer tag (To in our requests), known once the peer answered
    pub remote_tag: Option<String>,
    /// User part of the peer
    pub remote_user: String,
}

impl DialogIds {
    /// Fresh identifiers for a new out-of-dialog request
    pub fn fresh(local_ip: &str, remote_user: &str) -> Self {
        Self {
            call_id: new_call_id(local_ip),
            local_tag: new_tag(),
            remote_tag: None,
            remote_user: remote_user.to_string(),
        }
    }
}

/// One call leg
#[derive(Debug, Clone)]
pub struct Dialog {
    ids: DialogIds,
    direction: CallDirection,
    state: CallState,
    /// Contact of the peer
    remote_target: Option<String>,
    /// Shared by INVITE, re-INVITE, REFER and BYE
    invite_counter: Arc<SequenceCounter>,
    started_at: DateTime<Utc>,
    answered_at: Option<DateTime<Utc>>,
}

impl Dialog {
    /// Dialog for a call we place
    pub fn outbound(local_ip: &str, remote_user: &str) -> Self {
        Self::new(DialogIds::fresh(local_ip, remote_user), CallDirection::Outbound)
    }

    /// Dialog for a received INVITE; `remote_tag` is the caller's From tag
    pub fn inbound(call_id: &str, remote_tag: Option<String>, remote_user: &str) -> Self {
        Self::new(
            DialogIds {
                call_id: call_id.to_string(),
                local_tag: new_tag(),
                remote_tag,
                remote_user: remote_user.to_string(),
            },
            CallDirection::Inbound,
        )
    }

    fn new(ids: DialogIds, direction: CallDirection) -> Self {
        Self {
            ids,
            direction,
            state: CallState::Initiating,
            remote_target: None,
            invite_counter: Arc::new(SequenceCounter::new()),
            started_at: Utc::now(),
            answered_at: None,
        }
    }

    pub fn ids(&self) -> &DialogIds {
        &self.ids
    }

    pub fn call_id(&self) -> &str {
        &self.ids.call_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn remote_target(&self) -> Option<&str> {
        self.remote_target.as_deref()
    }

    pub fn invite_counter(&self) -> Arc<SequenceCounter> {
        self.invite_counter.clone()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn answered_at(&self) -> Option<DateTime<Utc>> {
        self.answered_at
    }

    /// Replace identifiers after an INVITE retry rebuilt the dialog
    pub fn rebind(&mut self, call_id: String, local_tag: String) {
        self.ids.call_id = call_id;
        self.ids.local_tag = local_tag;
    }

    /// Record what the peer's final answer told us
    pub fn confirm(&mut self, remote_tag: Option<String>, remote_target: Option<String>) {
        if remote_tag.is_some() {
            self.ids.remote_tag = remote_tag;
        }
        if remote_target.is_some() {
            self.remote_target = remote_target;
        }
    }

    pub fn transition(&mut self, new_state: CallState) -> Result<()> {
        if !self.state.can_transition_to(&new_state) {
            return Err(DomainError::InvalidStateTransition(format!(
                "{:?} -> {:?} for {}",
                self.state, new_state, self.ids.call_id
            )));
        }
        if new_state == CallState::Answered && self.answered_at.is_none() {
            self.answered_at = Some(Utc::now());
        }
        self.state = new_state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::value_object::EndReason;

    #[test]
    fn test_identifier_shapes() {
        let call_id = new_call_id("192.168.1.10");
        let (id, host) = call_id.split_once('@').unwrap();
        assert_eq!(id.len(), 32);
        assert_eq!(host, "192.168.1.10");

        let tag = new_tag();
        assert_eq!(tag.len(), 16);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(tag, new_tag());

        let branch = registration_branch();
        assert!(branch.starts_with("z9hG4bK-d87543-"));
        assert!(branch.ends_with("-1--d87543-"));
        assert_eq!(branch.len(), "z9hG4bK-d87543--1--d87543-".len() + 16);
    }

    #[test]
    fn test_dialog_branch_derives_from_call_id() {
        let branch = dialog_branch("ab.cd@10.0.0.1");
        assert!(branch.starts_with("z9hG4bKabcd10001"));
        assert!(!branch.contains('@'));
        assert_ne!(dialog_branch("ab.cd@10.0.0.1"), branch);

        let long = dialog_branch(&"x".repeat(60));
        assert_eq!(long.len(), "z9hG4bK".len() + 25 + 8);
    }

    #[test]
    fn test_sequence_counter_take_next() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.current(), 2);
        counter.reset();
        assert_eq!(counter.next(), 1);

        let wrapping = SequenceCounter::starting_at(u32::MAX);
        assert_eq!(wrapping.next(), 0);
    }

    #[test]
    fn test_dialog_lifecycle() {
        let mut dialog = Dialog::outbound("10.0.0.2", "200");
        assert_eq!(dialog.direction(), CallDirection::Outbound);
        assert!(dialog.ids().remote_tag.is_none());

        dialog.transition(CallState::Ringing).unwrap();
        dialog.confirm(Some("peer".into()), Some("sip:200@10.0.0.9".into()));
        dialog.transition(CallState::Answered).unwrap();
        assert!(dialog.answered_at().is_some());
        assert_eq!(dialog.ids().remote_tag.as_deref(), Some("peer"));
        assert_eq!(dialog.remote_target(), Some("sip:200@10.0.0.9"));

        dialog
            .transition(CallState::Ended(EndReason::LocalHangup))
            .unwrap();
        assert!(dialog.transition(CallState::Answered).is_err());
    }

    #[test]
    fn test_counter_is_shared() {
        let dialog = Dialog::inbound("x@y", Some("abc".into()), "100");
        let counter = dialog.invite_counter();
        counter.next();
        assert_eq!(dialog.invite_counter().current(), 1);
        assert_eq!(dialog.direction(), CallDirection::Inbound);
    }
}
