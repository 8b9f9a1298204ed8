//! Call value objects

use serde::{Deserialize, Serialize};

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// INVITE received from the server
    Inbound,
    /// INVITE sent by this endpoint
    Outbound,
}

/// Call state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// INVITE sent or received, nothing heard back yet
    Initiating,
    /// Callee is being alerted
    Ringing,
    /// Call has been answered and media is flowing
    Answered,
    /// Local side put the call on hold
    OnHold,
    /// REFER in progress
    Transferring,
    /// Call has ended
    Ended(EndReason),
}

impl CallState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: &CallState) -> bool {
        use CallState::*;

        match (self, new_state) {
            (Initiating, Ringing) => true,
            // a 200 may arrive without any 18x
            (Initiating, Answered) => true,
            (Ringing, Answered) => true,

            (Answered, OnHold) => true,
            (Answered, Transferring) => true,
            (OnHold, Answered) => true,
            (OnHold, Transferring) => true,
            (Transferring, Answered) => true,
            (Transferring, OnHold) => true,

            (Ended(_), _) => false,
            (_, Ended(_)) => true,

            _ => false,
        }
    }

    /// Media has been negotiated for the call
    pub fn is_established(&self) -> bool {
        matches!(
            self,
            CallState::Answered | CallState::OnHold | CallState::Transferring
        )
    }
}

/// Reason for call ending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local hangup (BYE sent)
    LocalHangup,
    /// Remote hangup (BYE received)
    RemoteHangup,
    /// Inbound call rejected with 486
    Rejected,
    /// Outbound call refused by the remote side
    Declined(u16),
    /// Caller canceled before answer
    Canceled,
    /// Call handed over by REFER
    Transferred,
    /// Call failed
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_state_transitions() {
        let initiating = CallState::Initiating;
        assert!(initiating.can_transition_to(&CallState::Ringing));
        assert!(initiating.can_transition_to(&CallState::Answered));
        assert!(initiating.can_transition_to(&CallState::Ended(EndReason::Canceled)));
        assert!(!initiating.can_transition_to(&CallState::OnHold));

        let answered = CallState::Answered;
        assert!(answered.can_transition_to(&CallState::OnHold));
        assert!(answered.can_transition_to(&CallState::Transferring));
        assert!(CallState::OnHold.can_transition_to(&CallState::Answered));
    }

    #[test]
    fn test_invalid_state_transitions() {
        let ended = CallState::Ended(EndReason::LocalHangup);
        assert!(!ended.can_transition_to(&CallState::Answered));
        assert!(!ended.can_transition_to(&CallState::Ended(EndReason::RemoteHangup)));
        assert!(!CallState::Ringing.can_transition_to(&CallState::OnHold));
    }

    #[test]
    fn test_is_established() {
        assert!(CallState::OnHold.is_established());
        assert!(!CallState::Ringing.is_established());
        assert!(!CallState::Ended(EndReason::Transferred).is_established());
    }
}
