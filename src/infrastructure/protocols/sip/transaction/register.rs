//! REGISTER transaction with periodic refresh

use super::{
    Core, Step, TransactionAction, TransactionContext, TransactionSnapshot,
    TransactionStateMachine, TransactionState, TransactionTimer,
};
use crate::domain::call::{registration_branch, DialogIds, SequenceCounter};
use crate::infrastructure::protocols::sip::message::{SipMessage, SipMethod};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

pub struct RegisterTransaction {
    core: Core,
    ctx: TransactionContext,
    expires: u32,
}

impl RegisterTransaction {
    pub fn new(ctx: TransactionContext, expires: u32) -> Self {
        let ids = DialogIds::fresh(ctx.local_ip(), ctx.username());
        Self {
            core: Core::new(
                "register",
                SipMethod::Register,
                ids,
                Arc::new(SequenceCounter::new()),
            ),
            ctx,
            expires,
        }
    }

    fn request(&self) -> Bytes {
        self.ctx.builder.register(
            &self.core.ids,
            &self.core.branch,
            self.core.cseq,
            self.expires,
            self.core.auth_info.as_ref(),
        )
    }

    fn send_next(&mut self, state: TransactionState) -> Vec<TransactionAction> {
        self.core.cseq = self.core.counter.next();
        self.core.branch = registration_branch();
        self.core.set_state(state);
        vec![TransactionAction::Send(self.request())]
    }

    /// Granted expiry minus the safety margin
    fn refresh_after(&self, response: &SipMessage) -> Duration {
        let granted = response
            .header("Expires")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(self.expires as u64);
        Duration::from_secs(granted).saturating_sub(self.ctx.refresh_margin)
    }
}

impl TransactionStateMachine for RegisterTransaction {
    fn name(&self) -> &'static str {
        self.core.name
    }

    fn state(&self) -> TransactionState {
        self.core.state
    }

    fn snapshots(&self) -> watch::Receiver<TransactionSnapshot> {
        self.core.subscribe()
    }

    fn start(&mut self) -> Vec<TransactionAction> {
        info!("Registering {} at {}", self.ctx.username(), self.ctx.builder.register_uri());
        self.send_next(TransactionState::Sent)
    }

    fn update_response(&mut self, message: &SipMessage) -> Vec<TransactionAction> {
        match self.core.classify(message, &self.ctx) {
            Step::Ignore => Vec::new(),
            Step::Challenge(challenge) => {
                let uri = self.ctx.builder.register_uri();
                self.core.reauthorize(&self.ctx, &challenge, &uri);
                self.core.branch = registration_branch();
                self.core.set_state(TransactionState::Authorizing);
                vec![TransactionAction::Send(self.request())]
            }
            Step::Fail(status) => self.core.fail(status),
            Step::Retry(delay) => self.core.retry_wait(delay),
            Step::Other(200..=299) if self.core.state.is_pending() => {
                let after = self.refresh_after(message);
                info!("Registered {}, refreshing in {:?}", self.ctx.username(), after);
                self.core.set_state(TransactionState::Complete);
                vec![TransactionAction::Schedule {
                    after,
                    timer: TransactionTimer::Refresh,
                }]
            }
            Step::Other(status) if status >= 300 && self.core.state.is_pending() => {
                self.core.fail(status)
            }
            Step::Other(_) => Vec::new(),
        }
    }

    fn on_timer(&mut self, timer: TransactionTimer) -> Vec<TransactionAction> {
        match (timer, self.core.state) {
            (TransactionTimer::Refresh, TransactionState::Complete) => {
                debug!("Refreshing registration {}", self.core.ids.call_id);
                if let Some(auth) = &self.core.auth_info {
                    let uri = self.ctx.builder.register_uri();
                    self.core.auth_info =
                        Some(auth.reauthorize(self.ctx.digest.as_ref(), "REGISTER", &uri));
                }
                self.send_next(TransactionState::Sent)
            }
            (TransactionTimer::Retry, TransactionState::RetryWait) => {
                self.core.restart_dialog(&self.ctx);
                self.send_next(TransactionState::Sent)
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    fn started() -> (RegisterTransaction, SipMessage) {
        let mut register = RegisterTransaction::new(context(), 300);
        let actions = register.start();
        let request = sent(&actions).remove(0);
        (register, request)
    }

    #[test]
    fn test_challenge_then_ok_schedules_refresh() {
        let (mut register, request) = started();
        assert_eq!(register.state(), TransactionState::Sent);
        assert_eq!(request.cseq().unwrap().number, 1);

        let actions = register.update_response(&reply(&request, 401, &[CHALLENGE]));
        assert_eq!(register.state(), TransactionState::Authorizing);
        let authorized = sent(&actions).remove(0);
        assert_eq!(authorized.cseq().unwrap().number, 2);
        assert_ne!(authorized.branch(), request.branch());
        let header = authorized.header("Authorization").unwrap();
        assert!(header.contains("nonce=\"N1\""));
        assert!(header.contains("response=\"REGISTER-N1\""));

        let actions = register.update_response(&reply(&authorized, 200, &["Expires: 120"]));
        assert_eq!(register.state(), TransactionState::Complete);
        let timers = scheduled(&actions);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].1, TransactionTimer::Refresh);
        assert!(timers[0].0 < Duration::from_secs(120));
        assert_eq!(timers[0].0, Duration::from_secs(115));
    }

    #[test]
    fn test_refresh_reuses_dialog_with_new_cseq() {
        let (mut register, request) = started();
        register.update_response(&reply(&request, 200, &[]));

        let actions = register.on_timer(TransactionTimer::Refresh);
        assert_eq!(register.state(), TransactionState::Sent);
        let refresh = sent(&actions).remove(0);
        assert_eq!(refresh.call_id(), request.call_id());
        assert_eq!(refresh.cseq().unwrap().number, 2);

        // refresh timer is inert outside Complete
        assert!(register.on_timer(TransactionTimer::Refresh).is_empty());
    }

    #[test]
    fn test_rejected_refresh_fails() {
        let (mut register, request) = started();
        register.update_response(&reply(&request, 200, &[]));

        let refresh = sent(&register.on_timer(TransactionTimer::Refresh)).remove(0);
        let actions = register.update_response(&reply(&refresh, 403, &[]));
        assert!(actions.is_empty());
        assert_eq!(register.state(), TransactionState::Failed);
        assert_eq!(register.snapshots().borrow().last_status, Some(403));
    }

    #[test]
    fn test_repeated_challenge_with_same_nonce_fails() {
        let (mut register, request) = started();
        let actions = register.update_response(&reply(&request, 401, &[CHALLENGE]));
        let authorized = sent(&actions).remove(0);

        let actions = register.update_response(&reply(&authorized, 401, &[CHALLENGE]));
        assert!(actions.is_empty());
        assert_eq!(register.state(), TransactionState::Failed);
    }

    #[test]
    fn test_stale_nonce_is_answered_again() {
        let (mut register, request) = started();
        let actions = register.update_response(&reply(&request, 401, &[CHALLENGE]));
        let authorized = sent(&actions).remove(0);

        let actions = register.update_response(&reply(&authorized, 401, &[STALE_CHALLENGE]));
        assert_eq!(register.state(), TransactionState::Authorizing);
        let again = sent(&actions).remove(0);
        assert_eq!(again.cseq().unwrap().number, 3);
        assert!(again.header("Authorization").unwrap().contains("nonce=\"N2\""));
    }

    #[test]
    fn test_forbidden_fails() {
        let (mut register, request) = started();
        register.update_response(&reply(&request, 403, &[]));
        assert_eq!(register.state(), TransactionState::Failed);
        assert_eq!(register.snapshots().borrow().last_status, Some(403));
    }

    #[test]
    fn test_challenge_for_old_cseq_is_ignored() {
        let (mut register, request) = started();
        let actions = register.update_response(&reply(&request, 401, &[CHALLENGE]));
        assert!(!actions.is_empty());

        // retransmitted 401 for CSeq 1
        assert!(register
            .update_response(&reply(&request, 401, &[CHALLENGE]))
            .is_empty());
        assert_eq!(register.state(), TransactionState::Authorizing);
    }

    #[test]
    fn test_server_error_retries_with_fresh_dialog() {
        let (mut register, request) = started();
        let actions = register.update_response(&reply(&request, 503, &["Retry-After: 2"]));
        assert_eq!(register.state(), TransactionState::RetryWait);
        assert_eq!(
            scheduled(&actions),
            vec![(Duration::from_secs(2), TransactionTimer::Retry)]
        );

        let actions = register.on_timer(TransactionTimer::Retry);
        assert_eq!(register.state(), TransactionState::Sent);
        let retry = sent(&actions).remove(0);
        assert_ne!(retry.call_id(), request.call_id());
        assert_eq!(retry.cseq().unwrap().number, 1);
        assert!(retry.header("Authorization").is_none());
    }

    #[test]
    fn test_snapshots_follow_state() {
        let (mut register, request) = started();
        let snapshots = register.snapshots();
        register.update_response(&reply(&request, 200, &[]));
        let snapshot = snapshots.borrow().clone();
        assert_eq!(snapshot.state, TransactionState::Complete);
        assert_eq!(snapshot.ids.call_id, request.call_id().unwrap());
        assert_eq!(snapshot.cseq, 1);
    }
}
