//! De-REGISTER (`Expires: 0`) of an existing binding

use super::{
    Core, Step, TransactionAction, TransactionContext, TransactionSnapshot,
    TransactionStateMachine, TransactionState, TransactionTimer,
};
use crate::domain::call::{registration_branch, SequenceCounter};
use crate::infrastructure::protocols::sip::message::{SipMessage, SipMethod};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;

pub struct DeregisterTransaction {
    core: Core,
    ctx: TransactionContext,
}

impl DeregisterTransaction {
    /// Continue the registration dialog described by `registration`,
    /// reusing its credentials
    pub fn new(ctx: TransactionContext, registration: &TransactionSnapshot) -> Self {
        let mut core = Core::new(
            "deregister",
            SipMethod::Register,
            registration.ids.clone(),
            Arc::new(SequenceCounter::starting_at(registration.cseq)),
        );
        core.auth_info = registration.auth_info.clone();
        Self { core, ctx }
    }

    fn request(&self) -> Bytes {
        self.ctx.builder.remove(
            &self.core.ids,
            &self.core.branch,
            self.core.cseq,
            self.core.auth_info.as_ref(),
        )
    }

    fn send_next(&mut self) -> Vec<TransactionAction> {
        self.core.cseq = self.core.counter.next();
        self.core.branch = registration_branch();
        self.core.set_state(TransactionState::Sent);
        vec![TransactionAction::Send(self.request())]
    }
}

impl TransactionStateMachine for DeregisterTransaction {
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
        self.send_next()
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
                self.core.set_state(TransactionState::Complete);
                Vec::new()
            }
            Step::Other(status) if status >= 300 && self.core.state.is_pending() => {
                self.core.fail(status)
            }
            Step::Other(_) => Vec::new(),
        }
    }

    fn on_timer(&mut self, timer: TransactionTimer) -> Vec<TransactionAction> {
        match (timer, self.core.state) {
            (TransactionTimer::Retry, TransactionState::RetryWait) => self.send_next(),
            _ => Vec::new(),
        }
    }
}
