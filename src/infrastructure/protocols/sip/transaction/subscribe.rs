//! SUBSCRIBE removing a message-summary subscription

use super::{
    Core, Step, TransactionAction, TransactionContext, TransactionSnapshot,
    TransactionStateMachine, TransactionState, TransactionTimer,
};
use crate::domain::call::{registration_branch, DialogIds, SequenceCounter};
use crate::infrastructure::protocols::sip::message::{SipMessage, SipMethod};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;

pub struct SubscribeTransaction {
    core: Core,
    ctx: TransactionContext,
}

impl SubscribeTransaction {
    pub fn new(ctx: TransactionContext) -> Self {
        let ids = DialogIds::fresh(ctx.local_ip(), ctx.username());
        Self {
            core: Core::new(
                "subscribe",
                SipMethod::Subscribe,
                ids,
                Arc::new(SequenceCounter::new()),
            ),
            ctx,
        }
    }

    fn request(&self) -> Bytes {
        self.ctx.builder.subscribe_remove(
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

impl TransactionStateMachine for SubscribeTransaction {
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
                let uri = self.ctx.builder.subscribe_uri();
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
