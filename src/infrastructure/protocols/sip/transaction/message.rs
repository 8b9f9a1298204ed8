//! Out-of-dialog MESSAGE (text/plain)

use super::{
    Core, Step, TransactionAction, TransactionContext, TransactionSnapshot,
    TransactionStateMachine, TransactionState, TransactionTimer,
};
use crate::domain::call::{dialog_branch, DialogIds, SequenceCounter};
use crate::infrastructure::protocols::sip::message::{SipMessage, SipMethod};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;

pub struct MessageTransaction {
    core: Core,
    ctx: TransactionContext,
    text: String,
}

impl MessageTransaction {
    pub fn new(ctx: TransactionContext, number: &str, text: impl Into<String>) -> Self {
        let ids = DialogIds::fresh(ctx.local_ip(), number);
        Self {
            core: Core::new(
                "message",
                SipMethod::Message,
                ids,
                Arc::new(SequenceCounter::new()),
            ),
            ctx,
            text: text.into(),
        }
    }

    fn request(&self) -> Bytes {
        self.ctx.builder.message(
            &self.core.ids,
            &self.core.branch,
            self.core.cseq,
            &self.text,
            self.core.auth_info.as_ref(),
        )
    }

    fn send_next(&mut self) -> Vec<TransactionAction> {
        self.core.cseq = self.core.counter.next();
        self.core.branch = dialog_branch(&self.core.ids.call_id);
        self.core.set_state(TransactionState::Sent);
        vec![TransactionAction::Send(self.request())]
    }
}

impl TransactionStateMachine for MessageTransaction {
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
                let uri = self.ctx.builder.invite_uri(&self.core.ids.remote_user);
                self.core.reauthorize(&self.ctx, &challenge, &uri);
                self.core.branch = dialog_branch(&self.core.ids.call_id);
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
            (TransactionTimer::Retry, TransactionState::RetryWait) => {
                self.core.restart_dialog(&self.ctx);
                self.send_next()
            }
            _ => Vec::new(),
        }
    }
}
