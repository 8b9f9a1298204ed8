//! REFER (blind or attended) and its NOTIFY progress

use super::{
    Core, Step, TransactionAction, TransactionContext, TransactionSnapshot,
    TransactionStateMachine, TransactionState, TransactionTimer,
};
use crate::domain::call::{dialog_branch, DialogIds, SequenceCounter};
use crate::infrastructure::protocols::sip::builder::Replaces;
use crate::infrastructure::protocols::sip::message::{SipMessage, SipMethod};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub struct TransferTransaction {
    core: Core,
    ctx: TransactionContext,
    target: String,
    replaces: Option<Replaces>,
}

impl TransferTransaction {
    /// Blind transfer when `replaces` is `None`
    pub fn new(
        ctx: TransactionContext,
        ids: DialogIds,
        counter: Arc<SequenceCounter>,
        target: impl Into<String>,
        replaces: Option<Replaces>,
    ) -> Self {
        Self {
            core: Core::new("transfer", SipMethod::Refer, ids, counter),
            ctx,
            target: target.into(),
            replaces,
        }
    }

    fn request(&self) -> Bytes {
        self.ctx.builder.refer(
            &self.core.ids,
            &self.core.branch,
            self.core.cseq,
            &self.target,
            self.replaces.as_ref(),
            self.core.auth_info.as_ref(),
        )
    }

    fn send(&mut self) -> Vec<TransactionAction> {
        self.core.branch = dialog_branch(&self.core.ids.call_id);
        self.core.set_state(TransactionState::Sent);
        vec![TransactionAction::Send(self.request())]
    }

    /// Skips one number so the REFER never collides with a re-INVITE
    fn take_cseq(&mut self) {
        self.core.counter.next();
        self.core.cseq = self.core.counter.next();
    }

    fn observe_notify(&mut self, message: &SipMessage) {
        use TransactionState::*;

        if message.method() != Some(SipMethod::Notify) || !self.core.same_dialog(message) {
            return;
        }
        let Some(status) = message.notify_status() else {
            return;
        };
        self.core.refer_progress = Some(status.code);
        if !matches!(self.core.state, Sent | Authorizing | Provisional | Ringing) {
            self.core.publish();
            return;
        }
        match status.code {
            180..=199 => self.core.set_state(Ringing),
            200..=299 => {
                info!("Transfer of {} to {} succeeded", self.core.ids.call_id, self.target);
                self.core.set_state(Complete);
            }
            300.. => {
                self.core.fail(status.code);
            }
            _ => self.core.publish(),
        }
    }
}

impl TransactionStateMachine for TransferTransaction {
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
        info!("Transferring {} to {}", self.core.ids.call_id, self.target);
        self.take_cseq();
        self.send()
    }

    fn update_response(&mut self, message: &SipMessage) -> Vec<TransactionAction> {
        if message.is_request() {
            self.observe_notify(message);
            return Vec::new();
        }

        let state = self.core.state;
        match self.core.classify(message, &self.ctx) {
            Step::Ignore => Vec::new(),
            Step::Challenge(challenge) => {
                let uri = self.ctx.builder.in_dialog_uri(&self.core.ids.remote_user);
                self.core.reauthorize(&self.ctx, &challenge, &uri);
                self.core.branch = dialog_branch(&self.core.ids.call_id);
                self.core.set_state(TransactionState::Authorizing);
                vec![TransactionAction::Send(self.request())]
            }
            Step::Fail(status) => self.core.fail(status),
            Step::Retry(delay) => self.core.retry_wait(delay),
            Step::Other(200..=299)
                if matches!(state, TransactionState::Sent | TransactionState::Authorizing) =>
            {
                self.core.set_state(TransactionState::Provisional);
                Vec::new()
            }
            Step::Other(status) if status >= 300 && state.is_pending() => self.core.fail(status),
            Step::Other(_) => Vec::new(),
        }
    }

    fn on_timer(&mut self, timer: TransactionTimer) -> Vec<TransactionAction> {
        match (timer, self.core.state) {
            (TransactionTimer::Retry, TransactionState::RetryWait) => {
                self.take_cseq();
                self.send()
            }
            _ => Vec::new(),
        }
    }
}
