//! In-dialog re-INVITE toggling hold (`sendonly`) and resume (`sendrecv`)

use super::{
    Core, Step, TransactionAction, TransactionContext, TransactionSnapshot,
    TransactionStateMachine, TransactionState, TransactionTimer,
};
use crate::domain::call::{dialog_branch, DialogIds, SequenceCounter};
use crate::infrastructure::protocols::sip::message::{SipMessage, SipMethod};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

pub struct HoldTransaction {
    core: Core,
    ctx: TransactionContext,
    sdp: String,
}

impl HoldTransaction {
    /// `ids` must carry the peer tag of the established dialog
    pub fn new(
        ctx: TransactionContext,
        ids: DialogIds,
        counter: Arc<SequenceCounter>,
        sdp: String,
    ) -> Self {
        Self {
            core: Core::new("hold", SipMethod::Invite, ids, counter),
            ctx,
            sdp,
        }
    }

    fn uri(&self) -> String {
        self.ctx.builder.in_dialog_uri(&self.core.ids.remote_user)
    }

    fn request(&self) -> Bytes {
        self.ctx.builder.invite(
            &self.uri(),
            &self.core.ids,
            &self.core.branch,
            self.core.cseq,
            &self.sdp,
            self.core.auth_info.as_ref(),
        )
    }

    fn send(&mut self) -> Vec<TransactionAction> {
        self.core.branch = dialog_branch(&self.core.ids.call_id);
        self.core.set_state(TransactionState::Sent);
        vec![TransactionAction::Send(self.request())]
    }

    /// The re-INVITE never uses CSeq 1, which belongs to the initial INVITE
    fn take_cseq(&mut self) {
        let mut cseq = self.core.counter.next();
        while cseq < 2 {
            cseq = self.core.counter.next();
        }
        self.core.cseq = cseq;
    }

    fn ack(&self, response: &SipMessage, success: bool) -> TransactionAction {
        let uri = self.uri();
        let mut ids = self.core.ids.clone();
        if let Some(tag) = response.to().and_then(|to| to.tag) {
            ids.remote_tag = Some(tag);
        }
        let (branch, auth) = if success {
            (
                dialog_branch(&ids.call_id),
                self.core
                    .auth_info
                    .as_ref()
                    .map(|a| a.reauthorize(self.ctx.digest.as_ref(), "ACK", &uri)),
            )
        } else {
            (self.core.branch.clone(), self.core.auth_info.clone())
        };
        TransactionAction::Send(self.ctx.builder.ack(
            &uri,
            &ids,
            &branch,
            self.core.cseq,
            auth.as_ref(),
        ))
    }

    /// Transfer progress reported by the peer while the call is held
    fn observe_notify(&mut self, message: &SipMessage) {
        if message.method() != Some(SipMethod::Notify) || !self.core.same_dialog(message) {
            return;
        }
        if let Some(status) = message.notify_status() {
            debug!("{} progress {}", self.core.ids.call_id, status.code);
            self.core.refer_progress = Some(status.code);
            self.core.publish();
        }
    }
}

impl TransactionStateMachine for HoldTransaction {
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
        self.take_cseq();
        self.send()
    }

    fn update_response(&mut self, message: &SipMessage) -> Vec<TransactionAction> {
        use TransactionState::*;

        if message.is_request() {
            self.observe_notify(message);
            return Vec::new();
        }

        let state = self.core.state;
        match self.core.classify(message, &self.ctx) {
            Step::Ignore => Vec::new(),
            Step::Challenge(challenge) => {
                let ack = self.ack(message, false);
                let uri = self.uri();
                self.core.reauthorize(&self.ctx, &challenge, &uri);
                self.core.branch = dialog_branch(&self.core.ids.call_id);
                self.core.set_state(Authorizing);
                vec![ack, TransactionAction::Send(self.request())]
            }
            Step::Fail(status) => {
                let ack = self.ack(message, false);
                self.core.fail(status);
                vec![ack]
            }
            Step::Retry(delay) => {
                let mut actions = vec![self.ack(message, false)];
                actions.extend(self.core.retry_wait(delay));
                actions
            }
            Step::Other(100) if matches!(state, Sent | Authorizing) => {
                self.core.set_state(Provisional);
                Vec::new()
            }
            Step::Other(200..=299) if state.is_pending() => {
                let ack = self.ack(message, true);
                self.core.final_response = Some(message.clone());
                self.core.set_state(Complete);
                vec![ack]
            }
            Step::Other(200..=299) if state == Complete => vec![self.ack(message, true)],
            Step::Other(status) if status >= 300 && state.is_pending() => {
                let ack = self.ack(message, false);
                self.core.fail(status);
                vec![ack]
            }
            Step::Other(status) if status >= 300 => vec![self.ack(message, false)],
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
