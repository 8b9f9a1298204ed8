//! Initial INVITE of an outbound call
//!
//! Every final response is acknowledged. A 2xx gets an ACK in a new
//! transaction (fresh branch) and is re-ACKed when retransmitted; any other
//! final is ACKed on the INVITE's own branch and CSeq. After a challenge the
//! From tag is regenerated, and a 500/503 retry starts over in a brand new
//! dialog.

use super::{
    Core, Step, TransactionAction, TransactionContext, TransactionSnapshot,
    TransactionStateMachine, TransactionState, TransactionTimer,
};
use crate::domain::call::{dialog_branch, new_tag, DialogIds, SequenceCounter};
use crate::infrastructure::protocols::sip::message::{SipMessage, SipMethod};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub struct InviteTransaction {
    core: Core,
    ctx: TransactionContext,
    sdp: String,
}

impl InviteTransaction {
    /// `counter` is the dialog's INVITE counter and is reset on retry
    pub fn new(
        ctx: TransactionContext,
        ids: DialogIds,
        counter: Arc<SequenceCounter>,
        sdp: String,
    ) -> Self {
        Self {
            core: Core::new("invite", SipMethod::Invite, ids, counter),
            ctx,
            sdp,
        }
    }

    fn uri(&self) -> String {
        self.ctx.builder.invite_uri(&self.core.ids.remote_user)
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

    fn send_next(&mut self, state: TransactionState) -> Vec<TransactionAction> {
        self.core.cseq = self.core.counter.next();
        self.core.branch = dialog_branch(&self.core.ids.call_id);
        self.core.set_state(state);
        vec![TransactionAction::Send(self.request())]
    }

    /// ACK for a non-2xx final: same branch and CSeq, peer's To tag
    fn ack_failure(&self, response: &SipMessage) -> TransactionAction {
        let mut ids = self.core.ids.clone();
        ids.remote_tag = response.to().and_then(|to| to.tag);
        TransactionAction::Send(self.ctx.builder.ack(
            &self.uri(),
            &ids,
            &self.core.branch,
            self.core.cseq,
            self.core.auth_info.as_ref(),
        ))
    }

    /// ACK for a 2xx, sent as its own transaction
    fn ack_success(&self) -> TransactionAction {
        let uri = self.uri();
        let auth = self
            .core
            .auth_info
            .as_ref()
            .map(|auth| auth.reauthorize(self.ctx.digest.as_ref(), "ACK", &uri));
        TransactionAction::Send(self.ctx.builder.ack(
            &uri,
            &self.core.ids,
            &dialog_branch(&self.core.ids.call_id),
            self.core.cseq,
            auth.as_ref(),
        ))
    }
}

impl TransactionStateMachine for InviteTransaction {
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
        info!("Calling {} ({})", self.core.ids.remote_user, self.core.ids.call_id);
        self.send_next(TransactionState::Sent)
    }

    fn update_response(&mut self, message: &SipMessage) -> Vec<TransactionAction> {
        use TransactionState::*;

        let state = self.core.state;
        match self.core.classify(message, &self.ctx) {
            Step::Ignore => Vec::new(),
            Step::Challenge(challenge) => {
                let ack = self.ack_failure(message);
                self.core.ids.local_tag = new_tag();
                let uri = self.uri();
                self.core.reauthorize(&self.ctx, &challenge, &uri);
                self.core.branch = dialog_branch(&self.core.ids.call_id);
                self.core.set_state(Authorizing);
                vec![ack, TransactionAction::Send(self.request())]
            }
            Step::Fail(status) => {
                let ack = self.ack_failure(message);
                self.core.fail(status);
                vec![ack]
            }
            Step::Retry(delay) => {
                let ack = self.ack_failure(message);
                let mut actions = vec![ack];
                actions.extend(self.core.retry_wait(delay));
                actions
            }
            Step::Other(100) if matches!(state, Sent | Authorizing) => {
                self.core.set_state(Provisional);
                Vec::new()
            }
            Step::Other(180 | 183) if matches!(state, Sent | Authorizing | Provisional) => {
                self.core.set_state(Ringing);
                Vec::new()
            }
            Step::Other(200..=299) if state.is_pending() => {
                self.core.ids.remote_tag = message.to().and_then(|to| to.tag);
                self.core.final_response = Some(message.clone());
                let ack = self.ack_success();
                info!("Call {} answered", self.core.ids.call_id);
                self.core.set_state(Complete);
                vec![ack]
            }
            Step::Other(200..=299) if state == Complete => vec![self.ack_success()],
            Step::Other(status) if status >= 300 && state.is_pending() => {
                let ack = self.ack_failure(message);
                self.core.fail(status);
                vec![ack]
            }
            // retransmitted final
            Step::Other(status) if status >= 300 => vec![self.ack_failure(message)],
            Step::Other(_) => Vec::new(),
        }
    }

    fn on_timer(&mut self, timer: TransactionTimer) -> Vec<TransactionAction> {
        match (timer, self.core.state) {
            (TransactionTimer::Retry, TransactionState::RetryWait) => {
                self.core.restart_dialog(&self.ctx);
                self.send_next(TransactionState::Sent)
            }
            _ => Vec::new(),
        }
    }
}
