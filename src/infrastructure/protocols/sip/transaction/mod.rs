//! SIP Transaction Layer (client side)
//!
//! One state machine per outgoing request family. Machines own no sockets:
//! they react to responses and timers by returning [`TransactionAction`]s
//! that the dispatcher executes, and publish every state change through a
//! `watch` channel so callers can poll without locking.
//!
//! ## State shape
//! `Init(0) -> Sent(1) -> Authorizing(2) -> Provisional(3) -> Ringing(4)
//! -> RetryWait(5) -> Complete(6) | Failed(7)`

pub mod deregister;
pub mod hold;
pub mod invite;
pub mod message;
pub mod register;
pub mod subscribe;
pub mod transfer;

pub use deregister::DeregisterTransaction;
pub use hold::HoldTransaction;
pub use invite::InviteTransaction;
pub use message::MessageTransaction;
pub use register::RegisterTransaction;
pub use subscribe::SubscribeTransaction;
pub use transfer::TransferTransaction;

use super::auth::{AuthInfo, DigestAuth};
use super::builder::RequestBuilder;
use super::dispatcher::DispatcherHandle;
use super::message::{Challenge, SipMessage, SipMethod};
use crate::domain::call::{DialogIds, SequenceCounter};
use bytes::Bytes;
use metrics::counter;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifies a machine inside the dispatcher registry
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction state shared by every method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransactionState {
    Init = 0,
    Sent = 1,
    Authorizing = 2,
    Provisional = 3,
    Ringing = 4,
    RetryWait = 5,
    Complete = 6,
    Failed = 7,
}

impl TransactionState {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Complete | TransactionState::Failed)
    }

    /// Waiting on the server for a response
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            TransactionState::Sent
                | TransactionState::Authorizing
                | TransactionState::Provisional
                | TransactionState::Ringing
        )
    }
}

/// Timers a machine can arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    /// Resend after a 500/503
    Retry,
    /// Re-REGISTER before the binding expires
    Refresh,
}

/// Side effects requested by a machine
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionAction {
    /// Send a datagram to the SIP server
    Send(Bytes),
    /// Fire `timer` back into the machine after `after`
    Schedule {
        after: Duration,
        timer: TransactionTimer,
    },
}

/// Read-only view published on every change
#[derive(Debug, Clone)]
pub struct TransactionSnapshot {
    pub name: &'static str,
    pub state: TransactionState,
    pub ids: DialogIds,
    pub branch: String,
    pub cseq: u32,
    pub auth_info: Option<AuthInfo>,
    /// Last status code received on the matching CSeq
    pub last_status: Option<u16>,
    /// Latest sipfrag code seen in an in-dialog NOTIFY
    pub refer_progress: Option<u16>,
    /// 2xx that completed the transaction
    pub final_response: Option<SipMessage>,
}

/// Collaborators shared by all machines
#[derive(Clone)]
pub struct TransactionContext {
    pub builder: Arc<RequestBuilder>,
    pub digest: Arc<dyn DigestAuth>,
    pub retry_after_default: Duration,
    pub refresh_margin: Duration,
}

impl TransactionContext {
    pub fn new(builder: Arc<RequestBuilder>, digest: Arc<dyn DigestAuth>) -> Self {
        Self {
            builder,
            digest,
            retry_after_default: Duration::from_secs(5),
            refresh_margin: Duration::from_secs(5),
        }
    }

    pub fn local_ip(&self) -> &str {
        &self.builder.account().local_ip
    }

    pub fn username(&self) -> &str {
        &self.builder.account().username
    }
}

/// One SIP transaction, driven by the dispatcher
pub trait TransactionStateMachine: Send + Sync {
    fn name(&self) -> &'static str;

    fn state(&self) -> TransactionState;

    /// Receiver of state snapshots
    fn snapshots(&self) -> watch::Receiver<TransactionSnapshot>;

    /// Build and send the initial request
    fn start(&mut self) -> Vec<TransactionAction>;

    /// Offered every inbound message, in wire order
    fn update_response(&mut self, message: &SipMessage) -> Vec<TransactionAction>;

    fn on_timer(&mut self, timer: TransactionTimer) -> Vec<TransactionAction>;
}

/// Generic reading of a matched response
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Ignore,
    /// 401/407 that should be answered
    Challenge(Challenge),
    Fail(u16),
    Retry(Duration),
    /// Left to the method: 1xx, 2xx and finals outside the generic table
    Other(u16),
}

/// State and dialog bookkeeping common to all machines
pub(crate) struct Core {
    pub name: &'static str,
    pub method: SipMethod,
    pub state: TransactionState,
    pub ids: DialogIds,
    pub branch: String,
    pub cseq: u32,
    pub counter: Arc<SequenceCounter>,
    pub auth_info: Option<AuthInfo>,
    pub last_status: Option<u16>,
    pub refer_progress: Option<u16>,
    pub final_response: Option<SipMessage>,
    snapshot: watch::Sender<TransactionSnapshot>,
}

impl Core {
    pub fn new(
        name: &'static str,
        method: SipMethod,
        ids: DialogIds,
        counter: Arc<SequenceCounter>,
    ) -> Self {
        let initial = TransactionSnapshot {
            name,
            state: TransactionState::Init,
            ids: ids.clone(),
            branch: String::new(),
            cseq: counter.current(),
            auth_info: None,
            last_status: None,
            refer_progress: None,
            final_response: None,
        };
        let (snapshot, _) = watch::channel(initial);
        Self {
            name,
            method,
            state: TransactionState::Init,
            ids,
            branch: String::new(),
            cseq: counter.current(),
            counter,
            auth_info: None,
            last_status: None,
            refer_progress: None,
            final_response: None,
            snapshot,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TransactionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn publish(&self) {
        self.snapshot.send_replace(TransactionSnapshot {
            name: self.name,
            state: self.state,
            ids: self.ids.clone(),
            branch: self.branch.clone(),
            cseq: self.cseq,
            auth_info: self.auth_info.clone(),
            last_status: self.last_status,
            refer_progress: self.refer_progress,
            final_response: self.final_response.clone(),
        });
    }

    pub fn set_state(&mut self, state: TransactionState) {
        if self.state != state {
            debug!(
                "{} {} {:?} -> {:?}",
                self.name, self.ids.call_id, self.state, state
            );
        }
        self.state = state;
        self.publish();
    }

    /// Response to our current request: CSeq method and number plus Call-ID
    pub fn matches(&self, message: &SipMessage) -> bool {
        if !message.is_response() {
            return false;
        }
        let Some(cseq) = message.cseq() else {
            return false;
        };
        cseq.method == self.method
            && cseq.number == self.cseq
            && message.call_id().as_deref() == Some(self.ids.call_id.as_str())
    }

    /// In-dialog request carrying our Call-ID
    pub fn same_dialog(&self, message: &SipMessage) -> bool {
        message.is_request() && message.call_id().as_deref() == Some(self.ids.call_id.as_str())
    }

    pub fn classify(&mut self, message: &SipMessage, ctx: &TransactionContext) -> Step {
        if !self.matches(message) {
            return Step::Ignore;
        }
        let Some(status) = message.status() else {
            return Step::Ignore;
        };
        self.last_status = Some(status);

        match status {
            401 | 407 => match (self.state, message.challenge()) {
                (TransactionState::Sent, Some(challenge)) => Step::Challenge(challenge),
                (TransactionState::Authorizing, Some(challenge)) if challenge.stale => {
                    Step::Challenge(challenge)
                }
                (TransactionState::Sent | TransactionState::Authorizing, _) => {
                    warn!("{} {}: credentials rejected", self.name, self.ids.call_id);
                    Step::Fail(status)
                }
                _ => Step::Ignore,
            },
            400 | 403 if self.state.is_pending() => Step::Fail(status),
            500 | 503 if self.state.is_pending() => {
                let delay = message
                    .retry_after()
                    .map(Duration::from_secs)
                    .unwrap_or(ctx.retry_after_default);
                Step::Retry(delay)
            }
            _ => Step::Other(status),
        }
    }

    /// Take the next CSeq and answer `challenge`
    pub fn reauthorize(&mut self, ctx: &TransactionContext, challenge: &Challenge, uri: &str) {
        self.cseq = self.counter.next();
        self.auth_info = Some(AuthInfo::authorize(
            ctx.digest.as_ref(),
            challenge,
            self.method.as_str(),
            uri,
        ));
    }

    /// Replace the dialog with a fresh one after a 500/503
    pub fn restart_dialog(&mut self, ctx: &TransactionContext) {
        self.ids = DialogIds::fresh(ctx.local_ip(), &self.ids.remote_user);
        self.counter.reset();
        self.auth_info = None;
    }

    pub fn retry_wait(&mut self, delay: Duration) -> Vec<TransactionAction> {
        info!(
            "{} {}: server busy, retrying in {:?}",
            self.name, self.ids.call_id, delay
        );
        self.set_state(TransactionState::RetryWait);
        vec![TransactionAction::Schedule {
            after: delay,
            timer: TransactionTimer::Retry,
        }]
    }

    pub fn fail(&mut self, status: u16) -> Vec<TransactionAction> {
        info!("{} {} failed with {}", self.name, self.ids.call_id, status);
        self.last_status = Some(status);
        self.set_state(TransactionState::Failed);
        Vec::new()
    }
}

/// Bounded polling schedule of a `run` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl PollPolicy {
    pub const REGISTER: Self = Self::new(300, 30);
    pub const DEREGISTER: Self = Self::new(300, 35);
    pub const SUBSCRIBE: Self = Self::new(300, 20);
    pub const INVITE: Self = Self::new(500, 30);
    pub const HOLD: Self = Self::new(500, 6);
    pub const TRANSFER: Self = Self::new(500, 20);
    pub const MESSAGE: Self = Self::new(300, 20);

    pub const fn new(interval_ms: u64, max_polls: u32) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            max_polls,
        }
    }

    /// Longest time a `run` call can take
    pub fn budget(&self) -> Duration {
        self.interval * self.max_polls
    }
}

/// What happens to the machine once `run` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// Detached on return
    Transient,
    /// Stays attached after success so its refresh timer keeps running
    WhileRegistered,
    /// Stays attached after an early success until a final response
    UntilFinal,
}

/// Dialog tags reported to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogTags {
    pub local: String,
    pub remote: Option<String>,
}

/// Machine still attached after `run` returned
#[derive(Debug, Clone)]
pub struct TransactionHandle {
    pub id: TransactionId,
    snapshots: watch::Receiver<TransactionSnapshot>,
}

impl TransactionHandle {
    pub fn snapshot(&self) -> TransactionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Wait until `done` holds or `limit` elapses
    pub async fn wait_until<F>(&mut self, limit: Duration, done: F) -> Option<TransactionSnapshot>
    where
        F: FnMut(&TransactionSnapshot) -> bool,
    {
        match tokio::time::timeout(limit, self.snapshots.wait_for(done)).await {
            Ok(Ok(snapshot)) => Some(snapshot.clone()),
            _ => None,
        }
    }

    /// Wait for `done` with no limit; `None` once the machine is detached
    pub async fn wait_for<F>(&mut self, done: F) -> Option<TransactionSnapshot>
    where
        F: FnMut(&TransactionSnapshot) -> bool,
    {
        self.snapshots.wait_for(done).await.ok().map(|snapshot| snapshot.clone())
    }
}

/// Result of a `run` call
#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    pub success: bool,
    pub state: TransactionState,
    pub call_id: String,
    pub tags: DialogTags,
    pub auth_info: Option<AuthInfo>,
    /// Last status code received
    pub status: Option<u16>,
    pub final_response: Option<SipMessage>,
    pub refer_progress: Option<u16>,
    /// Present when the machine stays attached
    pub handle: Option<TransactionHandle>,
}

/// Attach `machine`, then poll its state until `accept` holds, it fails, or
/// the policy is exhausted
pub async fn run(
    dispatcher: &DispatcherHandle,
    machine: Box<dyn TransactionStateMachine>,
    policy: PollPolicy,
    accept: fn(TransactionState) -> bool,
    attachment: Attachment,
) -> TransactionOutcome {
    let id = TransactionId::new();
    let name = machine.name();
    let snapshots = machine.snapshots();
    dispatcher.attach(id, machine);

    let mut last = snapshots.borrow().clone();
    let mut success = false;
    for _ in 0..policy.max_polls {
        tokio::time::sleep(policy.interval).await;
        last = snapshots.borrow().clone();
        if accept(last.state) {
            success = true;
            break;
        }
        if last.state == TransactionState::Failed {
            break;
        }
    }

    let outcome = if success {
        "success"
    } else if last.state == TransactionState::Failed {
        "failure"
    } else {
        "timeout"
    };
    counter!("sip_transactions_total", "method" => name, "outcome" => outcome).increment(1);
    info!(
        "{} {} finished: {} in state {:?}",
        name, last.ids.call_id, outcome, last.state
    );

    let keep = success
        && match attachment {
            Attachment::Transient => false,
            Attachment::WhileRegistered => true,
            Attachment::UntilFinal => !last.state.is_terminal(),
        };
    let handle = if keep {
        Some(TransactionHandle { id, snapshots })
    } else {
        dispatcher.detach(id);
        None
    };

    TransactionOutcome {
        success,
        state: last.state,
        call_id: last.ids.call_id.clone(),
        tags: DialogTags {
            local: last.ids.local_tag.clone(),
            remote: last.ids.remote_tag.clone(),
        },
        auth_info: last.auth_info,
        status: last.last_status,
        final_response: last.final_response,
        refer_progress: last.refer_progress,
        handle,
    }
}

/// `run` acceptance for everything but INVITE
pub fn completed(state: TransactionState) -> bool {
    state == TransactionState::Complete
}

/// `run` acceptance for INVITE: any sign of life from the callee
pub fn answered_or_alerting(state: TransactionState) -> bool {
    matches!(
        state,
        TransactionState::Provisional | TransactionState::Ringing | TransactionState::Complete
    )
}
