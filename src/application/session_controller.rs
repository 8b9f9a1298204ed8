//! Session controller
//!
//! Turns call-level operations into SIP transactions, owns the call legs and
//! their media sessions, answers inbound requests and reports progress as
//! [`PhoneEvent`]s. Cheap to clone; every clone drives the same account.

use crate::application::events::PhoneEvent;
use crate::config::Config;
use crate::domain::call::{dialog_branch, CallDirection, CallState, Dialog, EndReason};
use crate::domain::DomainError;
use crate::error::VoipError;
use crate::infrastructure::media::{Codec, DtmfCallback, DtmfTone, MediaSession, MediaSessionConfig};
use crate::infrastructure::protocols::sip::transaction::{
    self, Attachment, DeregisterTransaction, HoldTransaction, InviteTransaction,
    MessageTransaction, PollPolicy, RegisterTransaction, SubscribeTransaction,
    TransactionContext, TransactionHandle, TransactionOutcome, TransactionSnapshot,
    TransactionState, TransferTransaction,
};
use crate::infrastructure::protocols::sip::{
    DispatcherHandle, InboundRequest, Md5Digest, MediaDirection, Replaces, RequestBuilder,
    SdpSession, SipError, SipMessage, SipMethod, SipRequest, TransactionDispatcher, Transport,
    UdpTransport,
};
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest wait for an outbound call to be answered once it is alerting
const ANSWER_TIMEOUT: Duration = Duration::from_secs(120);

/// INVITE we received and still have to answer
struct InboundInvite {
    request: SipRequest,
    source: SocketAddr,
}

struct CallLeg {
    dialog: Dialog,
    rtp_port: u16,
    media: Option<Arc<MediaSession>>,
    invite: Option<InboundInvite>,
    /// INVITE machine of an outbound call that has not been answered yet
    pending: Option<TransactionHandle>,
}

impl CallLeg {
    fn new(dialog: Dialog, rtp_port: u16) -> Self {
        Self {
            dialog,
            rtp_port,
            media: None,
            invite: None,
            pending: None,
        }
    }
}

struct Inner {
    config: Config,
    local_ip: IpAddr,
    ctx: TransactionContext,
    dispatcher: DispatcherHandle,
    /// Keyed by the Call-ID reported to the front end
    calls: Mutex<HashMap<String, CallLeg>>,
    registration: Mutex<Option<TransactionHandle>>,
    events: mpsc::UnboundedSender<PhoneEvent>,
}

/// One SIP account: registration, calls and messaging
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
    dispatcher: Arc<Mutex<Option<TransactionDispatcher>>>,
}

impl SessionController {
    /// Bind the SIP socket, resolve the server and start dispatching
    pub async fn start(
        mut config: Config,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PhoneEvent>), VoipError> {
        config.validate().map_err(VoipError::Config)?;
        let local_ip = parse_local_ip(&config)?;

        let transport =
            UdpTransport::bind(SocketAddr::new(local_ip, config.account.local_port)).await?;
        config.account.local_port = transport.local_addr()?.port();

        let server = resolve(&config.account.server_host, config.account.server_port).await?;
        Self::with_transport(config, Arc::new(transport), server)
    }

    /// Start on an already bound transport
    pub fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        server: SocketAddr,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PhoneEvent>), VoipError> {
        let local_ip = parse_local_ip(&config)?;

        let mut ctx = TransactionContext::new(
            Arc::new(RequestBuilder::new(config.account.local_account())),
            Arc::new(Md5Digest::new(config.account.credentials())),
        );
        config.transactions.apply(&mut ctx);

        let (dispatcher, inbound) = TransactionDispatcher::start(transport, server);
        let (events, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            local_ip,
            ctx,
            dispatcher: dispatcher.handle(),
            calls: Mutex::new(HashMap::new()),
            registration: Mutex::new(None),
            events,
        });
        tokio::spawn(inbound_loop(inner.clone(), inbound));
        info!(
            "Session controller for {} started against {}",
            inner.config.account.username, server
        );

        Ok((
            Self {
                inner,
                dispatcher: Arc::new(Mutex::new(Some(dispatcher))),
            },
            events_rx,
        ))
    }

    /// REGISTER; the binding is refreshed until `unregister` or `shutdown`
    pub async fn register(&self) -> TransactionOutcome {
        let inner = &self.inner;
        let expires = inner.config.account.expiry_secs;
        let outcome = transaction::run(
            &inner.dispatcher,
            Box::new(RegisterTransaction::new(inner.ctx.clone(), expires)),
            PollPolicy::REGISTER,
            transaction::completed,
            Attachment::WhileRegistered,
        )
        .await;

        if outcome.success {
            let previous = inner.registration.lock().await.take();
            if let Some(previous) = previous {
                inner.dispatcher.detach(previous.id);
            }
            *inner.registration.lock().await = outcome.handle.clone();
            if let Some(handle) = outcome.handle.clone() {
                tokio::spawn(watch_registration(inner.clone(), handle));
            }
            inner.emit(PhoneEvent::Registered { expires });
        } else {
            inner.emit(PhoneEvent::RegistrationFailed {
                status: outcome.status,
            });
        }
        outcome
    }

    /// Remove the binding; `None` when not registered
    pub async fn unregister(&self) -> Option<TransactionOutcome> {
        let inner = &self.inner;
        let handle = inner.registration.lock().await.take()?;
        inner.dispatcher.detach(handle.id);

        let snapshot = handle.snapshot();
        let outcome = transaction::run(
            &inner.dispatcher,
            Box::new(DeregisterTransaction::new(inner.ctx.clone(), &snapshot)),
            PollPolicy::DEREGISTER,
            transaction::completed,
            Attachment::Transient,
        )
        .await;
        Some(outcome)
    }

    /// Drop the message-summary subscription
    pub async fn subscribe_remove(&self) -> TransactionOutcome {
        let inner = &self.inner;
        transaction::run(
            &inner.dispatcher,
            Box::new(SubscribeTransaction::new(inner.ctx.clone())),
            PollPolicy::SUBSCRIBE,
            transaction::completed,
            Attachment::Transient,
        )
        .await
    }

    pub async fn send_message(&self, number: &str, text: &str) -> TransactionOutcome {
        let inner = &self.inner;
        transaction::run(
            &inner.dispatcher,
            Box::new(MessageTransaction::new(inner.ctx.clone(), number, text)),
            PollPolicy::MESSAGE,
            transaction::completed,
            Attachment::Transient,
        )
        .await
    }

    /// Place a call
    ///
    /// Returns as soon as the callee shows signs of life. When that happens
    /// before the answer, the rest of the call setup continues in the
    /// background and is reported through `Answered` or `CallEnded`.
    pub async fn call(&self, number: &str) -> Result<TransactionOutcome, VoipError> {
        let inner = &self.inner;
        let mut dialog = Dialog::outbound(&inner.config.account.local_ip, number);
        let rtp_port = inner.pick_rtp_port();
        let offer = inner.sdp(rtp_port, &inner.config.media.codecs, MediaDirection::SendRecv);

        let outcome = transaction::run(
            &inner.dispatcher,
            Box::new(InviteTransaction::new(
                inner.ctx.clone(),
                dialog.ids().clone(),
                dialog.invite_counter(),
                offer,
            )),
            PollPolicy::INVITE,
            transaction::answered_or_alerting,
            Attachment::UntilFinal,
        )
        .await;

        dialog.rebind(outcome.call_id.clone(), outcome.tags.local.clone());
        let key = outcome.call_id.clone();

        if !outcome.success {
            inner.emit(PhoneEvent::CallEnded {
                call_id: key,
                reason: end_reason(outcome.status),
            });
            return Ok(outcome);
        }

        let mut leg = CallLeg::new(dialog, rtp_port);
        if outcome.state == TransactionState::Complete {
            if let Err(e) = inner
                .establish(
                    &key,
                    &mut leg,
                    outcome.tags.remote.clone(),
                    outcome.final_response.as_ref(),
                )
                .await
            {
                inner.abandon(&key, &leg, &e);
                return Err(e);
            }
            inner.calls.lock().await.insert(key, leg);
            return Ok(outcome);
        }

        let ringing = outcome.state == TransactionState::Ringing;
        if ringing {
            inner.mark(&mut leg.dialog, CallState::Ringing);
            inner.emit(PhoneEvent::Ringing {
                call_id: key.clone(),
            });
        }
        leg.pending = outcome.handle.clone();
        inner.calls.lock().await.insert(key.clone(), leg);
        if let Some(handle) = outcome.handle.clone() {
            tokio::spawn(watch_invite(inner.clone(), key, handle, ringing));
        }
        Ok(outcome)
    }

    /// Accept an incoming call and start media
    pub async fn answer(&self, call_id: &str) -> Result<(), VoipError> {
        let inner = &self.inner;
        let mut calls = inner.calls.lock().await;
        let leg = calls
            .get_mut(call_id)
            .ok_or_else(|| DomainError::NotFound(call_id.to_string()))?;
        if leg.media.is_some() {
            return Err(DomainError::InvalidOperation(format!("{} already answered", call_id)).into());
        }
        let (request, source) = match &leg.invite {
            Some(invite) => (invite.request.clone(), invite.source),
            None => {
                return Err(
                    DomainError::InvalidOperation(format!("{} is not an incoming call", call_id))
                        .into(),
                )
            }
        };

        let offer = std::str::from_utf8(request.body())
            .ok()
            .and_then(SdpSession::parse)
            .ok_or_else(|| DomainError::InvalidOperation("INVITE carries no SDP".to_string()))?;
        let codec = offer
            .negotiate(&inner.config.media.codecs)
            .ok_or_else(|| DomainError::InvalidOperation("no common codec".to_string()))?;
        let remote = offer
            .audio_endpoint()
            .ok_or_else(|| DomainError::InvalidOperation("offer has no audio".to_string()))?;

        let answer = inner.sdp(leg.rtp_port, &[codec.payload_type()], MediaDirection::SendRecv);
        let response = inner
            .ctx
            .builder
            .answer(&request, &leg.dialog.ids().local_tag, &answer)?;
        inner.dispatcher.send_to(response, source);

        let contact = SipMessage::Request(request).contact();
        leg.dialog.confirm(None, contact);
        inner.start_media(call_id, leg, codec, remote).await
    }

    /// Decline an incoming call with 486
    pub async fn reject(&self, call_id: &str) -> Result<(), VoipError> {
        let inner = &self.inner;
        let leg = inner
            .calls
            .lock()
            .await
            .remove(call_id)
            .ok_or_else(|| DomainError::NotFound(call_id.to_string()))?;
        if let Some(invite) = &leg.invite {
            let response = inner
                .ctx
                .builder
                .busy(&invite.request, &leg.dialog.ids().local_tag)?;
            inner.dispatcher.send_to(response, invite.source);
        }
        inner.finish(call_id.to_string(), leg, EndReason::Rejected).await;
        Ok(())
    }

    /// End a call whatever its stage: CANCEL, 486 or BYE
    pub async fn hangup(&self, call_id: &str) -> Result<(), VoipError> {
        let inner = &self.inner;
        let leg = inner
            .calls
            .lock()
            .await
            .remove(call_id)
            .ok_or_else(|| DomainError::NotFound(call_id.to_string()))?;

        let reason = if let Some(handle) = &leg.pending {
            inner.send_cancel(&handle.snapshot());
            inner.dispatcher.detach(handle.id);
            EndReason::Canceled
        } else if leg.media.is_none() && leg.dialog.direction() == CallDirection::Inbound {
            if let Some(invite) = &leg.invite {
                let response = inner
                    .ctx
                    .builder
                    .busy(&invite.request, &leg.dialog.ids().local_tag)?;
                inner.dispatcher.send_to(response, invite.source);
            }
            EndReason::Rejected
        } else {
            inner.send_bye(&leg);
            EndReason::LocalHangup
        };

        inner.finish(call_id.to_string(), leg, reason).await;
        Ok(())
    }

    /// CANCEL an outbound call that has not been answered
    pub async fn cancel(&self, call_id: &str) -> Result<(), VoipError> {
        let pending = {
            let calls = self.inner.calls.lock().await;
            let leg = calls
                .get(call_id)
                .ok_or_else(|| DomainError::NotFound(call_id.to_string()))?;
            leg.pending.is_some()
        };
        if !pending {
            return Err(
                DomainError::InvalidOperation(format!("{} is not being set up", call_id)).into(),
            );
        }
        self.hangup(call_id).await
    }

    pub async fn hold(&self, call_id: &str) -> Result<TransactionOutcome, VoipError> {
        self.set_hold(call_id, true).await
    }

    pub async fn unhold(&self, call_id: &str) -> Result<TransactionOutcome, VoipError> {
        self.set_hold(call_id, false).await
    }

    async fn set_hold(&self, call_id: &str, hold: bool) -> Result<TransactionOutcome, VoipError> {
        let inner = &self.inner;
        let (ids, counter, sdp, media) = {
            let calls = inner.calls.lock().await;
            let leg = calls
                .get(call_id)
                .ok_or_else(|| DomainError::NotFound(call_id.to_string()))?;
            let media = leg.media.clone().ok_or_else(|| {
                DomainError::InvalidOperation(format!("{} is not established", call_id))
            })?;
            let direction = if hold {
                MediaDirection::SendOnly
            } else {
                MediaDirection::SendRecv
            };
            let sdp = inner.sdp(leg.rtp_port, &[media.codec().payload_type()], direction);
            (leg.dialog.ids().clone(), leg.dialog.invite_counter(), sdp, media)
        };

        let outcome = transaction::run(
            &inner.dispatcher,
            Box::new(HoldTransaction::new(inner.ctx.clone(), ids, counter, sdp)),
            PollPolicy::HOLD,
            transaction::completed,
            Attachment::Transient,
        )
        .await;

        if outcome.success {
            media.set_hold(hold).await;
            if let Some(leg) = inner.calls.lock().await.get_mut(call_id) {
                let state = if hold {
                    CallState::OnHold
                } else {
                    CallState::Answered
                };
                inner.mark(&mut leg.dialog, state);
            }
        }
        Ok(outcome)
    }

    /// Blind transfer, or attended when `replaces` names another call
    ///
    /// On success the transferred call is hung up.
    pub async fn transfer(
        &self,
        call_id: &str,
        target: &str,
        replaces: Option<&str>,
    ) -> Result<TransactionOutcome, VoipError> {
        let inner = &self.inner;
        let (ids, counter, replaces) = {
            let mut calls = inner.calls.lock().await;
            let replaces = match replaces {
                Some(other) => {
                    let other = calls
                        .get(other)
                        .ok_or_else(|| DomainError::NotFound(other.to_string()))?;
                    let ids = other.dialog.ids();
                    Some(Replaces {
                        call_id: ids.call_id.clone(),
                        to_tag: ids.remote_tag.clone().unwrap_or_default(),
                        from_tag: ids.local_tag.clone(),
                    })
                }
                None => None,
            };
            let leg = calls
                .get_mut(call_id)
                .ok_or_else(|| DomainError::NotFound(call_id.to_string()))?;
            if !leg.dialog.state().is_established() {
                return Err(DomainError::InvalidOperation(format!(
                    "{} is not established",
                    call_id
                ))
                .into());
            }
            inner.mark(&mut leg.dialog, CallState::Transferring);
            (leg.dialog.ids().clone(), leg.dialog.invite_counter(), replaces)
        };

        let outcome = transaction::run(
            &inner.dispatcher,
            Box::new(TransferTransaction::new(
                inner.ctx.clone(),
                ids,
                counter,
                target,
                replaces,
            )),
            PollPolicy::TRANSFER,
            transaction::completed,
            Attachment::Transient,
        )
        .await;

        if let Some(status) = outcome.refer_progress {
            inner.emit(PhoneEvent::TransferProgress {
                call_id: call_id.to_string(),
                status,
            });
        }

        let mut calls = inner.calls.lock().await;
        if outcome.success {
            if let Some(leg) = calls.remove(call_id) {
                inner.send_bye(&leg);
                inner
                    .finish(call_id.to_string(), leg, EndReason::Transferred)
                    .await;
            }
        } else if let Some(leg) = calls.get_mut(call_id) {
            let held = leg.media.as_ref().is_some_and(|m| m.is_on_hold());
            let state = if held {
                CallState::OnHold
            } else {
                CallState::Answered
            };
            inner.mark(&mut leg.dialog, state);
        }
        Ok(outcome)
    }

    /// Send one DTMF digit on an established call
    pub async fn send_dtmf(&self, call_id: &str, digit: char) -> Result<bool, VoipError> {
        let tone = DtmfTone::from_char(digit).ok_or_else(|| {
            DomainError::InvalidOperation(format!("not a DTMF digit: {}", digit))
        })?;
        let media = self
            .media(call_id)
            .await
            .ok_or_else(|| DomainError::NotFound(call_id.to_string()))?;
        Ok(media.send_dtmf(&tone.payload()).await)
    }

    /// Media of an established call, for audio I/O
    pub async fn media(&self, call_id: &str) -> Option<Arc<MediaSession>> {
        self.inner
            .calls
            .lock()
            .await
            .get(call_id)
            .and_then(|leg| leg.media.clone())
    }

    pub async fn call_state(&self, call_id: &str) -> Option<CallState> {
        self.inner
            .calls
            .lock()
            .await
            .get(call_id)
            .map(|leg| leg.dialog.state().clone())
    }

    pub async fn active_calls(&self) -> Vec<String> {
        self.inner.calls.lock().await.keys().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner.dispatcher.is_running()
    }

    /// Hang up every call, deregister, unsubscribe and stop dispatching
    pub async fn shutdown(&self) {
        info!("Shutting down session controller");
        for call_id in self.active_calls().await {
            if let Err(e) = self.hangup(&call_id).await {
                debug!("Hangup of {} during shutdown: {}", call_id, e);
            }
        }
        if let Some(outcome) = self.unregister().await {
            debug!("Deregistration finished in {:?}", outcome.state);
        }
        self.subscribe_remove().await;

        let dispatcher = self.dispatcher.lock().await.take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.shutdown().await;
        }
    }
}

impl Inner {
    fn emit(&self, event: PhoneEvent) {
        debug!("Event {}", event.event_type());
        if self.events.send(event).is_err() {
            debug!("No listener for phone events");
        }
    }

    fn mark(&self, dialog: &mut Dialog, state: CallState) {
        if let Err(e) = dialog.transition(state) {
            debug!("{}", e);
        }
    }

    /// Close a leg already taken out of the call map
    async fn finish(&self, key: String, mut leg: CallLeg, reason: EndReason) {
        self.mark(&mut leg.dialog, CallState::Ended(reason.clone()));
        if let Some(media) = &leg.media {
            media.stop().await;
        }
        info!("Call {} ended: {:?}", key, reason);
        self.emit(PhoneEvent::CallEnded {
            call_id: key,
            reason,
        });
    }

    fn pick_rtp_port(&self) -> u16 {
        even_port(self.config.media.rtp_port_min, self.config.media.rtp_port_max)
    }

    fn sdp(&self, port: u16, payload_types: &[u8], direction: MediaDirection) -> String {
        SdpSession::create_audio_session(
            &self.config.account.username,
            self.local_ip,
            port,
            payload_types,
            direction,
        )
        .to_string()
    }

    /// Read the answer of an outbound call and start media
    async fn establish(
        &self,
        key: &str,
        leg: &mut CallLeg,
        remote_tag: Option<String>,
        response: Option<&SipMessage>,
    ) -> Result<(), VoipError> {
        let response = response
            .ok_or_else(|| DomainError::InvalidOperation(format!("{} answered without 2xx", key)))?;
        let answer = std::str::from_utf8(response.body())
            .ok()
            .and_then(SdpSession::parse)
            .ok_or_else(|| DomainError::InvalidOperation("answer carries no SDP".to_string()))?;
        let codec = answer
            .negotiate(&self.config.media.codecs)
            .ok_or_else(|| DomainError::InvalidOperation("no common codec".to_string()))?;
        let remote = answer
            .audio_endpoint()
            .ok_or_else(|| DomainError::InvalidOperation("answer has no audio".to_string()))?;

        leg.dialog.confirm(remote_tag, response.contact());
        self.start_media(key, leg, codec, remote).await
    }

    async fn start_media(
        &self,
        key: &str,
        leg: &mut CallLeg,
        codec: Codec,
        remote: SocketAddr,
    ) -> Result<(), VoipError> {
        let media_config = &self.config.media;
        let mut config = MediaSessionConfig::new(
            SocketAddr::new(self.local_ip, leg.rtp_port),
            remote,
            codec.payload_type(),
        );
        config.frame_interval = media_config.frame_interval();
        config.keepalive_interval = media_config.keepalive_interval();
        config.receive_timeout = media_config.receive_timeout();

        let events = self.events.clone();
        let call_id = key.to_string();
        let on_dtmf: DtmfCallback = Arc::new(move |digit| {
            let _ = events.send(PhoneEvent::Dtmf {
                call_id: call_id.clone(),
                digit,
            });
        });

        let media = MediaSession::start(config, Some(on_dtmf)).await?;
        media.send_rtcp().await;
        leg.media = Some(Arc::new(media));
        self.mark(&mut leg.dialog, CallState::Answered);

        info!("Call {} answered with {} to {}", key, codec, remote);
        self.emit(PhoneEvent::Answered {
            call_id: key.to_string(),
            codec,
        });
        Ok(())
    }

    /// Tear down an answered call whose media could not be set up
    fn abandon(&self, key: &str, leg: &CallLeg, error: &VoipError) {
        warn!("Dropping call {}: {}", key, error);
        self.send_bye(leg);
        self.emit(PhoneEvent::CallEnded {
            call_id: key.to_string(),
            reason: EndReason::Failed(error.to_string()),
        });
    }

    fn send_bye(&self, leg: &CallLeg) {
        let ids = leg.dialog.ids();
        let cseq = leg.dialog.invite_counter().next();
        let branch = dialog_branch(&ids.call_id);
        self.dispatcher
            .send(self.ctx.builder.bye(ids, &branch, cseq, None));
    }

    fn send_cancel(&self, snapshot: &TransactionSnapshot) {
        self.dispatcher.send(
            self.ctx
                .builder
                .cancel(&snapshot.ids, &snapshot.branch, snapshot.cseq),
        );
    }

    fn reply_ok(&self, request: &SipRequest, source: SocketAddr) -> Result<(), SipError> {
        let response = self.ctx.builder.ok(request)?;
        self.dispatcher.send_to(response, source);
        Ok(())
    }

    async fn handle_request(&self, inbound: InboundRequest) -> Result<(), VoipError> {
        let InboundRequest { request, source } = inbound;
        let Some(method) = request.method() else {
            return Ok(());
        };
        let message = SipMessage::Request(request.clone());
        let call_id = message.call_id().unwrap_or_default();
        debug!("Inbound {} for {}", method, call_id);

        match method {
            SipMethod::Options => self.reply_ok(&request, source)?,
            SipMethod::Notify => {
                self.reply_ok(&request, source)?;
                if let Some(status) = message.notify_status() {
                    let calls = self.calls.lock().await;
                    if let Some(key) = find_call(&calls, &call_id) {
                        self.emit(PhoneEvent::TransferProgress {
                            call_id: key,
                            status: status.code,
                        });
                    }
                }
            }
            SipMethod::Message => {
                self.reply_ok(&request, source)?;
                self.emit(PhoneEvent::MessageReceived {
                    from: message.from().and_then(|f| f.user).unwrap_or_default(),
                    text: String::from_utf8_lossy(request.body()).into_owned(),
                });
            }
            SipMethod::Bye => {
                self.reply_ok(&request, source)?;
                let leg = {
                    let mut calls = self.calls.lock().await;
                    find_call(&calls, &call_id).and_then(|key| calls.remove_entry(&key))
                };
                if let Some((key, leg)) = leg {
                    self.finish(key, leg, EndReason::RemoteHangup).await;
                }
            }
            SipMethod::Cancel => {
                self.reply_ok(&request, source)?;
                let leg = {
                    let mut calls = self.calls.lock().await;
                    find_call(&calls, &call_id).and_then(|key| calls.remove_entry(&key))
                };
                if let Some((key, leg)) = leg {
                    if let Some(invite) = &leg.invite {
                        let response = self
                            .ctx
                            .builder
                            .request_terminated(&invite.request, &leg.dialog.ids().local_tag)?;
                        self.dispatcher.send_to(response, invite.source);
                    }
                    self.finish(key, leg, EndReason::Canceled).await;
                }
            }
            SipMethod::Invite => self.incoming_invite(request, &message, source).await?,
            SipMethod::Ack => {}
            other => debug!("Ignoring inbound {}", other),
        }
        Ok(())
    }

    async fn incoming_invite(
        &self,
        request: SipRequest,
        message: &SipMessage,
        source: SocketAddr,
    ) -> Result<(), VoipError> {
        let call_id = message.call_id().unwrap_or_default();
        let mut calls = self.calls.lock().await;

        if let Some(key) = find_call(&calls, &call_id) {
            let leg = &calls[&key];
            let local_tag = leg.dialog.ids().local_tag.clone();
            let response = match &leg.media {
                // peer re-INVITE: keep our media as it is
                Some(media) => {
                    let sdp = self.sdp(
                        leg.rtp_port,
                        &[media.codec().payload_type()],
                        MediaDirection::SendRecv,
                    );
                    self.ctx.builder.answer(&request, &local_tag, &sdp)?
                }
                None => self.ctx.builder.ringing(&request, &local_tag)?,
            };
            self.dispatcher.send_to(response, source);
            return Ok(());
        }

        let from = message.from();
        let remote_user = from
            .as_ref()
            .and_then(|f| f.user.clone())
            .unwrap_or_default();
        let mut dialog = Dialog::inbound(&call_id, from.and_then(|f| f.tag), &remote_user);
        let ringing = self.ctx.builder.ringing(&request, &dialog.ids().local_tag)?;
        self.dispatcher.send_to(ringing, source);
        self.mark(&mut dialog, CallState::Ringing);

        let mut leg = CallLeg::new(dialog, self.pick_rtp_port());
        leg.invite = Some(InboundInvite { request, source });
        calls.insert(call_id.clone(), leg);

        info!("Incoming call {} from {}", call_id, remote_user);
        self.emit(PhoneEvent::IncomingCall {
            call_id,
            from: remote_user,
        });
        Ok(())
    }
}

/// Key of the call whose dialog uses `call_id`
fn find_call(calls: &HashMap<String, CallLeg>, call_id: &str) -> Option<String> {
    calls
        .iter()
        .find(|(_, leg)| leg.dialog.call_id() == call_id)
        .map(|(key, _)| key.clone())
}

fn end_reason(status: Option<u16>) -> EndReason {
    match status {
        Some(status) if status >= 300 => EndReason::Declined(status),
        Some(status) => EndReason::Failed(format!("no final answer after {}", status)),
        None => EndReason::Failed("no response".to_string()),
    }
}

/// Random even port in `min..=max`
fn even_port(min: u16, max: u16) -> u16 {
    let low = min.saturating_add(min & 1);
    let port = rand::thread_rng().gen_range(low.min(max)..=max) & !1;
    port.max(low)
}

fn parse_local_ip(config: &Config) -> Result<IpAddr, VoipError> {
    config
        .account
        .local_ip
        .parse()
        .map_err(|_| VoipError::Config(format!("invalid local_ip {}", config.account.local_ip)))
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, SipError> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| SipError::TransportError(format!("cannot resolve {}", host)))
}

async fn inbound_loop(inner: Arc<Inner>, mut inbound: mpsc::UnboundedReceiver<InboundRequest>) {
    while let Some(request) = inbound.recv().await {
        if let Err(e) = inner.handle_request(request).await {
            warn!("Failed to handle inbound request: {}", e);
        }
    }
    debug!("Inbound request loop finished");
}

/// Follow an outbound INVITE from early success to its final response
/// Report a binding lost when a refresh REGISTER fails
async fn watch_registration(inner: Arc<Inner>, mut handle: TransactionHandle) {
    let Some(failed) = handle
        .wait_for(|snapshot| snapshot.state == TransactionState::Failed)
        .await
    else {
        return;
    };

    {
        let mut registration = inner.registration.lock().await;
        // replaced or removed meanwhile
        if registration.as_ref().map(|current| current.id) != Some(handle.id) {
            return;
        }
        registration.take();
    }
    inner.dispatcher.detach(handle.id);
    warn!("Registration refresh failed with {:?}", failed.last_status);
    inner.emit(PhoneEvent::RegistrationFailed {
        status: failed.last_status,
    });
}

async fn watch_invite(
    inner: Arc<Inner>,
    key: String,
    mut handle: TransactionHandle,
    mut ringing: bool,
) {
    let deadline = Instant::now() + ANSWER_TIMEOUT;
    let last = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let alerting = ringing;
        let waited = handle
            .wait_until(remaining, move |s| {
                s.state.is_terminal() || (!alerting && s.state == TransactionState::Ringing)
            })
            .await;
        let Some(snapshot) = waited else {
            break None;
        };
        if snapshot.state.is_terminal() {
            break Some(snapshot);
        }
        ringing = true;
        if let Some(leg) = inner.calls.lock().await.get_mut(&key) {
            inner.mark(&mut leg.dialog, CallState::Ringing);
        }
        inner.emit(PhoneEvent::Ringing {
            call_id: key.clone(),
        });
    };
    inner.dispatcher.detach(handle.id);

    let mut calls = inner.calls.lock().await;
    // gone when the call was canceled meanwhile
    let Some(mut leg) = calls.remove(&key) else {
        return;
    };
    leg.pending = None;

    match last {
        Some(snapshot) if snapshot.state == TransactionState::Complete => {
            leg.dialog
                .rebind(snapshot.ids.call_id.clone(), snapshot.ids.local_tag.clone());
            let established = inner
                .establish(
                    &key,
                    &mut leg,
                    snapshot.ids.remote_tag.clone(),
                    snapshot.final_response.as_ref(),
                )
                .await;
            match established {
                Ok(()) => {
                    calls.insert(key, leg);
                }
                Err(e) => inner.abandon(&key, &leg, &e),
            }
        }
        Some(snapshot) => {
            inner
                .finish(key, leg, end_reason(snapshot.last_status))
                .await;
        }
        None => {
            inner.send_cancel(&handle.snapshot());
            inner
                .finish(key, leg, EndReason::Failed("no answer".to_string()))
                .await;
        }
    }
}
