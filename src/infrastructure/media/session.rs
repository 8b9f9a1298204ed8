//! Media Session
//!
//! One RTP stream per established call: a transmit loop that paces encoded
//! frames out of the outbound jitter buffer, a receive loop that feeds the
//! inbound jitter buffer, plus hold keepalives and DTMF.

use super::codec::{
    append_dtmf_trailer, decode, decode_telephone_event, encode, pcm_from_bytes, pcm_to_bytes,
    Codec, CodecError,
};
use super::rtp::{
    receiver_report_compound, Goodbye, JitterBuffer, JitterBufferConfig, PayloadKind, RtpError,
    RtpPacket, RtpSession, PT_TELEPHONE_EVENT, SILENCE_FILLER,
};
use bytes::Bytes;
use metrics::counter;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// PCM bytes read from the outbound buffer per frame (160 16-bit samples)
pub const FRAME_PCM_BYTES: usize = 320;
/// Silence queued ahead of the first transmitted frame
const FIRST_PACKET_SILENCE: usize = 1024;
const MAX_DATAGRAM: usize = 2048;

/// Invoked with the digit of each telephone-event that starts a new event
pub type DtmfCallback = Arc<dyn Fn(char) + Send + Sync>;

/// Media errors
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Unsupported codec: payload type {0}")]
    UnsupportedCodec(u8),
    #[error("Unsupported payload type: {0}")]
    UnsupportedPayload(u8),
    #[error("RTP error: {0}")]
    Rtp(#[from] RtpError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Media session parameters
#[derive(Debug, Clone)]
pub struct MediaSessionConfig {
    /// Address to bind the RTP socket to
    pub local: SocketAddr,
    /// Remote RTP endpoint
    pub remote: SocketAddr,
    /// Negotiated payload type (0 or 8)
    pub payload_type: u8,
    /// Transmit cadence
    pub frame_interval: Duration,
    /// Period of hold keepalives
    pub keepalive_interval: Duration,
    /// Receive poll timeout
    pub receive_timeout: Duration,
}

impl MediaSessionConfig {
    pub fn new(local: SocketAddr, remote: SocketAddr, payload_type: u8) -> Self {
        Self {
            local,
            remote,
            payload_type,
            frame_interval: Duration::from_millis(19),
            keepalive_interval: Duration::from_secs(10),
            receive_timeout: Duration::from_millis(200),
        }
    }
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
}

struct Shared {
    socket: UdpSocket,
    local: SocketAddr,
    remote: SocketAddr,
    codec: Codec,
    rtp: RtpSession,
    inbound: JitterBuffer,
    outbound: JitterBuffer,
    out_offset: AtomicU64,
    inbound_payload_type: AtomicU8,
    alive: AtomicBool,
    on_hold: AtomicBool,
    sending_dtmf: AtomicBool,
    force_reset: AtomicBool,
    first_received: AtomicBool,
    received_since_hold: AtomicU32,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    dtmf_callback: Option<DtmfCallback>,
}

impl Shared {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn is_on_hold(&self) -> bool {
        self.on_hold.load(Ordering::Acquire)
    }

    async fn send(&self, packet: &RtpPacket) {
        let data = packet.serialize();
        match self.socket.send_to(&data, self.remote).await {
            Ok(sent) => {
                self.rtp.record_sent(sent);
                counter!("rtp_packets_sent_total").increment(1);
            }
            Err(e) => warn!("RTP send to {} failed: {}", self.remote, e),
        }
    }

    fn write_outbound(&self, pcm: &[u8]) {
        let offset = self.out_offset.fetch_add(pcm.len() as u64, Ordering::AcqRel);
        self.outbound.write(offset, pcm, false);
    }

    async fn transmit_frame(&self, marker: bool) {
        let pcm = self.outbound.read(FRAME_PCM_BYTES);
        let payload = match pcm_from_bytes(&pcm) {
            Ok(samples) => encode(self.codec, &samples),
            Err(e) => {
                warn!("Skipping outbound frame: {}", e);
                return;
            }
        };

        let packet = self.rtp.next_packet(self.codec.payload_type(), payload, marker);
        if !self.is_on_hold() {
            self.send(&packet).await;
        }
    }

    async fn first_packet(&self) {
        self.write_outbound(&[SILENCE_FILLER; FIRST_PACKET_SILENCE]);
        self.transmit_frame(true).await;
    }

    async fn send_keepalive(&self) {
        let packet = self.rtp.next_keepalive();
        debug!("Sending hold keepalive to {}", self.remote);
        self.send(&packet).await;
    }

    fn handle_datagram(&self, data: &[u8]) -> Result<(), MediaError> {
        let packet = RtpPacket::parse(data)?;
        let first = !self.first_received.swap(true, Ordering::AcqRel);
        let talk_spurt = packet.marker && !first;

        self.received_since_hold.fetch_add(1, Ordering::AcqRel);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        counter!("rtp_packets_received_total").increment(1);

        match packet.kind() {
            PayloadKind::Pcmu | PayloadKind::Pcma => {
                self.inbound_payload_type
                    .store(packet.payload_type, Ordering::Release);
                // armed resets are only spent on audio
                let force_reset = self.force_reset.swap(false, Ordering::AcqRel) || talk_spurt;
                self.inbound
                    .write(packet.timestamp as u64, &packet.payload, force_reset);
                Ok(())
            }
            PayloadKind::TelephoneEvent => {
                let event = decode_telephone_event(&packet.payload)?;
                if packet.marker {
                    debug!("DTMF digit {} received", event.digit);
                    if let Some(callback) = &self.dtmf_callback {
                        callback(event.digit);
                    }
                }
                Ok(())
            }
            PayloadKind::Keepalive => Ok(()),
            PayloadKind::Unsupported(payload_type) => {
                Err(MediaError::UnsupportedPayload(payload_type))
            }
        }
    }
}

/// RTP media session for one call leg
pub struct MediaSession {
    shared: Arc<Shared>,
    keepalive_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl MediaSession {
    /// Bind the RTP socket and start both loops
    pub async fn start(
        config: MediaSessionConfig,
        dtmf_callback: Option<DtmfCallback>,
    ) -> Result<Self, MediaError> {
        let codec = Codec::from_payload_type(config.payload_type)
            .map_err(|_| MediaError::UnsupportedCodec(config.payload_type))?;

        let socket = UdpSocket::bind(config.local).await?;
        let local = socket.local_addr()?;
        info!(
            "Media session {} -> {} started with {}",
            local, config.remote, codec
        );

        let shared = Arc::new(Shared {
            socket,
            local,
            remote: config.remote,
            codec,
            rtp: RtpSession::new(),
            inbound: JitterBuffer::new(JitterBufferConfig::default()),
            outbound: JitterBuffer::new(JitterBufferConfig::default()),
            out_offset: AtomicU64::new(rand::thread_rng().gen_range(1..=5000)),
            inbound_payload_type: AtomicU8::new(codec.payload_type()),
            alive: AtomicBool::new(true),
            on_hold: AtomicBool::new(false),
            sending_dtmf: AtomicBool::new(false),
            force_reset: AtomicBool::new(false),
            first_received: AtomicBool::new(false),
            received_since_hold: AtomicU32::new(0),
            packets_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            dtmf_callback,
        });

        let receiver = tokio::spawn(receive_loop(shared.clone(), config.receive_timeout));
        let transmitter = tokio::spawn(transmit_loop(shared.clone(), config.frame_interval));

        Ok(Self {
            shared,
            keepalive_interval: config.keepalive_interval,
            tasks: Mutex::new(vec![receiver, transmitter]),
            keepalive: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote
    }

    pub fn codec(&self) -> Codec {
        self.shared.codec
    }

    pub fn ssrc(&self) -> u32 {
        self.shared.rtp.ssrc()
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    pub fn is_on_hold(&self) -> bool {
        self.shared.is_on_hold()
    }

    pub fn is_sending_dtmf(&self) -> bool {
        self.shared.sending_dtmf.load(Ordering::Acquire)
    }

    /// Queue 16-bit little-endian PCM for transmission
    pub fn write_outbound(&self, pcm: &[u8]) {
        self.shared.write_outbound(pcm);
    }

    /// Read `length` received samples as 16-bit little-endian PCM
    ///
    /// While on hold the inbound buffer is still drained but silence is returned.
    pub fn read_inbound(&self, length: usize) -> Bytes {
        let companded = self.shared.inbound.read(length);
        if self.is_on_hold() {
            return Bytes::from(vec![SILENCE_FILLER; length * 2]);
        }

        let codec = Codec::from_payload_type(
            self.shared.inbound_payload_type.load(Ordering::Acquire),
        )
        .unwrap_or(self.shared.codec);
        pcm_to_bytes(&decode(codec, &companded))
    }

    /// Enter or leave hold
    pub async fn set_hold(&self, hold: bool) {
        let shared = &self.shared;
        if !hold && shared.received_since_hold.load(Ordering::Acquire) <= 1 {
            shared.force_reset.store(true, Ordering::Release);
        }

        let was_on_hold = shared.on_hold.swap(hold, Ordering::AcqRel);
        if hold {
            shared.received_since_hold.store(0, Ordering::Release);
            if !was_on_hold {
                info!("Media session {} on hold", shared.local);
                shared.send_keepalive().await;
                self.arm_keepalive();
            }
        } else {
            if was_on_hold {
                info!("Media session {} resumed", shared.local);
            }
            self.cancel_keepalive();
        }
    }

    fn arm_keepalive(&self) {
        let shared = self.shared.clone();
        let period = self.keepalive_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !shared.is_alive() || !shared.is_on_hold() {
                    break;
                }
                shared.send_keepalive().await;
            }
        });

        let mut slot = self.keepalive.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    fn cancel_keepalive(&self) {
        let mut slot = self.keepalive.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    /// Send one telephone-event packet carrying `payload`
    ///
    /// Returns whether the packet went out; nothing is sent while on hold.
    pub async fn send_dtmf(&self, payload: &[u8]) -> bool {
        let shared = &self.shared;
        shared.sending_dtmf.store(true, Ordering::Release);
        let packet = shared
            .rtp
            .next_packet(PT_TELEPHONE_EVENT, append_dtmf_trailer(payload), false);
        let sent = !shared.is_on_hold();
        if sent {
            shared.send(&packet).await;
        }
        shared.sending_dtmf.store(false, Ordering::Release);
        sent
    }

    /// Announce this source with a receiver report and CNAME
    pub async fn send_rtcp(&self) {
        let shared = &self.shared;
        let cname = format!("{}@{}", shared.rtp.ssrc(), shared.local.ip());
        let packet = receiver_report_compound(shared.rtp.ssrc(), &cname);
        if let Err(e) = shared.socket.send_to(&packet, shared.remote).await {
            warn!("RTCP send to {} failed: {}", shared.remote, e);
        }
    }

    pub fn stats(&self) -> MediaStats {
        MediaStats {
            packets_sent: self.shared.rtp.packets_sent(),
            packets_received: self.shared.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.shared.packets_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop both loops and any keepalive timer
    pub async fn stop(&self) {
        if !self.shared.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.on_hold.store(false, Ordering::Release);
        self.cancel_keepalive();
        self.abort_tasks();

        let bye = Goodbye::new(self.shared.rtp.ssrc()).serialize();
        if let Err(e) = self.shared.socket.send_to(&bye, self.shared.remote).await {
            debug!("RTCP BYE not sent: {}", e);
        }
        info!("Media session {} stopped", self.shared.local);
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
        self.cancel_keepalive();
        self.abort_tasks();
    }
}

async fn transmit_loop(shared: Arc<Shared>, frame_interval: Duration) {
    shared.first_packet().await;

    let mut ticker = interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    while shared.is_alive() {
        ticker.tick().await;
        shared.transmit_frame(false).await;
    }
    debug!("RTP transmitter for {} stopped", shared.local);
}

async fn receive_loop(shared: Arc<Shared>, receive_timeout: Duration) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    while shared.is_alive() {
        let (len, from) = match timeout(receive_timeout, shared.socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                if shared.is_alive() {
                    warn!("RTP receive error: {}", e);
                    tokio::time::sleep(receive_timeout).await;
                }
                continue;
            }
            Ok(Ok(received)) => received,
        };

        if let Err(e) = shared.handle_datagram(&buf[..len]) {
            shared.packets_dropped.fetch_add(1, Ordering::Relaxed);
            counter!("rtp_packets_dropped_total").increment(1);
            debug!("Dropped RTP packet from {}: {}", from, e);
        }
    }
    debug!("RTP receiver for {} stopped", shared.local);
}
