//! RTP Session Numbering
//!
//! Owns the SSRC, sequence number and timestamp of an outgoing stream. Both
//! counters use plain unsigned wraparound; no RFC 3550 rollover tracking.

use super::packet::RtpPacket;
use bytes::Bytes;
use rand::Rng;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Samples per 20 ms G.711 frame at 8 kHz
pub const SAMPLES_PER_FRAME: u32 = 160;

/// RTP Session
///
/// Shared between the transmit loop, the hold keepalive timer and DTMF
/// sends, so every counter is atomic.
#[derive(Debug)]
pub struct RtpSession {
    /// Synchronization source identifier
    ssrc: u32,
    /// Next sequence number to stamp
    sequence: AtomicU16,
    /// Next timestamp to stamp
    timestamp: AtomicU32,
    packets_sent: AtomicU64,
    octets_sent: AtomicU64,
}

impl RtpSession {
    /// Create a session with randomized starting values
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self::with_initial(
            rng.gen_range(1000..=65530),
            rng.gen_range(1..=100),
            rng.gen_range(1..=10000),
        )
    }

    pub fn with_initial(ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        Self {
            ssrc,
            sequence: AtomicU16::new(sequence),
            timestamp: AtomicU32::new(timestamp),
            packets_sent: AtomicU64::new(0),
            octets_sent: AtomicU64::new(0),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next packet will carry
    pub fn sequence(&self) -> u16 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Timestamp the next packet will carry
    pub fn timestamp(&self) -> u32 {
        self.timestamp.load(Ordering::Relaxed)
    }

    fn advance(&self) -> (u16, u32) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp = self.timestamp.fetch_add(SAMPLES_PER_FRAME, Ordering::Relaxed);
        (sequence, timestamp)
    }

    /// Stamp one frame and advance sequence and timestamp
    pub fn next_packet(&self, payload_type: u8, payload: Bytes, marker: bool) -> RtpPacket {
        let (sequence, timestamp) = self.advance();
        debug!(
            "Stamped RTP packet: pt={}, seq={}, ts={}, ssrc={:08x}",
            payload_type, sequence, timestamp, self.ssrc
        );
        RtpPacket::new(payload_type, sequence, timestamp, self.ssrc, payload).with_marker(marker)
    }

    /// Stamp a hold keepalive; its wire timestamp is always zero
    pub fn next_keepalive(&self) -> RtpPacket {
        let (sequence, _) = self.advance();
        RtpPacket::keepalive(sequence, self.ssrc)
    }

    pub fn record_sent(&self, octets: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.octets_sent.fetch_add(octets as u64, Ordering::Relaxed);
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn octets_sent(&self) -> u64 {
        self.octets_sent.load(Ordering::Relaxed)
    }
}

impl Default for RtpSession {
    fn default() -> Self {
        Self::new()
    }
}
