//! RTP (Real-time Transport Protocol) Implementation
//!
//! This module implements the subset of RFC 3550 a G.711 softphone needs.

pub mod jitter_buffer;
pub mod packet;
pub mod rtcp;
pub mod session;

pub use jitter_buffer::{JitterBuffer, JitterBufferConfig, JitterBufferStats, SILENCE_FILLER};
pub use packet::{PayloadKind, RtpError, RtpPacket, PT_KEEPALIVE, PT_TELEPHONE_EVENT};
pub use rtcp::{receiver_report_compound, Goodbye, ReceiverReport, SourceDescription};
pub use session::{RtpSession, SAMPLES_PER_FRAME};
