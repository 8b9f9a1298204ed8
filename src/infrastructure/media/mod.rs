//! Media transport: G.711 codecs, RTP framing and per-call media sessions

pub mod codec;
pub mod rtp;
pub mod session;

pub use codec::{Codec, CodecError, DtmfTone, TelephoneEvent};
pub use rtp::{
    JitterBuffer, JitterBufferConfig, RtpError, RtpPacket, RtpSession, PT_KEEPALIVE,
    PT_TELEPHONE_EVENT,
};
pub use session::{DtmfCallback, MediaError, MediaSession, MediaSessionConfig, MediaStats};
