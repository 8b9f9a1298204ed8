//! Wire codecs for the RTP media path
//!
//! Pure, stateless transcoding between 16-bit linear PCM and G.711, plus the
//! telephone-event payload used for DTMF.

pub mod g711;
pub mod telephone_event;

pub use g711::{decode, encode, pcm_from_bytes, pcm_to_bytes, Codec};
pub use telephone_event::{
    append_dtmf_trailer, decode_telephone_event, DtmfTone, TelephoneEvent, DTMF_TRAILER,
};

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Unsupported payload type: {0}")]
    UnsupportedPayloadType(u8),
    #[error("Payload too short: expected at least {expected} bytes, got {actual}")]
    PayloadTooShort { expected: usize, actual: usize },
    #[error("Invalid telephone-event code: {0}")]
    InvalidEvent(u8),
    #[error("PCM buffer has odd length: {0}")]
    OddPcmLength(usize),
}
