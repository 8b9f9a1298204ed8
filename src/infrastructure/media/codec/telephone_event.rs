//! RFC 4733 telephone-event payloads (payload type 101)

use super::CodecError;
use bytes::{BufMut, Bytes, BytesMut};

/// End-of-event flag, volume 10 and a duration of 800 samples
pub const DTMF_TRAILER: [u8; 3] = [0x8A, 0x03, 0x20];

const EVENT_TABLE: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', '*', '#', 'A', 'B', 'C', 'D',
];

/// Dialable DTMF symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DtmfTone(u8);

impl DtmfTone {
    pub fn from_char(c: char) -> Option<Self> {
        let c = c.to_ascii_uppercase();
        EVENT_TABLE
            .iter()
            .position(|&symbol| symbol == c)
            .map(|index| Self(index as u8))
    }

    pub fn from_event_code(code: u8) -> Option<Self> {
        (code < EVENT_TABLE.len() as u8).then_some(Self(code))
    }

    pub fn as_char(&self) -> char {
        EVENT_TABLE[self.0 as usize]
    }

    pub fn event_code(&self) -> u8 {
        self.0
    }

    /// Single-byte payload handed to the media session for sending
    pub fn payload(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.0])
    }
}

/// Decoded telephone-event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelephoneEvent {
    pub digit: char,
    pub end: bool,
    pub volume: u8,
}

/// Append the end-of-event trailer to a DTMF payload
pub fn append_dtmf_trailer(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + DTMF_TRAILER.len());
    out.put_slice(payload);
    out.put_slice(&DTMF_TRAILER);
    out.freeze()
}

/// Decode the first two bytes of a telephone-event payload
pub fn decode_telephone_event(payload: &[u8]) -> Result<TelephoneEvent, CodecError> {
    if payload.len() < 4 {
        return Err(CodecError::PayloadTooShort {
            expected: 4,
            actual: payload.len(),
        });
    }

    let tone = DtmfTone::from_event_code(payload[0]).ok_or(CodecError::InvalidEvent(payload[0]))?;
    Ok(TelephoneEvent {
        digit: tone.as_char(),
        end: payload[1] & 0x80 != 0,
        volume: payload[1] & 0x3F,
    })
}
