//! RTCP (RTP Control Protocol) reports sent by a media session (RFC 3550)
//!
//! The session only emits control traffic: an empty receiver report with a
//! CNAME source description once the call is answered, and a BYE on teardown.

use bytes::{BufMut, Bytes, BytesMut};

/// RTCP Packet Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpPacketType {
    /// Receiver Report
    RR = 201,
    /// Source Description
    SDES = 202,
    /// Goodbye
    BYE = 203,
}

const SDES_CNAME: u8 = 1;

/// Receiver Report (RR) without report blocks
#[derive(Debug, Clone)]
pub struct ReceiverReport {
    pub ssrc: u32,
}

impl ReceiverReport {
    pub fn new(ssrc: u32) -> Self {
        Self { ssrc }
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(0x80);
        buf.put_u8(RtcpPacketType::RR as u8);
        buf.put_u16(1);
        buf.put_u32(self.ssrc);
        buf.freeze()
    }
}

/// Source Description (SDES) with a single CNAME chunk
#[derive(Debug, Clone)]
pub struct SourceDescription {
    pub ssrc: u32,
    pub cname: String,
}

impl SourceDescription {
    pub fn new(ssrc: u32, cname: impl Into<String>) -> Self {
        Self {
            ssrc,
            cname: cname.into(),
        }
    }

    pub fn serialize(&self) -> Bytes {
        let cname = &self.cname.as_bytes()[..self.cname.len().min(255)];
        // SSRC + item header + text + terminating null, padded to 32 bits
        let chunk_len = 4 + 2 + cname.len() + 1;
        let padded = (chunk_len + 3) & !3;

        let mut buf = BytesMut::with_capacity(4 + padded);
        buf.put_u8(0x81);
        buf.put_u8(RtcpPacketType::SDES as u8);
        buf.put_u16((padded / 4) as u16);
        buf.put_u32(self.ssrc);
        buf.put_u8(SDES_CNAME);
        buf.put_u8(cname.len() as u8);
        buf.put_slice(cname);
        for _ in chunk_len - 1..padded {
            buf.put_u8(0);
        }
        buf.freeze()
    }
}

/// Goodbye (BYE)
#[derive(Debug, Clone)]
pub struct Goodbye {
    pub ssrc: u32,
}

impl Goodbye {
    pub fn new(ssrc: u32) -> Self {
        Self { ssrc }
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(0x81);
        buf.put_u8(RtcpPacketType::BYE as u8);
        buf.put_u16(1);
        buf.put_u32(self.ssrc);
        buf.freeze()
    }
}

/// Compound RR + SDES packet announcing a source
pub fn receiver_report_compound(ssrc: u32, cname: &str) -> Bytes {
    let rr = ReceiverReport::new(ssrc).serialize();
    let sdes = SourceDescription::new(ssrc, cname).serialize();
    let mut buf = BytesMut::with_capacity(rr.len() + sdes.len());
    buf.put_slice(&rr);
    buf.put_slice(&sdes);
    buf.freeze()
}
