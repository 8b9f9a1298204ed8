//! G.711 Audio Codec Implementation
//!
//! G.711 is a narrowband audio codec that provides toll-quality audio at 64 kbit/s.
//! It includes two companding algorithms:
//! - μ-law (PCMU): Used primarily in North America and Japan
//! - A-law (PCMA): Used in Europe and rest of the world
//!
//! Linear samples are shifted by a -128 bias before companding and the bias is
//! restored after expansion, matching the audio path of the phone front end.

use super::CodecError;
use bytes::{BufMut, Bytes, BytesMut};

/// Bias applied to linear samples before companding
const LINEAR_BIAS: i32 = 128;

/// μ-law segment end points (14-bit magnitude)
const ULAW_SEG_END: [i32; 8] = [0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF];
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 8159;

/// A-law segment end points (13-bit magnitude)
const ALAW_SEG_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

/// G.711 codec negotiated for a media session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// μ-law (PCMU) - Payload Type 0
    PCMU,
    /// A-law (PCMA) - Payload Type 8
    PCMA,
}

impl Codec {
    /// Resolve a static RTP payload type
    pub fn from_payload_type(payload_type: u8) -> Result<Self, CodecError> {
        match payload_type {
            0 => Ok(Codec::PCMU),
            8 => Ok(Codec::PCMA),
            other => Err(CodecError::UnsupportedPayloadType(other)),
        }
    }

    /// Get RTP payload type
    pub fn payload_type(&self) -> u8 {
        match self {
            Codec::PCMU => 0,
            Codec::PCMA => 8,
        }
    }

    /// Get clock rate (always 8000 Hz for G.711)
    pub fn clock_rate(&self) -> u32 {
        8000
    }

    /// Encoding name as used in `a=rtpmap`
    pub fn encoding_name(&self) -> &'static str {
        match self {
            Codec::PCMU => "PCMU",
            Codec::PCMA => "PCMA",
        }
    }

    /// Byte that decodes to (near) zero amplitude
    pub fn silence(&self) -> u8 {
        match self {
            Codec::PCMU => 0xFF,
            Codec::PCMA => 0xD5,
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.encoding_name())
    }
}

/// Compand 16-bit linear PCM, one output byte per sample
pub fn encode(codec: Codec, pcm: &[i16]) -> Bytes {
    let mut out = BytesMut::with_capacity(pcm.len());
    for &sample in pcm {
        let biased = (sample as i32 - LINEAR_BIAS).clamp(i16::MIN as i32, i16::MAX as i32);
        out.put_u8(match codec {
            Codec::PCMU => linear_to_ulaw(biased),
            Codec::PCMA => linear_to_alaw(biased),
        });
    }
    out.freeze()
}

/// Expand companded bytes back to 16-bit linear PCM
pub fn decode(codec: Codec, companded: &[u8]) -> Vec<i16> {
    companded
        .iter()
        .map(|&byte| {
            let linear = match codec {
                Codec::PCMU => ulaw_to_linear(byte),
                Codec::PCMA => alaw_to_linear(byte),
            };
            (linear + LINEAR_BIAS).clamp(i16::MIN as i32, i16::MAX as i32) as i16
        })
        .collect()
}

/// Interpret little-endian bytes as 16-bit samples
pub fn pcm_from_bytes(data: &[u8]) -> Result<Vec<i16>, CodecError> {
    if data.len() % 2 != 0 {
        return Err(CodecError::OddPcmLength(data.len()));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Serialize 16-bit samples as little-endian bytes
pub fn pcm_to_bytes(samples: &[i16]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.put_i16_le(sample);
    }
    out.freeze()
}

fn segment(value: i32, ends: &[i32; 8]) -> usize {
    ends.iter().position(|&end| value <= end).unwrap_or(ends.len())
}

fn linear_to_ulaw(sample: i32) -> u8 {
    let mut pcm = sample >> 2;
    let mask = if pcm < 0 {
        pcm = -pcm;
        0x7F
    } else {
        0xFF
    };
    pcm = pcm.min(ULAW_CLIP) + (ULAW_BIAS >> 2);

    let seg = segment(pcm, &ULAW_SEG_END);
    if seg >= 8 {
        return (0x7F ^ mask) as u8;
    }
    let uval = ((seg as i32) << 4) | ((pcm >> (seg + 1)) & 0x0F);
    (uval ^ mask) as u8
}

fn ulaw_to_linear(byte: u8) -> i32 {
    let u = !byte as i32;
    let mut t = ((u & 0x0F) << 3) + ULAW_BIAS;
    t <<= (u & 0x70) >> 4;
    if u & 0x80 != 0 {
        ULAW_BIAS - t
    } else {
        t - ULAW_BIAS
    }
}

fn linear_to_alaw(sample: i32) -> u8 {
    let mut pcm = sample >> 3;
    let mask = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let seg = segment(pcm, &ALAW_SEG_END);
    if seg >= 8 {
        return (0x7F ^ mask) as u8;
    }
    let mut aval = (seg as i32) << 4;
    aval |= if seg < 2 {
        (pcm >> 1) & 0x0F
    } else {
        (pcm >> seg) & 0x0F
    };
    (aval ^ mask) as u8
}

fn alaw_to_linear(byte: u8) -> i32 {
    let a = (byte ^ 0x55) as i32;
    let mut t = (a & 0x0F) << 4;
    let seg = (a & 0x70) >> 4;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }
    if a & 0x80 != 0 {
        t
    } else {
        -t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_deviation(sample: i16) -> i32 {
        (sample as i32).abs() / 16 + 16
    }

    #[test]
    fn test_payload_type_mapping() {
        assert_eq!(Codec::PCMU.payload_type(), 0);
        assert_eq!(Codec::PCMA.payload_type(), 8);
        assert_eq!(Codec::from_payload_type(8).unwrap(), Codec::PCMA);
        assert!(matches!(
            Codec::from_payload_type(18),
            Err(CodecError::UnsupportedPayloadType(18))
        ));
    }

    #[test]
    fn test_pcmu_round_trip_within_quantization() {
        let original: Vec<i16> = (i16::MIN..=i16::MAX).step_by(61).collect();
        let decoded = decode(Codec::PCMU, &encode(Codec::PCMU, &original));

        assert_eq!(original.len(), decoded.len());
        for (orig, dec) in original.iter().zip(decoded.iter()) {
            let diff = (*orig as i32 - *dec as i32).abs();
            assert!(diff <= max_deviation(*orig), "{} decoded as {}", orig, dec);
        }
    }

    #[test]
    fn test_pcma_round_trip_within_quantization() {
        let original: Vec<i16> = (i16::MIN..=i16::MAX).step_by(61).collect();
        let decoded = decode(Codec::PCMA, &encode(Codec::PCMA, &original));

        for (orig, dec) in original.iter().zip(decoded.iter()) {
            let diff = (*orig as i32 - *dec as i32).abs();
            assert!(diff <= max_deviation(*orig), "{} decoded as {}", orig, dec);
        }
    }

    #[test]
    fn test_companded_bytes_are_stable() {
        // Expanding and re-companding must not drift by more than one step
        for byte in 0u8..=255 {
            for codec in [Codec::PCMU, Codec::PCMA] {
                let again = encode(codec, &decode(codec, &[byte]))[0];
                let drift = (again as i32 - byte as i32).abs();
                assert!(drift <= 1 || (byte & 0x7F) == (again & 0x7F), "{:?} {:#x} -> {:#x}", codec, byte, again);
            }
        }
    }

    #[test]
    fn test_silence_bytes() {
        let silence: Vec<i16> = vec![128; 160];
        assert!(encode(Codec::PCMU, &silence).iter().all(|&b| b == 0xFF));
        assert!(encode(Codec::PCMA, &silence).iter().all(|&b| b == 0xD5));
    }

    #[test]
    fn test_pcm_byte_helpers() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = pcm_to_bytes(&samples);
        assert_eq!(bytes.len(), 10);
        assert_eq!(pcm_from_bytes(&bytes).unwrap(), samples);
        assert!(matches!(pcm_from_bytes(&[1, 2, 3]), Err(CodecError::OddPcmLength(3))));
    }
}
