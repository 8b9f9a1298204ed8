//! Simple SDP (Session Description Protocol) handling

use crate::infrastructure::media::codec::Codec;
use crate::infrastructure::media::rtp::PT_TELEPHONE_EVENT;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Media direction attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaDirection {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    fn parse(attribute: &str) -> Option<Self> {
        match attribute {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }
}

/// Simple SDP session
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: Option<SdpConnection>,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpConnection {
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    /// Payload types in offer order
    pub formats: Vec<u8>,
    pub rtpmap: Vec<(u8, String)>,
    /// Media-level connection overrides the session one
    pub connection: Option<SdpConnection>,
    pub direction: MediaDirection,
}

impl SdpSession {
    /// Audio offer/answer listing `payload_types` plus telephone-event
    pub fn create_audio_session(
        username: &str,
        local_ip: IpAddr,
        local_port: u16,
        payload_types: &[u8],
        direction: MediaDirection,
    ) -> Self {
        let address_type = if local_ip.is_ipv4() { "IP4" } else { "IP6" };

        let mut formats: Vec<u8> = payload_types
            .iter()
            .copied()
            .filter(|pt| Codec::from_payload_type(*pt).is_ok())
            .collect();
        formats.push(PT_TELEPHONE_EVENT);

        let rtpmap = formats
            .iter()
            .map(|pt| {
                let encoding = match Codec::from_payload_type(*pt) {
                    Ok(codec) => format!("{}/{}", codec.encoding_name(), codec.clock_rate()),
                    Err(_) => "telephone-event/8000".to_string(),
                };
                (*pt, encoding)
            })
            .collect();

        let session_id = chrono::Utc::now().timestamp().to_string();
        Self {
            version: 0,
            origin: SdpOrigin {
                username: username.to_string(),
                session_version: session_id.clone(),
                session_id,
                address: local_ip.to_string(),
            },
            session_name: "voicecore".to_string(),
            connection: Some(SdpConnection {
                address_type: address_type.to_string(),
                address: local_ip.to_string(),
            }),
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port: local_port,
                protocol: "RTP/AVP".to_string(),
                formats,
                rtpmap,
                connection: None,
                direction,
            }],
        }
    }

    /// Parse SDP from string
    pub fn parse(sdp_body: &str) -> Option<Self> {
        let mut version = 0;
        let mut origin: Option<SdpOrigin> = None;
        let mut session_name = String::new();
        let mut connection: Option<SdpConnection> = None;
        let mut media: Vec<SdpMedia> = Vec::new();

        for line in sdp_body.lines() {
            let line = line.trim();
            let Some((field, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match field {
                "v" => version = value.parse().unwrap_or(0),
                "o" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin = Some(SdpOrigin {
                            username: parts[0].to_string(),
                            session_id: parts[1].to_string(),
                            session_version: parts[2].to_string(),
                            address: parts[5].to_string(),
                        });
                    }
                }
                "s" => session_name = value.to_string(),
                "c" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        let conn = SdpConnection {
                            address_type: parts[1].to_string(),
                            // strip a multicast TTL suffix
                            address: parts[2].split('/').next().unwrap_or(parts[2]).to_string(),
                        };
                        match media.last_mut() {
                            Some(m) => m.connection = Some(conn),
                            None => connection = Some(conn),
                        }
                    }
                }
                "m" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        media.push(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].split('/').next()?.parse().ok()?,
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().filter_map(|f| f.parse().ok()).collect(),
                            rtpmap: Vec::new(),
                            connection: None,
                            direction: MediaDirection::default(),
                        });
                    }
                }
                "a" => {
                    let Some(current) = media.last_mut() else {
                        continue;
                    };
                    if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
                        if let Some((pt, encoding)) = rtpmap.split_once(' ') {
                            if let Ok(pt) = pt.parse() {
                                current.rtpmap.push((pt, encoding.trim().to_string()));
                            }
                        }
                    } else if let Some(direction) = MediaDirection::parse(value) {
                        current.direction = direction;
                    }
                }
                _ => {}
            }
        }

        Some(Self {
            version,
            origin: origin?,
            session_name,
            connection,
            media,
        })
    }

    /// Get media description for audio
    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Payload types offered for audio
    pub fn audio_codecs(&self) -> Vec<u8> {
        self.audio_media()
            .map(|audio| audio.formats.clone())
            .unwrap_or_default()
    }

    /// Remote RTP endpoint of the audio stream
    pub fn audio_endpoint(&self) -> Option<SocketAddr> {
        let audio = self.audio_media()?;
        let connection = audio.connection.as_ref().or(self.connection.as_ref())?;
        let ip: IpAddr = connection.address.parse().ok()?;
        Some(SocketAddr::new(ip, audio.port))
    }

    /// First locally supported codec that the remote side also lists
    pub fn negotiate(&self, local: &[u8]) -> Option<Codec> {
        let remote = self.audio_codecs();
        local
            .iter()
            .filter(|pt| remote.contains(pt))
            .find_map(|pt| Codec::from_payload_type(*pt).ok())
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        let origin_type = self
            .connection
            .as_ref()
            .map(|c| c.address_type.as_str())
            .unwrap_or("IP4");
        write!(
            f,
            "o={} {} {} IN {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            origin_type,
            self.origin.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(conn) = &self.connection {
            write!(f, "c=IN {} {}\r\n", conn.address_type, conn.address)?;
        }
        write!(f, "t=0 0\r\n")?;

        for media in &self.media {
            let formats: Vec<String> = media.formats.iter().map(|pt| pt.to_string()).collect();
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                formats.join(" ")
            )?;
            if let Some(conn) = &media.connection {
                write!(f, "c=IN {} {}\r\n", conn.address_type, conn.address)?;
            }
            for (pt, encoding) in &media.rtpmap {
                write!(f, "a=rtpmap:{} {}\r\n", pt, encoding)?;
            }
            if media.formats.contains(&PT_TELEPHONE_EVENT) {
                write!(f, "a=fmtp:{} 0-15\r\n", PT_TELEPHONE_EVENT)?;
            }
            write!(f, "a=ptime:20\r\n")?;
            write!(f, "a=maxptime:50\r\n")?;
            write!(f, "a={}\r\n", media.direction.as_str())?;
        }
        Ok(())
    }
}
