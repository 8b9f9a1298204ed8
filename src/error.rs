//! Crate level error

use crate::domain::DomainError;
use crate::infrastructure::media::{CodecError, MediaError, RtpError};
use crate::infrastructure::protocols::sip::SipError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoipError {
    #[error("SIP error: {0}")]
    Sip(#[from] SipError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("RTP error: {0}")]
    Rtp(#[from] RtpError),

    #[error("{0}")]
    Domain(#[from] DomainError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for VoipError {
    fn from(err: config::ConfigError) -> Self {
        VoipError::Config(err.to_string())
    }
}

pub type VoipResult<T> = std::result::Result<T, VoipError>;
