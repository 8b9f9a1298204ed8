//! voicecore - a SIP/RTP voice session engine
//!
//! Layered the same way as a DDD service:
//! - `domain`: dialog identity and call lifecycle rules
//! - `infrastructure`: SIP transactions, dispatcher, RTP media and codecs
//! - `application`: the session controller that drives calls end to end

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{PhoneEvent, SessionController};
pub use config::Config;
pub use domain::shared::error::DomainError;
pub use error::{VoipError, VoipResult};
