//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - SIP user agent (transactions, dispatcher, transport)
//! - RTP media transport and G.711 codecs

pub mod media;
pub mod protocols;
