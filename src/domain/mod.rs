//! Domain layer - call lifecycle rules independent of the wire
//!
//! This layer contains:
//! - Value Objects: call direction, state and end reasons
//! - Entities: the SIP dialog of one call leg

pub mod call;
pub mod shared;

pub use shared::{DomainError, Result};
