//! Shared kernel - Common types used across the domain

pub mod error;
pub mod result;

pub use error::DomainError;
pub use result::Result;
