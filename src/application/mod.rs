//! Application layer - Use cases and application services
//!
//! The session controller turns user intents (register, call, hold,
//! transfer, hang up) into SIP transactions and media sessions, and reports
//! what happens as `PhoneEvent`s.

pub mod events;
pub mod session_controller;

pub use events::PhoneEvent;
pub use session_controller::SessionController;
