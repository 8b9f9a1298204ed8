//! SIP user agent stack
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Session Controller    │
//! │  (calls, hold, REFER)   │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │ (one machine per method)│
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │      Dispatcher         │
//! │ (socket reader, timers) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │         (UDP)           │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod dispatcher;
pub mod message;
pub mod sdp;
pub mod transaction;
pub mod transport;

pub use auth::{AuthInfo, Credentials, DigestAuth, Md5Digest};
pub use builder::{LocalAccount, Replaces, RequestBuilder};
pub use dispatcher::{DispatcherHandle, InboundRequest, TransactionDispatcher};
pub use message::{Challenge, SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::{MediaDirection, SdpSession};
pub use transaction::{
    PollPolicy, TransactionContext, TransactionHandle, TransactionId, TransactionOutcome,
    TransactionSnapshot, TransactionState, TransactionStateMachine,
};
pub use transport::{Transport, UdpTransport};
