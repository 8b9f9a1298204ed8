//! Events published to the front end

use crate::domain::call::EndReason;
use crate::infrastructure::media::Codec;

/// Everything a user interface needs to follow the phone
#[derive(Debug, Clone, PartialEq)]
pub enum PhoneEvent {
    Registered {
        expires: u32,
    },
    RegistrationFailed {
        status: Option<u16>,
    },
    IncomingCall {
        call_id: String,
        from: String,
    },
    Ringing {
        call_id: String,
    },
    Answered {
        call_id: String,
        codec: Codec,
    },
    CallEnded {
        call_id: String,
        reason: EndReason,
    },
    Dtmf {
        call_id: String,
        digit: char,
    },
    MessageReceived {
        from: String,
        text: String,
    },
    TransferProgress {
        call_id: String,
        status: u16,
    },
}

impl PhoneEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PhoneEvent::Registered { .. } => "registration.registered",
            PhoneEvent::RegistrationFailed { .. } => "registration.failed",
            PhoneEvent::IncomingCall { .. } => "call.incoming",
            PhoneEvent::Ringing { .. } => "call.ringing",
            PhoneEvent::Answered { .. } => "call.answered",
            PhoneEvent::CallEnded { .. } => "call.ended",
            PhoneEvent::Dtmf { .. } => "call.dtmf",
            PhoneEvent::MessageReceived { .. } => "message.received",
            PhoneEvent::TransferProgress { .. } => "call.transfer_progress",
        }
    }

    /// Call the event belongs to, if any
    pub fn call_id(&self) -> Option<&str> {
        match self {
            PhoneEvent::IncomingCall { call_id, .. }
            | PhoneEvent::Ringing { call_id }
            | PhoneEvent::Answered { call_id, .. }
            | PhoneEvent::CallEnded { call_id, .. }
            | PhoneEvent::Dtmf { call_id, .. }
            | PhoneEvent::TransferProgress { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_metadata() {
        let ended = PhoneEvent::CallEnded {
            call_id: "c1".into(),
            reason: EndReason::RemoteHangup,
        };
        assert_eq!(ended.event_type(), "call.ended");
        assert_eq!(ended.call_id(), Some("c1"));

        let registered = PhoneEvent::Registered { expires: 3600 };
        assert_eq!(registered.call_id(), None);
    }
}
