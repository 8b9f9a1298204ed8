//! SIP message types and parsing
//!
//! Datagrams are parsed with `rsip`; header values are then read back as
//! plain text so compact header forms and unusual parameters survive.

use bytes::Bytes;
use rsip::{Headers, Request, Response};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::TransportError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SipMethod {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "CANCEL" => SipMethod::Cancel,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            other => return Err(SipError::InvalidMessage(format!("unknown method {}", other))),
        };
        Ok(method)
    }
}

/// CSeq header: sequence number plus method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CSeq {
    pub number: u32,
    pub method: SipMethod,
}

impl FromStr for CSeq {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let number = parts
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| SipError::InvalidMessage(format!("bad CSeq: {}", s)))?;
        let method = parts
            .next()
            .ok_or_else(|| SipError::InvalidMessage(format!("bad CSeq: {}", s)))?
            .parse()?;
        Ok(Self { number, method })
    }
}

/// From/To header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    /// Header value as received
    pub raw: String,
    pub uri: String,
    pub user: Option<String>,
    pub tag: Option<String>,
}

impl NameAddr {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let (uri, params) = match (raw.find('<'), raw.find('>')) {
            (Some(open), Some(close)) if open < close => {
                (&raw[open + 1..close], &raw[close + 1..])
            }
            _ => match raw.find(';') {
                Some(semi) => (&raw[..semi], &raw[semi..]),
                None => (raw, ""),
            },
        };

        let user = uri
            .split_once(':')
            .map(|(_, rest)| rest)
            .and_then(|rest| rest.split_once('@'))
            .map(|(user, _)| user.to_string());

        let tag = params
            .split(';')
            .filter_map(|p| p.trim().split_once('='))
            .find(|(name, _)| name.eq_ignore_ascii_case("tag"))
            .map(|(_, value)| value.trim().to_string());

        Self {
            raw: raw.to_string(),
            uri: uri.trim().to_string(),
            user,
            tag,
        }
    }
}

/// Digest challenge from WWW-Authenticate or Proxy-Authenticate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Challenge {
    pub realm: Option<String>,
    pub nonce: String,
    pub opaque: Option<String>,
    pub stale: bool,
    /// Challenge came from a proxy (407)
    pub proxy: bool,
}

impl Challenge {
    pub fn parse(value: &str, proxy: bool) -> Option<Self> {
        let value = value.trim();
        let params = match value.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("digest") => rest,
            _ => value,
        };

        let mut challenge = Challenge {
            proxy,
            ..Default::default()
        };
        let mut nonce = None;
        for (name, value) in split_auth_params(params) {
            match name.to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => challenge.opaque = Some(value),
                "stale" => challenge.stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }
        challenge.nonce = nonce?;
        Some(challenge)
    }
}

/// Comma separated `name=value` pairs, honoring quoted commas
fn split_auth_params(params: &str) -> Vec<(String, String)> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in params.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => items.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    items.push(current);

    items
        .iter()
        .filter_map(|item| item.split_once('='))
        .map(|(name, value)| {
            (
                name.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            )
        })
        .collect()
}

/// Status line carried in a `message/sipfrag` NOTIFY body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyStatus {
    pub code: u16,
    pub reason: String,
}

impl NotifyStatus {
    pub fn parse(body: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(body).ok()?;
        let line = text.lines().find(|l| !l.trim().is_empty())?.trim();
        let rest = line.strip_prefix("SIP/2.0")?.trim_start();
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        Some(Self {
            code: code.parse().ok()?,
            reason: reason.trim().to_string(),
        })
    }
}

const COMPACT_FORMS: &[(&str, &str)] = &[
    ("call-id", "i"),
    ("from", "f"),
    ("to", "t"),
    ("via", "v"),
    ("contact", "m"),
    ("content-length", "l"),
    ("content-type", "c"),
];

fn name_matches(header: &str, wanted: &str) -> bool {
    if header.eq_ignore_ascii_case(wanted) {
        return true;
    }
    COMPACT_FORMS.iter().any(|(long, short)| {
        (wanted.eq_ignore_ascii_case(long) && header.eq_ignore_ascii_case(short))
            || (wanted.eq_ignore_ascii_case(short) && header.eq_ignore_ascii_case(long))
    })
}

/// Header values in wire order for a name (case-insensitive, compact aware)
fn header_values(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter_map(|h| {
            // rsip renders every header as "Name: value"
            let line = h.to_string();
            let (header, value) = line.split_once(':')?;
            name_matches(header.trim(), name).then(|| value.trim().to_string())
        })
        .collect()
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        self.inner.method.to_string().parse().ok()
    }

    pub fn uri(&self) -> String {
        self.inner.uri.to_string()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        if data.starts_with(b"SIP/") {
            return Ok(SipMessage::Response(SipResponse::parse(data)?));
        }
        Ok(SipMessage::Request(SipRequest::parse(data)?))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    /// Response status code
    pub fn status(&self) -> Option<u16> {
        self.as_response().map(SipResponse::status_code)
    }

    /// Request method
    pub fn method(&self) -> Option<SipMethod> {
        self.as_request().and_then(SipRequest::method)
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => req.headers(),
            SipMessage::Response(resp) => resp.headers(),
        }
    }

    pub fn body(&self) -> &[u8] {
        match self {
            SipMessage::Request(req) => req.body(),
            SipMessage::Response(resp) => resp.body(),
        }
    }

    /// First value of a header
    pub fn header(&self, name: &str) -> Option<String> {
        header_values(self.headers(), name).into_iter().next()
    }

    pub fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.header("CSeq")?.parse().ok()
    }

    pub fn from(&self) -> Option<NameAddr> {
        self.header("From").map(|v| NameAddr::parse(&v))
    }

    pub fn to(&self) -> Option<NameAddr> {
        self.header("To").map(|v| NameAddr::parse(&v))
    }

    /// Topmost Via
    pub fn via(&self) -> Option<String> {
        self.header("Via")
    }

    pub fn branch(&self) -> Option<String> {
        self.via()?
            .split(';')
            .filter_map(|p| p.trim().split_once('='))
            .find(|(name, _)| name.eq_ignore_ascii_case("branch"))
            .map(|(_, value)| value.to_string())
    }

    /// Contact URI without angle brackets
    pub fn contact(&self) -> Option<String> {
        self.header("Contact").map(|v| NameAddr::parse(&v).uri)
    }

    /// Seconds from a Retry-After header
    pub fn retry_after(&self) -> Option<u64> {
        let value = self.header("Retry-After")?;
        let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }

    /// Digest challenge carried by a 401 or 407
    pub fn challenge(&self) -> Option<Challenge> {
        if let Some(value) = self.header("WWW-Authenticate") {
            return Challenge::parse(&value, false);
        }
        self.header("Proxy-Authenticate")
            .and_then(|value| Challenge::parse(&value, true))
    }

    /// Progress code from a sipfrag body
    pub fn notify_status(&self) -> Option<NotifyStatus> {
        NotifyStatus::parse(self.body())
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMessage::Request(req) => write!(
                f,
                "{} {}",
                req.inner.method,
                self.call_id().unwrap_or_default()
            ),
            SipMessage::Response(resp) => write!(
                f,
                "{} {}",
                resp.status_code(),
                self.cseq()
                    .map(|c| c.method.to_string())
                    .unwrap_or_default()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register_request() {
        let data = b"REGISTER sip:registrar.example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Contact: <sip:alice@192.168.1.100:5060>\r\n\
                     Expires: 3600\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_request());
        assert_eq!(msg.method(), Some(SipMethod::Register));
        assert_eq!(msg.call_id().as_deref(), Some("a84b4c76e66710@pc33.example.com"));
        assert_eq!(
            msg.cseq(),
            Some(CSeq {
                number: 314159,
                method: SipMethod::Register
            })
        );
        assert_eq!(msg.branch().as_deref(), Some("z9hG4bK776asdhds"));
        assert_eq!(msg.contact().as_deref(), Some("sip:alice@192.168.1.100:5060"));

        let from = msg.from().unwrap();
        assert_eq!(from.tag.as_deref(), Some("1928301774"));
        assert_eq!(from.user.as_deref(), Some("alice"));
        assert_eq!(msg.to().unwrap().tag, None);
    }

    #[test]
    fn test_parse_challenge_response() {
        let data = b"SIP/2.0 401 Unauthorized\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: <sip:alice@example.com>;tag=1928301774\r\n\
                     To: <sip:alice@example.com>;tag=as6c85cf\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 2 REGISTER\r\n\
                     WWW-Authenticate: Digest algorithm=MD5, realm=\"asterisk\", nonce=\"1f2e,3d\", stale=TRUE\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert_eq!(msg.status(), Some(401));
        assert_eq!(msg.to().unwrap().tag.as_deref(), Some("as6c85cf"));

        let challenge = msg.challenge().unwrap();
        assert_eq!(challenge.realm.as_deref(), Some("asterisk"));
        assert_eq!(challenge.nonce, "1f2e,3d");
        assert!(challenge.stale);
        assert!(!challenge.proxy);
    }

    #[test]
    fn test_parse_proxy_challenge_and_retry_after() {
        let data = b"SIP/2.0 503 Service Unavailable\r\n\
                     Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKabc\r\n\
                     From: <sip:100@pbx>;tag=aa\r\n\
                     To: <sip:200@pbx>\r\n\
                     Call-ID: xyz@10.0.0.2\r\n\
                     CSeq: 1 INVITE\r\n\
                     Retry-After: 2 (maintenance)\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert_eq!(msg.status(), Some(503));
        assert_eq!(msg.retry_after(), Some(2));
        assert!(msg.challenge().is_none());

        let challenge = Challenge::parse("Digest realm=\"pbx\", nonce=\"n1\"", true).unwrap();
        assert!(challenge.proxy);
        assert!(!challenge.stale);
    }

    #[test]
    fn test_notify_sipfrag_body() {
        let data = b"NOTIFY sip:100@10.0.0.2:5060 SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKnot\r\n\
                     From: <sip:200@pbx>;tag=bb\r\n\
                     To: <sip:100@pbx>;tag=aa\r\n\
                     Call-ID: xyz@10.0.0.2\r\n\
                     CSeq: 102 NOTIFY\r\n\
                     Event: refer\r\n\
                     Content-Type: message/sipfrag;version=2.0\r\n\
                     Content-Length: 16\r\n\r\n\
                     SIP/2.0 180 Ring";

        let msg = SipMessage::parse(data).unwrap();
        assert_eq!(msg.method(), Some(SipMethod::Notify));
        assert_eq!(
            msg.notify_status(),
            Some(NotifyStatus {
                code: 180,
                reason: "Ring".into()
            })
        );
    }

    #[test]
    fn test_name_addr_without_brackets() {
        let addr = NameAddr::parse("sip:bob@example.com;tag=xyz");
        assert_eq!(addr.uri, "sip:bob@example.com");
        assert_eq!(addr.user.as_deref(), Some("bob"));
        assert_eq!(addr.tag.as_deref(), Some("xyz"));
    }

    #[test]
    fn test_garbage_is_parse_error() {
        assert!(SipMessage::parse(b"\x00\x01 not sip").is_err());
        assert!(NotifyStatus::parse(b"hello").is_none());
        assert!("12".parse::<CSeq>().is_err());
    }
}
