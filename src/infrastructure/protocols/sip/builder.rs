//! SIP message builder
//!
//! Requests are rendered from text templates; responses to inbound requests
//! are assembled with `rsip` from the request's own headers.

use super::auth::AuthInfo;
use super::message::{SipError, SipMethod, SipRequest};
use crate::domain::call::DialogIds;
use bytes::Bytes;
use rsip::prelude::UntypedHeader;
use rsip::{Header, Headers, Response, StatusCode, Version};

const ALLOW: &str = "INVITE, ACK, CANCEL, BYE, NOTIFY, REFER, MESSAGE, OPTIONS, INFO, SUBSCRIBE";
const MAX_FORWARDS: u32 = 70;

/// Fields of the local account every message carries
#[derive(Debug, Clone)]
pub struct LocalAccount {
    pub username: String,
    pub server_host: String,
    pub server_port: u16,
    pub local_ip: String,
    pub local_port: u16,
    pub user_agent: String,
}

/// Attended transfer target dialog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replaces {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
}

impl Replaces {
    /// Escaped `?Replaces=` suffix for a Refer-To URI
    pub fn to_uri_suffix(&self) -> String {
        format!(
            "?Replaces={}%3Bto-tag%3D{}%3Bfrom-tag%3D{}",
            self.call_id.replace('@', "%40"),
            self.to_tag,
            self.from_tag
        )
    }
}

/// One request about to be rendered
struct Draft<'a> {
    method: SipMethod,
    uri: String,
    ids: &'a DialogIds,
    to_user: &'a str,
    branch: &'a str,
    cseq: u32,
    auth: Option<&'a AuthInfo>,
    extra: Vec<(&'static str, String)>,
    content_type: Option<&'static str>,
    body: &'a str,
}

/// Builds wire-ready SIP requests and responses for one account
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    account: LocalAccount,
}

impl RequestBuilder {
    pub fn new(account: LocalAccount) -> Self {
        Self { account }
    }

    pub fn account(&self) -> &LocalAccount {
        &self.account
    }

    /// Request-URI (and digest URI) of REGISTER
    pub fn register_uri(&self) -> String {
        format!("sip:{}", self.account.server_host)
    }

    /// Request-URI of an initial INVITE or a MESSAGE
    pub fn invite_uri(&self, number: &str) -> String {
        format!("sip:{}@{}", number, self.account.server_host)
    }

    pub fn subscribe_uri(&self) -> String {
        format!(
            "sip:Unknown@{}:{}",
            self.account.server_host, self.account.server_port
        )
    }

    /// Request-URI of re-INVITE, REFER and BYE
    pub fn in_dialog_uri(&self, number: &str) -> String {
        format!(
            "sip:{}@{}:{}",
            number, self.account.server_host, self.account.server_port
        )
    }

    fn contact(&self) -> String {
        format!(
            "<sip:{}@{}:{}>",
            self.account.username, self.account.local_ip, self.account.local_port
        )
    }

    fn render(&self, draft: Draft<'_>) -> Bytes {
        let account = &self.account;
        let mut msg = String::with_capacity(512 + draft.body.len());

        msg.push_str(&format!("{} {} SIP/2.0\r\n", draft.method, draft.uri));
        msg.push_str(&format!(
            "Via: SIP/2.0/UDP {}:{};branch={};rport\r\n",
            account.local_ip, account.local_port, draft.branch
        ));
        msg.push_str(&format!("Max-Forwards: {}\r\n", MAX_FORWARDS));
        msg.push_str(&format!("Contact: {}\r\n", self.contact()));
        msg.push_str(&format!("To: <sip:{}@{}>", draft.to_user, account.server_host));
        if let Some(tag) = &draft.ids.remote_tag {
            msg.push_str(&format!(";tag={}", tag));
        }
        msg.push_str("\r\n");
        msg.push_str(&format!(
            "From: <sip:{}@{}>;tag={}\r\n",
            account.username, account.server_host, draft.ids.local_tag
        ));
        msg.push_str(&format!("Call-ID: {}\r\n", draft.ids.call_id));
        msg.push_str(&format!("CSeq: {} {}\r\n", draft.cseq, draft.method));
        if let Some(auth) = draft.auth {
            msg.push_str(&format!("{}: {}\r\n", auth.header_name(), auth));
        }
        msg.push_str(&format!("User-Agent: {}\r\n", account.user_agent));
        msg.push_str(&format!("Allow: {}\r\n", ALLOW));
        for (name, value) in &draft.extra {
            msg.push_str(&format!("{}: {}\r\n", name, value));
        }
        if let Some(content_type) = draft.content_type {
            msg.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        msg.push_str(&format!("Content-Length: {}\r\n\r\n", draft.body.len()));
        msg.push_str(draft.body);

        Bytes::from(msg)
    }

    /// REGISTER binding the account for `expires` seconds
    pub fn register(
        &self,
        ids: &DialogIds,
        branch: &str,
        cseq: u32,
        expires: u32,
        auth: Option<&AuthInfo>,
    ) -> Bytes {
        self.render(Draft {
            method: SipMethod::Register,
            uri: self.register_uri(),
            ids,
            to_user: &self.account.username,
            branch,
            cseq,
            auth,
            extra: vec![("Expires", expires.to_string())],
            content_type: None,
            body: "",
        })
    }

    /// REGISTER with `Expires: 0`
    pub fn remove(&self, ids: &DialogIds, branch: &str, cseq: u32, auth: Option<&AuthInfo>) -> Bytes {
        self.register(ids, branch, cseq, 0, auth)
    }

    /// SUBSCRIBE to message-summary with `Expires: 0`
    pub fn subscribe_remove(
        &self,
        ids: &DialogIds,
        branch: &str,
        cseq: u32,
        auth: Option<&AuthInfo>,
    ) -> Bytes {
        self.render(Draft {
            method: SipMethod::Subscribe,
            uri: self.subscribe_uri(),
            ids,
            to_user: &self.account.username,
            branch,
            cseq,
            auth,
            extra: vec![
                ("Event", "message-summary".to_string()),
                ("Accept", "application/simple-message-summary".to_string()),
                ("Expires", "0".to_string()),
            ],
            content_type: None,
            body: "",
        })
    }

    /// INVITE carrying an SDP offer; `uri` selects initial or in-dialog form
    pub fn invite(
        &self,
        uri: &str,
        ids: &DialogIds,
        branch: &str,
        cseq: u32,
        sdp: &str,
        auth: Option<&AuthInfo>,
    ) -> Bytes {
        self.render(Draft {
            method: SipMethod::Invite,
            uri: uri.to_string(),
            ids,
            to_user: &ids.remote_user,
            branch,
            cseq,
            auth,
            extra: Vec::new(),
            content_type: Some("application/sdp"),
            body: sdp,
        })
    }

    /// REFER towards `target`, attended when `replaces` is given
    pub fn refer(
        &self,
        ids: &DialogIds,
        branch: &str,
        cseq: u32,
        target: &str,
        replaces: Option<&Replaces>,
        auth: Option<&AuthInfo>,
    ) -> Bytes {
        let suffix = replaces.map(Replaces::to_uri_suffix).unwrap_or_default();
        self.render(Draft {
            method: SipMethod::Refer,
            uri: self.in_dialog_uri(&ids.remote_user),
            ids,
            to_user: &ids.remote_user,
            branch,
            cseq,
            auth,
            extra: vec![
                (
                    "Refer-To",
                    format!("<sip:{}@{}{}>", target, self.account.server_host, suffix),
                ),
                (
                    "Referred-By",
                    format!("<sip:{}@{}>", self.account.username, self.account.server_host),
                ),
            ],
            content_type: None,
            body: "",
        })
    }

    /// MESSAGE with a text/plain body
    pub fn message(
        &self,
        ids: &DialogIds,
        branch: &str,
        cseq: u32,
        text: &str,
        auth: Option<&AuthInfo>,
    ) -> Bytes {
        self.render(Draft {
            method: SipMethod::Message,
            uri: self.invite_uri(&ids.remote_user),
            ids,
            to_user: &ids.remote_user,
            branch,
            cseq,
            auth,
            extra: Vec::new(),
            content_type: Some("text/plain"),
            body: text,
        })
    }

    /// ACK for an INVITE answered on `uri`
    pub fn ack(
        &self,
        uri: &str,
        ids: &DialogIds,
        branch: &str,
        cseq: u32,
        auth: Option<&AuthInfo>,
    ) -> Bytes {
        self.render(Draft {
            method: SipMethod::Ack,
            uri: uri.to_string(),
            ids,
            to_user: &ids.remote_user,
            branch,
            cseq,
            auth,
            extra: Vec::new(),
            content_type: None,
            body: "",
        })
    }

    pub fn bye(&self, ids: &DialogIds, branch: &str, cseq: u32, auth: Option<&AuthInfo>) -> Bytes {
        self.render(Draft {
            method: SipMethod::Bye,
            uri: self.in_dialog_uri(&ids.remote_user),
            ids,
            to_user: &ids.remote_user,
            branch,
            cseq,
            auth,
            extra: Vec::new(),
            content_type: None,
            body: "",
        })
    }

    /// CANCEL matching a pending INVITE (same branch and CSeq number)
    pub fn cancel(&self, ids: &DialogIds, branch: &str, cseq: u32) -> Bytes {
        self.render(Draft {
            method: SipMethod::Cancel,
            uri: self.invite_uri(&ids.remote_user),
            ids,
            to_user: &ids.remote_user,
            branch,
            cseq,
            auth: None,
            extra: Vec::new(),
            content_type: None,
            body: "",
        })
    }

    pub fn ok(&self, request: &SipRequest) -> Result<Bytes, SipError> {
        self.respond(request, 200, None, None)
    }

    pub fn ringing(&self, request: &SipRequest, to_tag: &str) -> Result<Bytes, SipError> {
        self.respond(request, 180, Some(to_tag), None)
    }

    /// 486 Busy Here
    pub fn busy(&self, request: &SipRequest, to_tag: &str) -> Result<Bytes, SipError> {
        self.respond(request, 486, Some(to_tag), None)
    }

    /// 487 for an INVITE whose CANCEL was accepted
    pub fn request_terminated(&self, request: &SipRequest, to_tag: &str) -> Result<Bytes, SipError> {
        self.respond(request, 487, Some(to_tag), None)
    }

    /// 200 OK with an SDP answer
    pub fn answer(&self, request: &SipRequest, to_tag: &str, sdp: &str) -> Result<Bytes, SipError> {
        self.respond(request, 200, Some(to_tag), Some(sdp))
    }

    fn respond(
        &self,
        request: &SipRequest,
        status_code: u16,
        to_tag: Option<&str>,
        sdp: Option<&str>,
    ) -> Result<Bytes, SipError> {
        let mut headers: Vec<Header> = Vec::new();

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                Header::To(to) => {
                    let value = to.value();
                    match to_tag {
                        Some(tag) if !value.contains(";tag=") => {
                            headers.push(Header::To(format!("{};tag={}", value, tag).into()));
                        }
                        _ => headers.push(header.clone()),
                    }
                }
                _ => {}
            }
        }
        if !headers.iter().any(|h| matches!(h, Header::CallId(_))) {
            return Err(SipError::InvalidMessage(
                "request has no Call-ID to answer".to_string(),
            ));
        }

        headers.push(Header::Contact(self.contact().into()));
        headers.push(Header::UserAgent(self.account.user_agent.clone().into()));
        headers.push(Header::Allow(ALLOW.into()));

        let body = sdp.map(|s| s.as_bytes().to_vec()).unwrap_or_default();
        if sdp.is_some() {
            headers.push(Header::ContentType("application/sdp".into()));
        }
        headers.push(Header::ContentLength(body.len().to_string().into()));

        let response = Response {
            status_code: StatusCode::from(status_code),
            headers: Headers::from(headers),
            body,
            version: Version::V2,
        };
        Ok(Bytes::from(response.to_string()))
    }
}
