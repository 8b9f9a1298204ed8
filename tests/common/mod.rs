//! Loopback fake PBX shared by the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use voicecore::config::Config;
use voicecore::infrastructure::protocols::sip::{SipMessage, SipMethod, UdpTransport};
use voicecore::{PhoneEvent, SessionController};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct FakePbx {
    pub socket: UdpSocket,
}

impl FakePbx {
    pub async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub async fn recv(&self) -> (SipMessage, SocketAddr) {
        let mut buf = vec![0u8; 65_535];
        let (len, source) = tokio::time::timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .expect("SIP datagram in time")
            .unwrap();
        (SipMessage::parse(&buf[..len]).unwrap(), source)
    }

    /// Next request with `method`, skipping anything else
    pub async fn expect(&self, method: SipMethod) -> (SipMessage, SocketAddr) {
        loop {
            let (message, source) = self.recv().await;
            if message.method() == Some(method) {
                return (message, source);
            }
        }
    }

    /// Next response, skipping requests
    pub async fn expect_response(&self) -> SipMessage {
        loop {
            let (message, _) = self.recv().await;
            if message.is_response() {
                return message;
            }
        }
    }

    pub async fn send(&self, text: &str, to: SocketAddr) {
        self.socket.send_to(text.as_bytes(), to).await.unwrap();
    }

    pub async fn reply(&self, request: &SipMessage, status: u16, extra: &[&str], to: SocketAddr) {
        self.reply_with_body(request, status, extra, "", to).await;
    }

    pub async fn reply_with_body(
        &self,
        request: &SipMessage,
        status: u16,
        extra: &[&str],
        body: &str,
        to: SocketAddr,
    ) {
        let text = response(request, status, extra, body);
        self.send(&text, to).await;
    }
}

/// Response text echoing the dialog headers of `request`
pub fn response(request: &SipMessage, status: u16, extra: &[&str], body: &str) -> String {
    let cseq = request.cseq().unwrap();
    let to = request.to().unwrap();
    let mut text = format!("SIP/2.0 {} Test\r\n", status);
    text.push_str(&format!("Via: {}\r\n", request.via().unwrap()));
    text.push_str(&format!("From: {}\r\n", request.from().unwrap().raw));
    if to.tag.is_none() && status > 100 {
        text.push_str(&format!("To: {};tag=pbx\r\n", to.raw));
    } else {
        text.push_str(&format!("To: {}\r\n", to.raw));
    }
    text.push_str(&format!("Call-ID: {}\r\n", request.call_id().unwrap()));
    text.push_str(&format!("CSeq: {} {}\r\n", cseq.number, cseq.method));
    for line in extra {
        text.push_str(line);
        text.push_str("\r\n");
    }
    text.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    text
}

/// Request from extension 200 to the phone
pub fn request(
    method: &str,
    call_id: &str,
    cseq: u32,
    from_tag: &str,
    pbx: SocketAddr,
    content_type: Option<&str>,
    body: &str,
) -> String {
    let mut text = format!("{} sip:100@127.0.0.1 SIP/2.0\r\n", method);
    text.push_str(&format!(
        "Via: SIP/2.0/UDP {};branch=z9hG4bK{}{}\r\n",
        pbx, method, cseq
    ));
    text.push_str(&format!("From: <sip:200@127.0.0.1>;tag={}\r\n", from_tag));
    text.push_str("To: <sip:100@127.0.0.1>\r\n");
    text.push_str(&format!("Call-ID: {}\r\n", call_id));
    text.push_str(&format!("CSeq: {} {}\r\n", cseq, method));
    text.push_str(&format!("Contact: <sip:200@{}>\r\n", pbx));
    text.push_str("Max-Forwards: 70\r\n");
    if let Some(content_type) = content_type {
        text.push_str(&format!("Content-Type: {}\r\n", content_type));
    }
    text.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    text
}

pub fn audio_sdp(port: u16, payload_types: &str) -> String {
    format!(
        "v=0\r\n\
         o=pbx 1 1 IN IP4 127.0.0.1\r\n\
         s=pbx\r\n\
         c=IN IP4 127.0.0.1\r\n\
         t=0 0\r\n\
         m=audio {} RTP/AVP {}\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=rtpmap:8 PCMA/8000\r\n",
        port, payload_types
    )
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.account.username = "100".to_string();
    config.account.password = "secret".to_string();
    config.account.server_host = "127.0.0.1".to_string();
    config.account.local_ip = "127.0.0.1".to_string();
    config.account.expiry_secs = 60;
    config.media.rtp_port_min = 30000;
    config.media.rtp_port_max = 39998;
    config.media.keepalive_interval_secs = 1;
    config.transactions.retry_after_default_secs = 1;
    config
}

/// Controller wired to `pbx`, plus the phone's own SIP address
pub async fn controller(
    pbx: &FakePbx,
) -> (SessionController, mpsc::UnboundedReceiver<PhoneEvent>, SocketAddr) {
    let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let phone = voicecore::infrastructure::protocols::sip::Transport::local_addr(&transport)
        .unwrap();
    let mut config = test_config();
    config.account.local_port = phone.port();
    config.account.server_port = pbx.addr().port();

    let (controller, events) =
        SessionController::with_transport(config, Arc::new(transport), pbx.addr()).unwrap();
    (controller, events, phone)
}

/// Next event matching `pick`, skipping others
pub async fn next_event<F>(events: &mut mpsc::UnboundedReceiver<PhoneEvent>, mut pick: F) -> PhoneEvent
where
    F: FnMut(&PhoneEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if pick(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event in time")
}
