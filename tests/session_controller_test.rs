//! Session controller against a loopback fake PBX

mod common;

use common::*;
use tokio::net::UdpSocket;
use tokio_test::{assert_err, assert_ok};
use voicecore::domain::call::{CallState, EndReason};
use voicecore::infrastructure::media::{Codec, RtpPacket};
use voicecore::infrastructure::protocols::sip::{SdpSession, SipMessage, SipMethod, TransactionState};
use voicecore::PhoneEvent;

async fn first_audio_packet(peer: &UdpSocket) -> RtpPacket {
    let mut buf = [0u8; 2048];
    loop {
        let (len, _) = tokio::time::timeout(WAIT, peer.recv_from(&mut buf))
            .await
            .expect("RTP in time")
            .unwrap();
        if let Ok(packet) = RtpPacket::parse(&buf[..len]) {
            if packet.payload_type <= 8 {
                return packet;
            }
        }
    }
}

fn offered_port(message: &SipMessage) -> u16 {
    let sdp = SdpSession::parse(std::str::from_utf8(message.body()).unwrap()).unwrap();
    sdp.audio_endpoint().unwrap().port()
}

#[tokio::test]
async fn test_register_answers_challenge() {
    let pbx = FakePbx::bind().await;
    let (controller, mut events, _) = controller(&pbx).await;

    let script = async {
        let (first, phone) = pbx.expect(SipMethod::Register).await;
        assert!(first.header("Authorization").is_none());
        pbx.reply(
            &first,
            401,
            &[r#"WWW-Authenticate: Digest realm="pbx", nonce="n-1""#],
            phone,
        )
        .await;

        let (second, phone) = pbx.expect(SipMethod::Register).await;
        assert_eq!(second.call_id(), first.call_id());
        assert_eq!(second.cseq().unwrap().number, 2);
        assert!(second.header("Authorization").unwrap().contains(r#"nonce="n-1""#));
        pbx.reply(&second, 200, &["Expires: 60"], phone).await;
    };

    let (outcome, _) = tokio::join!(controller.register(), script);
    assert!(outcome.success);
    assert_eq!(outcome.state, TransactionState::Complete);
    assert!(outcome.handle.is_some());

    let event = next_event(&mut events, |_| true).await;
    assert_eq!(event, PhoneEvent::Registered { expires: 60 });
}

#[tokio::test]
async fn test_register_forbidden_reports_failure() {
    let pbx = FakePbx::bind().await;
    let (controller, mut events, _) = controller(&pbx).await;

    let script = async {
        let (request, phone) = pbx.expect(SipMethod::Register).await;
        pbx.reply(&request, 403, &[], phone).await;
    };

    let (outcome, _) = tokio::join!(controller.register(), script);
    assert!(!outcome.success);
    assert_eq!(outcome.status, Some(403));

    let event = next_event(&mut events, |_| true).await;
    assert_eq!(event, PhoneEvent::RegistrationFailed { status: Some(403) });
}

#[tokio::test]
async fn test_failed_refresh_reports_lost_registration() {
    let pbx = FakePbx::bind().await;
    let (controller, mut events, _) = controller(&pbx).await;

    let script = async {
        let (request, phone) = pbx.expect(SipMethod::Register).await;
        // refreshed one second later
        pbx.reply(&request, 200, &["Expires: 6"], phone).await;
    };
    let (outcome, _) = tokio::join!(controller.register(), script);
    assert!(outcome.success);
    assert_eq!(
        next_event(&mut events, |_| true).await,
        PhoneEvent::Registered { expires: 60 }
    );

    let (refresh, phone) = pbx.expect(SipMethod::Register).await;
    assert_eq!(refresh.call_id(), outcome.handle.as_ref().map(|h| h.snapshot().ids.call_id));
    pbx.reply(&refresh, 403, &[], phone).await;

    let event = next_event(&mut events, |e| {
        matches!(e, PhoneEvent::RegistrationFailed { .. })
    })
    .await;
    assert_eq!(event, PhoneEvent::RegistrationFailed { status: Some(403) });

    // nothing left to deregister
    assert!(controller.unregister().await.is_none());
}

#[tokio::test]
async fn test_outbound_call_answered_and_hung_up() {
    let pbx = FakePbx::bind().await;
    let (controller, mut events, _) = controller(&pbx).await;
    let media_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let media_port = media_peer.local_addr().unwrap().port();

    let script = async {
        let (invite, phone) = pbx.expect(SipMethod::Invite).await;
        let port = offered_port(&invite);
        assert_eq!(port % 2, 0);
        assert!((30000..=39998).contains(&port));

        pbx.reply(&invite, 100, &[], phone).await;
        pbx.reply(&invite, 180, &[], phone).await;
        pbx.reply_with_body(
            &invite,
            200,
            &["Content-Type: application/sdp", "Contact: <sip:200@127.0.0.1>"],
            &audio_sdp(media_port, "0"),
            phone,
        )
        .await;
        let (ack, _) = pbx.expect(SipMethod::Ack).await;
        (invite, ack)
    };

    let (outcome, (invite, ack)) = tokio::join!(controller.call("200"), script);
    let outcome = assert_ok!(outcome);
    assert!(outcome.success);
    assert_eq!(outcome.state, TransactionState::Complete);
    assert_eq!(Some(outcome.call_id.clone()), invite.call_id());
    assert_eq!(ack.to().unwrap().tag.as_deref(), Some("pbx"));

    let answered = next_event(&mut events, |e| matches!(e, PhoneEvent::Answered { .. })).await;
    assert_eq!(
        answered,
        PhoneEvent::Answered {
            call_id: outcome.call_id.clone(),
            codec: Codec::PCMU,
        }
    );
    assert_eq!(
        controller.call_state(&outcome.call_id).await,
        Some(CallState::Answered)
    );
    assert_eq!(first_audio_packet(&media_peer).await.payload_type, 0);

    assert_ok!(controller.hangup(&outcome.call_id).await);
    let (bye, _) = pbx.expect(SipMethod::Bye).await;
    assert_eq!(bye.call_id(), invite.call_id());
    assert_eq!(bye.cseq().unwrap().number, 2);
    assert_eq!(bye.to().unwrap().tag.as_deref(), Some("pbx"));

    let ended = next_event(&mut events, |e| matches!(e, PhoneEvent::CallEnded { .. })).await;
    assert_eq!(
        ended,
        PhoneEvent::CallEnded {
            call_id: outcome.call_id.clone(),
            reason: EndReason::LocalHangup,
        }
    );
    assert!(controller.active_calls().await.is_empty());
}

#[tokio::test]
async fn test_outbound_call_answered_after_ringing() {
    let pbx = FakePbx::bind().await;
    let (controller, mut events, _) = controller(&pbx).await;
    let media_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let media_port = media_peer.local_addr().unwrap().port();

    let script = async {
        let (invite, phone) = pbx.expect(SipMethod::Invite).await;
        pbx.reply(&invite, 180, &[], phone).await;
        (invite, phone)
    };
    let (outcome, (invite, phone)) = tokio::join!(controller.call("200"), script);
    let outcome = assert_ok!(outcome);
    assert!(outcome.success);
    assert_eq!(outcome.state, TransactionState::Ringing);

    let ringing = next_event(&mut events, |_| true).await;
    assert_eq!(
        ringing,
        PhoneEvent::Ringing {
            call_id: outcome.call_id.clone()
        }
    );

    pbx.reply_with_body(
        &invite,
        200,
        &["Content-Type: application/sdp"],
        &audio_sdp(media_port, "8"),
        phone,
    )
    .await;
    pbx.expect(SipMethod::Ack).await;

    let answered = next_event(&mut events, |e| matches!(e, PhoneEvent::Answered { .. })).await;
    assert_eq!(
        answered,
        PhoneEvent::Answered {
            call_id: outcome.call_id.clone(),
            codec: Codec::PCMA,
        }
    );
    assert_eq!(first_audio_packet(&media_peer).await.payload_type, 8);
    assert!(controller.media(&outcome.call_id).await.is_some());
}

#[tokio::test]
async fn test_hangup_while_ringing_sends_cancel() {
    let pbx = FakePbx::bind().await;
    let (controller, mut events, _) = controller(&pbx).await;

    let script = async {
        let (invite, phone) = pbx.expect(SipMethod::Invite).await;
        pbx.reply(&invite, 180, &[], phone).await;
        invite
    };
    let (outcome, invite) = tokio::join!(controller.call("200"), script);
    let outcome = assert_ok!(outcome);

    assert_ok!(controller.cancel(&outcome.call_id).await);
    let (cancel, _) = pbx.expect(SipMethod::Cancel).await;
    assert_eq!(cancel.branch(), invite.branch());
    assert_eq!(cancel.cseq().unwrap().number, invite.cseq().unwrap().number);

    let ended = next_event(&mut events, |e| matches!(e, PhoneEvent::CallEnded { .. })).await;
    assert_eq!(
        ended,
        PhoneEvent::CallEnded {
            call_id: outcome.call_id.clone(),
            reason: EndReason::Canceled,
        }
    );
    assert_err!(controller.cancel(&outcome.call_id).await);
}

#[tokio::test]
async fn test_declined_call_is_acked() {
    let pbx = FakePbx::bind().await;
    let (controller, mut events, _) = controller(&pbx).await;

    let script = async {
        let (invite, phone) = pbx.expect(SipMethod::Invite).await;
        pbx.reply(&invite, 486, &[], phone).await;
        let (ack, _) = pbx.expect(SipMethod::Ack).await;
        (invite, ack)
    };
    let (outcome, (invite, ack)) = tokio::join!(controller.call("200"), script);
    let outcome = assert_ok!(outcome);
    assert!(!outcome.success);
    assert_eq!(outcome.status, Some(486));
    assert_eq!(ack.branch(), invite.branch());

    let ended = next_event(&mut events, |_| true).await;
    assert_eq!(
        ended,
        PhoneEvent::CallEnded {
            call_id: outcome.call_id,
            reason: EndReason::Declined(486),
        }
    );
}

#[tokio::test]
async fn test_inbound_call_answered_then_remote_bye() {
    let pbx = FakePbx::bind().await;
    let (controller, mut events, phone) = controller(&pbx).await;
    let media_peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let offer = audio_sdp(media_peer.local_addr().unwrap().port(), "8 101");

    pbx.send(
        &request("INVITE", "in-1@pbx", 1, "caller", pbx.addr(), Some("application/sdp"), &offer),
        phone,
    )
    .await;

    let ringing = pbx.expect_response().await;
    assert_eq!(ringing.status(), Some(180));
    assert!(ringing.to().unwrap().tag.is_some());

    let incoming = next_event(&mut events, |_| true).await;
    assert_eq!(
        incoming,
        PhoneEvent::IncomingCall {
            call_id: "in-1@pbx".to_string(),
            from: "200".to_string(),
        }
    );

    assert_ok!(controller.answer("in-1@pbx").await);
    let ok = pbx.expect_response().await;
    assert_eq!(ok.status(), Some(200));
    assert_eq!(ok.to().unwrap().tag, ringing.to().unwrap().tag);
    let answer = SdpSession::parse(std::str::from_utf8(ok.body()).unwrap()).unwrap();
    assert_eq!(answer.audio_codecs(), vec![8, 101]);

    let answered = next_event(&mut events, |e| matches!(e, PhoneEvent::Answered { .. })).await;
    assert_eq!(
        answered,
        PhoneEvent::Answered {
            call_id: "in-1@pbx".to_string(),
            codec: Codec::PCMA,
        }
    );
    assert_eq!(first_audio_packet(&media_peer).await.payload_type, 8);

    pbx.send(
        &request("BYE", "in-1@pbx", 2, "caller", pbx.addr(), None, ""),
        phone,
    )
    .await;
    assert_eq!(pbx.expect_response().await.status(), Some(200));

    let ended = next_event(&mut events, |e| matches!(e, PhoneEvent::CallEnded { .. })).await;
    assert_eq!(
        ended,
        PhoneEvent::CallEnded {
            call_id: "in-1@pbx".to_string(),
            reason: EndReason::RemoteHangup,
        }
    );
    assert!(controller.call_state("in-1@pbx").await.is_none());
}

#[tokio::test]
async fn test_inbound_call_rejected() {
    let pbx = FakePbx::bind().await;
    let (controller, mut events, phone) = controller(&pbx).await;

    pbx.send(
        &request("INVITE", "in-2@pbx", 1, "caller", pbx.addr(), Some("application/sdp"), &audio_sdp(40000, "0")),
        phone,
    )
    .await;
    assert_eq!(pbx.expect_response().await.status(), Some(180));
    next_event(&mut events, |e| matches!(e, PhoneEvent::IncomingCall { .. })).await;

    assert_ok!(controller.reject("in-2@pbx").await);
    assert_eq!(pbx.expect_response().await.status(), Some(486));
    let ended = next_event(&mut events, |_| true).await;
    assert_eq!(
        ended,
        PhoneEvent::CallEnded {
            call_id: "in-2@pbx".to_string(),
            reason: EndReason::Rejected,
        }
    );
}

#[tokio::test]
async fn test_inbound_cancel_terminates_invite() {
    let pbx = FakePbx::bind().await;
    let (_controller, mut events, phone) = controller(&pbx).await;

    pbx.send(
        &request("INVITE", "in-3@pbx", 1, "caller", pbx.addr(), Some("application/sdp"), &audio_sdp(40000, "0")),
        phone,
    )
    .await;
    assert_eq!(pbx.expect_response().await.status(), Some(180));

    pbx.send(
        &request("CANCEL", "in-3@pbx", 1, "caller", pbx.addr(), None, ""),
        phone,
    )
    .await;
    let mut statuses = vec![
        pbx.expect_response().await.status(),
        pbx.expect_response().await.status(),
    ];
    statuses.sort();
    assert_eq!(statuses, vec![Some(200), Some(487)]);

    let ended = next_event(&mut events, |e| matches!(e, PhoneEvent::CallEnded { .. })).await;
    assert_eq!(
        ended,
        PhoneEvent::CallEnded {
            call_id: "in-3@pbx".to_string(),
            reason: EndReason::Canceled,
        }
    );
}

#[tokio::test]
async fn test_options_and_message_are_answered() {
    let pbx = FakePbx::bind().await;
    let (_controller, mut events, phone) = controller(&pbx).await;

    pbx.send(&request("OPTIONS", "ping@pbx", 1, "p", pbx.addr(), None, ""), phone)
        .await;
    let pong = pbx.expect_response().await;
    assert_eq!(pong.status(), Some(200));
    assert_eq!(pong.call_id().as_deref(), Some("ping@pbx"));

    pbx.send(
        &request("MESSAGE", "msg@pbx", 1, "m", pbx.addr(), Some("text/plain"), "hello there"),
        phone,
    )
    .await;
    assert_eq!(pbx.expect_response().await.status(), Some(200));

    let event = next_event(&mut events, |_| true).await;
    assert_eq!(
        event,
        PhoneEvent::MessageReceived {
            from: "200".to_string(),
            text: "hello there".to_string(),
        }
    );
}

#[tokio::test]
async fn test_shutdown_deregisters_and_unsubscribes() {
    let pbx = FakePbx::bind().await;
    let (controller, _events, _) = controller(&pbx).await;
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

    let autoreply = tokio::spawn(async move {
        loop {
            let (message, phone) = pbx.recv().await;
            let Some(method) = message.method() else {
                continue;
            };
            let _ = seen_tx.send((method, message.header("Expires")));
            if method != SipMethod::Ack {
                pbx.reply(&message, 200, &[], phone).await;
            }
        }
    });

    assert!(controller.register().await.success);
    controller.shutdown().await;
    assert!(!controller.is_running());
    autoreply.abort();

    let mut seen = Vec::new();
    while let Ok(entry) = seen_rx.try_recv() {
        seen.push(entry);
    }
    assert_eq!(seen[0], (SipMethod::Register, Some("60".to_string())));
    assert!(seen.contains(&(SipMethod::Register, Some("0".to_string()))));
    assert!(seen.contains(&(SipMethod::Subscribe, Some("0".to_string()))));
}
