//! Media session hold behaviour seen from the remote RTP peer

use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::advance;
use voicecore::infrastructure::media::{
    MediaSession, MediaSessionConfig, RtpPacket, PT_KEEPALIVE,
};

const KEEPALIVE: Duration = Duration::from_secs(10);

async fn session_towards(peer: &UdpSocket) -> MediaSession {
    let mut config = MediaSessionConfig::new(
        "127.0.0.1:0".parse().unwrap(),
        peer.local_addr().unwrap(),
        0,
    );
    config.keepalive_interval = KEEPALIVE;
    MediaSession::start(config, None).await.unwrap()
}

/// Let woken timer tasks run to completion
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Every RTP packet already queued on the peer socket
fn drain(peer: &UdpSocket) -> Vec<RtpPacket> {
    let mut packets = Vec::new();
    let mut buf = [0u8; 2048];
    while let Ok((len, _)) = peer.try_recv_from(&mut buf) {
        if let Ok(packet) = RtpPacket::parse(&buf[..len]) {
            packets.push(packet);
        }
    }
    packets
}

fn keepalives(packets: &[RtpPacket]) -> usize {
    packets
        .iter()
        .filter(|p| p.payload_type == PT_KEEPALIVE)
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_hold_swaps_audio_for_keepalives() {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = session_towards(&peer).await;
    settle().await;

    let before = drain(&peer);
    assert!(before.iter().any(|p| p.payload_type == 0));
    assert_eq!(keepalives(&before), 0);

    session.set_hold(true).await;
    assert!(session.is_on_hold());
    settle().await;
    let entering = drain(&peer);
    assert_eq!(keepalives(&entering), 1);
    assert!(entering.iter().all(|p| p.payload_type == PT_KEEPALIVE));
    assert!(entering.iter().all(|p| p.timestamp == 0 && p.payload[..] == [0; 4]));

    for _ in 0..3 {
        advance(KEEPALIVE).await;
        settle().await;
        let held = drain(&peer);
        assert_eq!(keepalives(&held), 1);
        assert!(held.iter().all(|p| p.payload_type == PT_KEEPALIVE));
    }

    // nothing goes out for DTMF while held
    assert!(!session.send_dtmf(&[1]).await);

    session.set_hold(false).await;
    assert!(!session.is_on_hold());
    let mut resumed = Vec::new();
    for _ in 0..3 {
        advance(KEEPALIVE).await;
        settle().await;
        resumed.extend(drain(&peer));
    }
    assert_eq!(keepalives(&resumed), 0);
    assert!(resumed.iter().any(|p| p.payload_type == 0));

    session.stop().await;
    assert!(!session.is_alive());
}
