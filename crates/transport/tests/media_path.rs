//! Media path over real UDP sockets: RTP in through the ingress pipeline,
//! playout out through the RTP frame sink.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use voice_bridge_config::{IngressConfig, PlayoutConfig, TelephonyConfig};
use voice_bridge_core::{AudioFormat, G711Law};
use voice_bridge_transport::{
    G711Codec, IngressPipeline, PlayoutEngine, RtpPacket, RtpUdpTransport, TelephonyTransport,
};

fn telephony(remote: Option<String>) -> TelephonyConfig {
    TelephonyConfig {
        local_addr: "127.0.0.1:0".to_string(),
        remote_addr: remote,
        ssrc: Some(0x1234),
        ..TelephonyConfig::default()
    }
}

fn tone_frame(offset: usize) -> Vec<i16> {
    (0..160)
        .map(|i| (((offset + i) as f32 * 0.2).sin() * 5000.0) as i16)
        .collect()
}

#[tokio::test]
async fn test_reordered_rtp_is_conditioned_in_order() {
    let transport = RtpUdpTransport::bind(&telephony(None)).await.unwrap();
    let addr = transport.local_addr().unwrap();
    let mut inbound = transport.subscribe().unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let codec = G711Codec::new(G711Law::ALaw);
    let order = [1u32, 0, 2, 4, 3, 5, 6, 7];
    for index in order {
        let payload = codec.encode(&tone_frame(index as usize * 160));
        let packet = RtpPacket::new(8, index as u16, 8000 + index * 160, 77, payload);
        peer.send_to(&packet.to_bytes(), addr).await.unwrap();
    }

    let mut pipeline = IngressPipeline::new(&IngressConfig::default(), G711Law::ALaw, 16000);
    let mut timestamps = Vec::new();
    for _ in 0..order.len() {
        let packet = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        for frame in pipeline.push_packet(&packet) {
            assert_eq!(frame.frame.len(), 640);
            assert!(!frame.concealed);
            timestamps.push(frame.timestamp);
        }
    }

    assert!(timestamps.len() >= 5);
    assert_eq!(timestamps[0], 8000);
    for pair in timestamps.windows(2) {
        assert_eq!(pair[1] - pair[0], 160);
    }

    let info = transport.accept_call().await.unwrap();
    assert_eq!(info.remote_addr, Some(peer.local_addr().unwrap().to_string()));
}

#[tokio::test]
async fn test_playout_emits_paced_rtp() {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let transport = RtpUdpTransport::bind(&telephony(Some(peer.local_addr().unwrap().to_string())))
        .await
        .unwrap();

    let config = PlayoutConfig {
        elevated_priority: false,
        ..PlayoutConfig::default()
    };
    let (engine, _events) = PlayoutEngine::new(config, AudioFormat::G711(G711Law::ALaw));
    let engine = Arc::new(engine);
    let codec = G711Codec::new(G711Law::ALaw);
    for i in 0..12 {
        engine.push(&codec.encode(&tone_frame(i * 160)));
    }
    engine.start(transport.frame_sink()).unwrap();

    let mut buf = [0u8; 1500];
    let mut packets = Vec::new();
    while packets.len() < 15 {
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        packets.push(RtpPacket::parse(&buf[..len]).unwrap());
    }
    engine.stop();

    assert!(packets[0].marker);
    for packet in &packets {
        assert_eq!(packet.payload_type, 8);
        assert_eq!(packet.ssrc, 0x1234);
        assert_eq!(packet.payload.len(), 160);
    }
    for pair in packets.windows(2) {
        assert_eq!(pair[1].sequence, pair[0].sequence.wrapping_add(1));
        assert_eq!(pair[1].timestamp.wrapping_sub(pair[0].timestamp), 160);
    }

    // Twelve queued frames of tone, then silence
    let audible = packets
        .iter()
        .filter(|p| p.payload.iter().any(|b| *b != 0xD5))
        .count();
    assert_eq!(audible, 12);
    assert!(engine.stats().frames_sent >= 15);
}
