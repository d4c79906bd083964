//! RTP over UDP adapter
//!
//! Inbound datagrams are parsed on a receive task and forwarded to the single
//! subscriber. Outbound frames are written with the non-blocking
//! `try_send_to` so the pacing thread never waits on the socket. When no
//! remote address is configured it is learned from the first valid packet.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use voice_bridge_config::TelephonyConfig;
use voice_bridge_core::G711Law;

use crate::rtp::{write_packet, RtpHeader, RtpPacket};
use crate::traits::{CallInfo, FrameSink, TelephonyTransport};
use crate::TransportError;

/// Inbound packets buffered between the socket and the ingress pipeline
const INBOUND_CAPACITY: usize = 256;

const MAX_DATAGRAM: usize = 1500;

type RemoteAddr = Arc<RwLock<Option<SocketAddr>>>;

fn parse_addr(addr: &str) -> Result<SocketAddr, TransportError> {
    addr.parse()
        .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", addr, e)))
}

/// Outbound RTP stream
pub struct RtpFrameSink {
    socket: Arc<UdpSocket>,
    remote: RemoteAddr,
    active: Arc<AtomicBool>,
    payload_type: u8,
    ssrc: u32,
    sequence: AtomicU16,
    first: AtomicBool,
    scratch: Mutex<Vec<u8>>,
}

impl FrameSink for RtpFrameSink {
    fn send_frame(&self, frame: &[u8], timestamp: u32) -> Result<(), TransportError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(TransportError::CallEnded);
        }
        let addr = (*self.remote.read()).ok_or(TransportError::NotConnected)?;

        let header = RtpHeader {
            payload_type: self.payload_type,
            marker: self.first.swap(false, Ordering::AcqRel),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp,
            ssrc: self.ssrc,
        };

        let mut buf = self.scratch.lock();
        write_packet(&mut buf, header, frame);
        self.socket
            .try_send_to(&buf, addr)
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Telephony transport over a single RTP/UDP port
pub struct RtpUdpTransport {
    socket: Arc<UdpSocket>,
    law: G711Law,
    remote: RemoteAddr,
    remote_known: Arc<Notify>,
    active: Arc<AtomicBool>,
    inbound: Mutex<Option<mpsc::Receiver<RtpPacket>>>,
    sink: Arc<RtpFrameSink>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl RtpUdpTransport {
    /// Bind the local port and start receiving
    pub async fn bind(config: &TelephonyConfig) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocket::bind(&config.local_addr).await?);
        // try_send_to reports WouldBlock until the reactor has seen the
        // socket writable once
        socket.writable().await?;
        let remote: RemoteAddr = Arc::new(RwLock::new(
            config.remote_addr.as_deref().map(parse_addr).transpose()?,
        ));
        let remote_known = Arc::new(Notify::new());
        let active = Arc::new(AtomicBool::new(true));
        let ssrc = config.ssrc.unwrap_or_else(rand::random);

        let sink = Arc::new(RtpFrameSink {
            socket: socket.clone(),
            remote: remote.clone(),
            active: active.clone(),
            payload_type: config.codec.payload_type(),
            ssrc,
            sequence: AtomicU16::new(rand::random()),
            first: AtomicBool::new(true),
            scratch: Mutex::new(Vec::with_capacity(MAX_DATAGRAM)),
        });

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let receiver = tokio::spawn(receive_loop(
            socket.clone(),
            tx,
            remote.clone(),
            remote_known.clone(),
        ));

        tracing::info!(
            local = %socket.local_addr()?,
            remote = ?*remote.read(),
            codec = ?config.codec,
            ssrc,
            "RTP transport bound"
        );

        Ok(Self {
            socket,
            law: config.codec,
            remote,
            remote_known,
            active,
            inbound: Mutex::new(Some(rx)),
            sink,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.read()
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<RtpPacket>,
    remote: RemoteAddr,
    remote_known: Arc<Notify>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!("RTP receive error: {}", e);
                continue;
            }
        };

        let packet = match RtpPacket::parse(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(%from, "Dropping datagram: {}", e);
                metrics::counter!("voice_bridge_rtp_malformed_total").increment(1);
                continue;
            }
        };

        {
            let mut remote = remote.write();
            if remote.is_none() {
                tracing::info!(%from, "Learned remote RTP address");
                *remote = Some(from);
                remote_known.notify_one();
            }
        }

        match tx.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("voice_bridge_rtp_inbound_dropped_total").increment(1);
                tracing::debug!("Inbound queue full, dropping packet");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
    tracing::debug!("RTP receive loop exited");
}

#[async_trait]
impl TelephonyTransport for RtpUdpTransport {
    async fn accept_call(&self) -> Result<CallInfo, TransportError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(TransportError::CallEnded);
        }
        if self.remote.read().is_none() {
            self.remote_known.notified().await;
        }
        let remote = self.remote_addr();
        Ok(CallInfo {
            call_id: format!("rtp-{:08x}", self.sink.ssrc),
            remote_addr: remote.map(|addr| addr.to_string()),
            codec: self.law,
        })
    }

    fn frame_sink(&self) -> Arc<dyn FrameSink> {
        self.sink.clone()
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<RtpPacket>, TransportError> {
        self.inbound
            .lock()
            .take()
            .ok_or(TransportError::AlreadySubscribed)
    }

    async fn end_call(&self, reason: &str) -> Result<(), TransportError> {
        if self.active.swap(false, Ordering::AcqRel) {
            tracing::info!(reason, "RTP call ended");
            if let Some(receiver) = self.receiver.lock().take() {
                receiver.abort();
            }
        }
        Ok(())
    }

    fn codec(&self) -> G711Law {
        self.law
    }
}

impl Drop for RtpUdpTransport {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.lock().take() {
            receiver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(remote: Option<String>) -> TelephonyConfig {
        TelephonyConfig {
            local_addr: "127.0.0.1:0".to_string(),
            remote_addr: remote,
            ssrc: Some(42),
            ..TelephonyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_learns_remote_and_exchanges_frames() {
        let answering = RtpUdpTransport::bind(&config(None)).await.unwrap();
        let answering_addr = answering.local_addr().unwrap();
        let calling = RtpUdpTransport::bind(&config(Some(answering_addr.to_string())))
            .await
            .unwrap();

        let mut inbound = answering.subscribe().unwrap();
        assert!(matches!(
            answering.frame_sink().send_frame(&[0xD5; 160], 0),
            Err(TransportError::NotConnected)
        ));

        calling.frame_sink().send_frame(&[0x11; 160], 1000).unwrap();
        let packet = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.timestamp, 1000);
        assert_eq!(packet.payload_type, 8);
        assert!(packet.marker);
        assert_eq!(packet.payload, vec![0x11; 160]);

        let info = answering.accept_call().await.unwrap();
        assert_eq!(info.remote_addr, Some(calling.local_addr().unwrap().to_string()));

        let mut reply = calling.subscribe().unwrap();
        answering.frame_sink().send_frame(&[0x22; 160], 160).unwrap();
        let packet = tokio::time::timeout(Duration::from_secs(2), reply.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.payload, vec![0x22; 160]);
        assert_eq!(packet.ssrc, 42);
    }

    #[tokio::test]
    async fn test_frames_sent_right_after_bind() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = RtpUdpTransport::bind(&config(Some(peer.local_addr().unwrap().to_string())))
            .await
            .unwrap();

        let sink = transport.frame_sink();
        for i in 0..5u32 {
            sink.send_frame(&[0xD5; 160], i * 160).unwrap();
        }

        let mut buf = [0u8; MAX_DATAGRAM];
        for i in 0..5u32 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let packet = RtpPacket::parse(&buf[..len]).unwrap();
            assert_eq!(packet.timestamp, i * 160);
            assert_eq!(packet.marker, i == 0);
        }
    }

    #[tokio::test]
    async fn test_malformed_datagrams_are_skipped() {
        let transport = RtpUdpTransport::bind(&config(None)).await.unwrap();
        let addr = transport.local_addr().unwrap();
        let mut inbound = transport.subscribe().unwrap();
        assert!(matches!(
            transport.subscribe(),
            Err(TransportError::AlreadySubscribed)
        ));

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&[1, 2, 3], addr).await.unwrap();
        peer.send_to(&RtpPacket::new(8, 7, 320, 9, vec![0; 160]).to_bytes(), addr)
            .await
            .unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.sequence, 7);
    }

    #[tokio::test]
    async fn test_sends_fail_after_end_call() {
        let transport = RtpUdpTransport::bind(&config(Some("127.0.0.1:9".to_string())))
            .await
            .unwrap();
        transport.end_call("test").await.unwrap();
        assert!(matches!(
            transport.frame_sink().send_frame(&[0xD5; 160], 0),
            Err(TransportError::CallEnded)
        ));
    }
}
