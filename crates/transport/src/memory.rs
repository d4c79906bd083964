//! In-process telephony transport
//!
//! Packets are injected by the owner and outbound frames are recorded, which
//! makes whole-call behaviour observable without sockets.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use voice_bridge_core::G711Law;

use crate::codec::G711Codec;
use crate::rtp::RtpPacket;
use crate::traits::{CallInfo, FrameSink, TelephonyTransport};
use crate::TransportError;

/// A frame handed to the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

/// Sink that records frames and can be switched into a failing mode
#[derive(Debug, Default)]
pub struct MemorySink {
    frames: Mutex<Vec<SentFrame>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn frames(&self) -> Vec<SentFrame> {
        self.frames.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.frames.lock().len()
    }

    /// Make every subsequent send fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
}

impl FrameSink for MemorySink {
    fn send_frame(&self, frame: &[u8], timestamp: u32) -> Result<(), TransportError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(TransportError::SendFailed("memory sink failing".to_string()));
        }
        self.frames.lock().push(SentFrame {
            timestamp,
            payload: frame.to_vec(),
        });
        Ok(())
    }
}

/// Telephony transport backed by channels
pub struct MemoryTransport {
    law: G711Law,
    codec: G711Codec,
    inbound_tx: mpsc::Sender<RtpPacket>,
    inbound_rx: Mutex<Option<mpsc::Receiver<RtpPacket>>>,
    sink: Arc<MemorySink>,
    sequence: AtomicU16,
    ended: Mutex<Option<String>>,
}

impl MemoryTransport {
    pub fn new(law: G711Law) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        Self {
            law,
            codec: G711Codec::new(law),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            sink: Arc::new(MemorySink::default()),
            sequence: AtomicU16::new(0),
            ended: Mutex::new(None),
        }
    }

    /// Deliver a packet as if it arrived from the network
    pub async fn inject(&self, packet: RtpPacket) -> Result<(), TransportError> {
        self.inbound_tx
            .send(packet)
            .await
            .map_err(|_| TransportError::CallEnded)
    }

    /// Encode 20ms of caller audio and deliver it stamped with `timestamp`
    pub async fn inject_pcm(&self, timestamp: u32, samples: &[i16]) -> Result<(), TransportError> {
        let payload = self.codec.encode(samples);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.inject(RtpPacket::new(
            self.law.payload_type(),
            sequence,
            timestamp,
            1,
            payload,
        ))
        .await
    }

    pub fn sink(&self) -> Arc<MemorySink> {
        self.sink.clone()
    }

    /// Reason passed to `end_call`, if it was called
    pub fn end_reason(&self) -> Option<String> {
        self.ended.lock().clone()
    }
}

#[async_trait]
impl TelephonyTransport for MemoryTransport {
    async fn accept_call(&self) -> Result<CallInfo, TransportError> {
        Ok(CallInfo {
            call_id: "memory".to_string(),
            remote_addr: None,
            codec: self.law,
        })
    }

    fn frame_sink(&self) -> Arc<dyn FrameSink> {
        self.sink.clone()
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<RtpPacket>, TransportError> {
        self.inbound_rx
            .lock()
            .take()
            .ok_or(TransportError::AlreadySubscribed)
    }

    async fn end_call(&self, reason: &str) -> Result<(), TransportError> {
        let mut ended = self.ended.lock();
        if ended.is_none() {
            *ended = Some(reason.to_string());
        }
        Ok(())
    }

    fn codec(&self) -> G711Law {
        self.law
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_pcm_is_encoded() {
        let transport = MemoryTransport::new(G711Law::MuLaw);
        let mut inbound = transport.subscribe().unwrap();
        transport.inject_pcm(160, &[0; 160]).await.unwrap();

        let packet = inbound.recv().await.unwrap();
        assert_eq!(packet.payload_type, 0);
        assert_eq!(packet.timestamp, 160);
        assert_eq!(packet.payload, vec![0xFF; 160]);
    }

    #[tokio::test]
    async fn test_end_call_keeps_first_reason() {
        let transport = MemoryTransport::new(G711Law::ALaw);
        transport.end_call("completed").await.unwrap();
        transport.end_call("no-reply").await.unwrap();
        assert_eq!(transport.end_reason().as_deref(), Some("completed"));
    }
}
