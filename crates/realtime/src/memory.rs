//! In-process upstream for exercising the orchestrator without a network

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::UpstreamSink;
use crate::events::ClientEvent;
use crate::RealtimeError;

/// Records outbound events; appended audio is only counted
pub struct MemoryUpstream {
    sent: mpsc::UnboundedSender<ClientEvent>,
    audio_bytes: AtomicU64,
    closed: AtomicBool,
}

impl MemoryUpstream {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ClientEvent>) {
        let (sent, rx) = mpsc::unbounded_channel();
        let upstream = Arc::new(Self {
            sent,
            audio_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        (upstream, rx)
    }

    /// Total PCM bytes appended
    pub fn audio_bytes(&self) -> u64 {
        self.audio_bytes.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl UpstreamSink for MemoryUpstream {
    async fn send(&self, event: ClientEvent) -> Result<(), RealtimeError> {
        if self.is_closed() {
            return Err(RealtimeError::ConnectionClosed);
        }
        match event {
            ClientEvent::AppendAudio(pcm) => {
                self.audio_bytes
                    .fetch_add(pcm.len() as u64, Ordering::AcqRel);
            }
            other => {
                let _ = self.sent.send(other);
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
