//! Transport Traits
//!
//! Abstract interfaces for telephony transport implementations. The core
//! engine only sees these traits; concrete adapters are chosen at startup.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use voice_bridge_core::G711Law;

use crate::rtp::RtpPacket;
use crate::TransportError;

/// Details of an answered call
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Transport-level call identifier
    pub call_id: String,
    /// Remote media address, if known
    pub remote_addr: Option<String>,
    /// Negotiated codec
    pub codec: G711Law,
}

/// Outbound frame primitive used by the pacing thread
///
/// Implementations must not block: the call happens inside the 20ms timing
/// loop, so a send either completes immediately or fails.
pub trait FrameSink: Send + Sync {
    /// Send one encoded frame stamped with `timestamp` (sample units)
    fn send_frame(&self, frame: &[u8], timestamp: u32) -> Result<(), TransportError>;
}

/// Telephony transport capabilities
#[async_trait]
pub trait TelephonyTransport: Send + Sync {
    /// Wait for and answer the next call
    async fn accept_call(&self) -> Result<CallInfo, TransportError>;

    /// Sink for outbound frames
    fn frame_sink(&self) -> Arc<dyn FrameSink>;

    /// Take the inbound packet stream; only one subscriber is allowed
    fn subscribe(&self) -> Result<mpsc::Receiver<RtpPacket>, TransportError>;

    /// Hang up
    async fn end_call(&self, reason: &str) -> Result<(), TransportError>;

    /// Codec used on the wire
    fn codec(&self) -> G711Law;
}
