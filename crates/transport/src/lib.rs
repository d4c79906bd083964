//! Voice Bridge Transport Layer
//!
//! Telephony media path for the bridge:
//! - G.711 codec with precomputed tables
//! - Frame resampling (FFT/sinc with linear fallback)
//! - Ingress: jitter buffer, loss concealment and DSP conditioning
//! - Egress: drift-free 20ms playout with barge-in clear
//! - Transport traits and the RTP/UDP adapter

pub mod codec;
pub mod ingress;
pub mod memory;
pub mod playout;
pub mod resample;
pub mod rtp;
pub mod rtp_udp;
pub mod traits;

pub use codec::G711Codec;
pub use ingress::{IngressFrame, IngressPipeline, IngressStats, IngressStatsHandle};
pub use memory::{MemorySink, MemoryTransport, SentFrame};
pub use playout::{PlayoutEngine, PlayoutEvent, PlayoutState, PlayoutStats};
pub use resample::Resampler;
pub use rtp::RtpPacket;
pub use rtp_udp::{RtpFrameSink, RtpUdpTransport};
pub use traits::{CallInfo, FrameSink, TelephonyTransport};

use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Resampler error: {0}")]
    Resampler(String),

    #[error("Remote address unknown")]
    NotConnected,

    #[error("Inbound audio already subscribed")]
    AlreadySubscribed,

    #[error("Call ended")]
    CallEnded,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] voice_bridge_core::Error),
}
