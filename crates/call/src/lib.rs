//! Call session
//!
//! Composes the telephony transport, the ingress pipeline, the playout engine
//! and the realtime orchestrator into one bridged call.

pub mod egress;
pub mod events;
pub mod session;

pub use egress::EgressBridge;
pub use events::{CallEvent, CallEventKind};
pub use session::{CallSession, CallStats};
pub use voice_bridge_realtime::{EndReason, OrchestratorState};

use thiserror::Error;

/// Call errors
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Transport error: {0}")]
    Transport(#[from] voice_bridge_transport::TransportError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] voice_bridge_realtime::RealtimeError),

    #[error("Configuration error: {0}")]
    Config(#[from] voice_bridge_config::ConfigError),

    #[error("Call ended before it was established: {0}")]
    EndedEarly(EndReason),

    #[error("Call has ended")]
    Ended,
}
