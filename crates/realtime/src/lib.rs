//! Realtime speech service protocol
//!
//! Everything between the call and the upstream streaming connection:
//! - Abstract client/server event enums and the JSON dialect
//! - WebSocket connection with a single send gate
//! - Silence watchdog
//! - The per-call protocol orchestrator (turns, barge-in, termination)

pub mod connection;
pub mod dialect;
pub mod events;
pub mod memory;
pub mod orchestrator;
pub mod tools;
pub mod watchdog;

pub use connection::{RealtimeConnection, UpstreamSink};
pub use dialect::{dialect_for, OpenAiDialect, ProtocolDialect};
pub use events::{ClientEvent, MessageRole, ResponseStatus, ServerEvent, SessionSettings, ToolDeclaration};
pub use memory::MemoryUpstream;
pub use orchestrator::{
    AudioOutput, Command, EndReason, Orchestrator, OrchestratorEvent, OrchestratorHandle,
    OrchestratorState,
};
pub use tools::{NoTools, ToolHandler};
pub use watchdog::SilenceWatchdog;

use thiserror::Error;

/// Realtime protocol errors
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
