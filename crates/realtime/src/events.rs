//! Abstract protocol events
//!
//! The orchestrator only deals in these enums; field names on the wire are
//! owned by a [`ProtocolDialect`](crate::dialect::ProtocolDialect).

use serde::{Deserialize, Serialize};

/// A function the agent may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments
    pub parameters: serde_json::Value,
}

/// Session configuration sent once after connecting
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub instructions: String,
    pub voice: String,
    pub sample_rate: u32,
    pub transcription_model: Option<String>,
    pub vad_threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub tools: Vec<ToolDeclaration>,
}

/// Author of an injected message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
}

/// Outbound events
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SessionUpdate(SessionSettings),
    /// PCM16 LE at the service rate
    AppendAudio(Vec<u8>),
    CreateResponse { instructions: Option<String> },
    CancelResponse,
    InjectMessage { role: MessageRole, text: String },
    FunctionResult { call_id: String, output: String },
}

/// How a response finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Completed,
    Cancelled,
    Incomplete,
    Failed,
}

impl ResponseStatus {
    pub fn from_wire(status: &str) -> Self {
        match status {
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            "incomplete" => Self::Incomplete,
            _ => Self::Failed,
        }
    }
}

/// Inbound events
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SessionCreated,
    /// Configuration acknowledged
    SessionUpdated,
    ResponseCreated { id: String },
    ResponseDone { id: String, status: ResponseStatus },
    /// PCM16 LE at the service rate; binary frames carry no response id
    AudioDelta { response_id: Option<String>, audio: Vec<u8> },
    AgentTranscriptDelta { response_id: String, text: String },
    AgentTranscriptDone { response_id: String, text: String },
    CallerTranscript { text: String },
    /// Caller speech was heard but could not be transcribed
    CallerTranscriptFailed,
    SpeechStarted,
    SpeechStopped,
    FunctionCall { call_id: String, name: String, arguments: String },
    Error { message: String },
    /// The connection ended
    Closed { reason: String },
    /// Recognised envelope with no meaning to the bridge
    Ignored,
}
