//! Wire dialects
//!
//! A dialect maps the abstract [`ClientEvent`]/[`ServerEvent`] enums onto the
//! JSON envelopes of a particular speech service.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use voice_bridge_config::Dialect;

use crate::events::{ClientEvent, MessageRole, ResponseStatus, ServerEvent};
use crate::RealtimeError;

/// Event encoding for one speech service
pub trait ProtocolDialect: Send + Sync {
    /// Serialize an outbound event to a text frame
    fn encode(&self, event: &ClientEvent) -> Result<String, RealtimeError>;

    /// Parse an inbound text frame
    fn decode(&self, text: &str) -> Result<ServerEvent, RealtimeError>;
}

/// Dialect selected in configuration
pub fn dialect_for(dialect: Dialect) -> Box<dyn ProtocolDialect> {
    match dialect {
        Dialect::OpenAi => Box::new(OpenAiDialect),
    }
}

/// OpenAI-compatible realtime events
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAiDialect;

#[derive(Deserialize)]
struct WireResponse {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "response.created")]
    ResponseCreated { response: WireResponse },
    #[serde(rename = "response.done")]
    ResponseDone { response: WireResponse },
    #[serde(rename = "response.audio.delta")]
    AudioDelta { response_id: String, delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { response_id: String, delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        response_id: String,
        transcript: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscription { transcript: String },
    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    InputTranscriptionFailed,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(rename = "error")]
    Error { error: WireError },
    #[serde(other)]
    Unknown,
}

impl ProtocolDialect for OpenAiDialect {
    fn encode(&self, event: &ClientEvent) -> Result<String, RealtimeError> {
        let value = match event {
            ClientEvent::SessionUpdate(settings) => {
                let tools: Vec<_> = settings
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        })
                    })
                    .collect();
                let transcription = settings
                    .transcription_model
                    .as_ref()
                    .map(|model| json!({ "model": model }));
                let tool_choice = if settings.tools.is_empty() { "none" } else { "auto" };
                json!({
                    "type": "session.update",
                    "session": {
                        "modalities": ["audio", "text"],
                        "instructions": settings.instructions,
                        "voice": settings.voice,
                        "input_audio_format": "pcm16",
                        "output_audio_format": "pcm16",
                        "input_audio_transcription": transcription,
                        "turn_detection": {
                            "type": "server_vad",
                            "threshold": settings.vad_threshold,
                            "prefix_padding_ms": settings.prefix_padding_ms,
                            "silence_duration_ms": settings.silence_duration_ms,
                            "create_response": false,
                        },
                        "tools": tools,
                        "tool_choice": tool_choice,
                    }
                })
            }
            ClientEvent::AppendAudio(pcm) => json!({
                "type": "input_audio_buffer.append",
                "audio": BASE64.encode(pcm),
            }),
            ClientEvent::CreateResponse { instructions } => match instructions {
                Some(instructions) => json!({
                    "type": "response.create",
                    "response": { "instructions": instructions },
                }),
                None => json!({ "type": "response.create" }),
            },
            ClientEvent::CancelResponse => json!({ "type": "response.cancel" }),
            ClientEvent::InjectMessage { role, text } => {
                let role = match role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                };
                json!({
                    "type": "conversation.item.create",
                    "item": {
                        "type": "message",
                        "role": role,
                        "content": [{ "type": "input_text", "text": text }],
                    }
                })
            }
            ClientEvent::FunctionResult { call_id, output } => json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": output,
                }
            }),
        };
        Ok(serde_json::to_string(&value)?)
    }

    fn decode(&self, text: &str) -> Result<ServerEvent, RealtimeError> {
        let wire: WireServerEvent = serde_json::from_str(text)?;
        let event = match wire {
            WireServerEvent::SessionCreated => ServerEvent::SessionCreated,
            WireServerEvent::SessionUpdated => ServerEvent::SessionUpdated,
            WireServerEvent::ResponseCreated { response } => {
                ServerEvent::ResponseCreated { id: response.id }
            }
            WireServerEvent::ResponseDone { response } => ServerEvent::ResponseDone {
                status: ResponseStatus::from_wire(response.status.as_deref().unwrap_or("completed")),
                id: response.id,
            },
            WireServerEvent::AudioDelta { response_id, delta } => {
                let audio = BASE64
                    .decode(delta.as_bytes())
                    .map_err(|e| RealtimeError::Protocol(format!("bad audio delta: {}", e)))?;
                ServerEvent::AudioDelta {
                    response_id: Some(response_id),
                    audio,
                }
            }
            WireServerEvent::TranscriptDelta { response_id, delta } => {
                ServerEvent::AgentTranscriptDelta {
                    response_id,
                    text: delta,
                }
            }
            WireServerEvent::TranscriptDone {
                response_id,
                transcript,
            } => ServerEvent::AgentTranscriptDone {
                response_id,
                text: transcript,
            },
            WireServerEvent::InputTranscription { transcript } => {
                ServerEvent::CallerTranscript { text: transcript }
            }
            WireServerEvent::InputTranscriptionFailed => ServerEvent::CallerTranscriptFailed,
            WireServerEvent::SpeechStarted => ServerEvent::SpeechStarted,
            WireServerEvent::SpeechStopped => ServerEvent::SpeechStopped,
            WireServerEvent::FunctionCall {
                call_id,
                name,
                arguments,
            } => ServerEvent::FunctionCall {
                call_id,
                name,
                arguments,
            },
            WireServerEvent::Error { error } => ServerEvent::Error {
                message: match error.code {
                    Some(code) => format!("{}: {}", code, error.message),
                    None => error.message,
                },
            },
            WireServerEvent::Unknown => ServerEvent::Ignored,
        };
        Ok(event)
    }
}
