//! Realtime speech service and conversation configuration

use serde::{Deserialize, Serialize};

/// Wire dialect spoken by the speech service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// OpenAI-compatible realtime events
    #[default]
    OpenAi,
}

/// Upstream streaming connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// WebSocket endpoint
    #[serde(default = "default_url")]
    pub url: String,

    /// Model name appended as a query parameter
    #[serde(default = "default_model")]
    pub model: String,

    /// Bearer token (set via VOICE_BRIDGE__REALTIME__API_KEY)
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub dialect: Dialect,

    /// Agent voice
    #[serde(default = "default_voice")]
    pub voice: String,

    /// System instructions for the session
    #[serde(default = "default_instructions")]
    pub instructions: String,

    /// Instructions for the opening turn
    #[serde(default = "default_greeting_instructions")]
    pub greeting_instructions: String,

    /// PCM16 rate spoken by the service (16000 or 24000)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Connect + configuration acknowledgement budget
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Caller transcription model; transcription disabled when unset
    #[serde(default = "default_transcription_model")]
    pub transcription_model: Option<String>,

    /// Server VAD activation threshold
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,

    #[serde(default = "default_prefix_padding_ms")]
    pub prefix_padding_ms: u32,

    /// Silence that ends a caller utterance on the service side
    #[serde(default = "default_silence_duration_ms")]
    pub silence_duration_ms: u32,
}

fn default_url() -> String {
    "wss://api.openai.com/v1/realtime".to_string()
}
fn default_model() -> String {
    "gpt-4o-realtime-preview".to_string()
}
fn default_voice() -> String {
    "alloy".to_string()
}
fn default_instructions() -> String {
    "You are a friendly telephone assistant. Keep answers short and natural for voice. \
     When the caller is done, say goodbye and call the end_call function."
        .to_string()
}
fn default_greeting_instructions() -> String {
    "Greet the caller briefly and ask how you can help.".to_string()
}
fn default_sample_rate() -> u32 {
    24000
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_transcription_model() -> Option<String> {
    Some("whisper-1".to_string())
}
fn default_vad_threshold() -> f32 {
    0.5
}
fn default_prefix_padding_ms() -> u32 {
    300
}
fn default_silence_duration_ms() -> u32 {
    500
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            model: default_model(),
            api_key: None,
            dialect: Dialect::default(),
            voice: default_voice(),
            instructions: default_instructions(),
            greeting_instructions: default_greeting_instructions(),
            sample_rate: default_sample_rate(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            transcription_model: default_transcription_model(),
            vad_threshold: default_vad_threshold(),
            prefix_padding_ms: default_prefix_padding_ms(),
            silence_duration_ms: default_silence_duration_ms(),
        }
    }
}

/// Turn-taking and call lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Quiet time after caller speech before a turn may be requested
    #[serde(default = "default_quiet_interval_ms")]
    pub quiet_interval_ms: u64,

    /// Watchdog timeout after agent playout finishes
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,

    /// Watchdog timeout while awaiting a yes/no answer
    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,

    /// Re-prompts before the call ends with "no-reply"
    #[serde(default = "default_max_silent_reprompts")]
    pub max_silent_reprompts: u32,

    /// System message injected on caller silence
    #[serde(default = "default_reprompt_message")]
    pub reprompt_message: String,

    /// Grace period after a goodbye before the call is force-ended
    #[serde(default = "default_closing_grace_ms")]
    pub closing_grace_ms: u64,

    /// Agent phrases that mark the closing script
    #[serde(default = "default_closing_phrases")]
    pub closing_phrases: Vec<String>,

    /// Agent phrases that mean a yes/no answer is expected
    #[serde(default = "default_confirmation_phrases")]
    pub confirmation_phrases: Vec<String>,

    /// Function name that ends the call
    #[serde(default = "default_end_call_tool")]
    pub end_call_tool: String,

    /// Budget for a business tool call
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,

    /// Longest wait for an in-flight turn before a tool follow-up is forced
    #[serde(default = "default_tool_followup_max_wait_ms")]
    pub tool_followup_max_wait_ms: u64,

    /// A requested response that is neither created nor rejected within this
    /// window is given up on
    #[serde(default = "default_response_start_timeout_ms")]
    pub response_start_timeout_ms: u64,
}

fn default_quiet_interval_ms() -> u64 {
    300
}
fn default_silence_timeout_ms() -> u64 {
    8_000
}
fn default_confirmation_timeout_ms() -> u64 {
    15_000
}
fn default_max_silent_reprompts() -> u32 {
    2
}
fn default_reprompt_message() -> String {
    "The caller has gone quiet. Gently check whether they are still there.".to_string()
}
fn default_closing_grace_ms() -> u64 {
    10_000
}
fn default_closing_phrases() -> Vec<String> {
    ["goodbye", "bye bye", "have a nice day", "have a great day", "take care"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_confirmation_phrases() -> Vec<String> {
    [
        "is that correct",
        "is that right",
        "can you confirm",
        "shall i",
        "would you like me to",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_end_call_tool() -> String {
    "end_call".to_string()
}
fn default_tool_timeout_ms() -> u64 {
    10_000
}
fn default_tool_followup_max_wait_ms() -> u64 {
    5_000
}
fn default_response_start_timeout_ms() -> u64 {
    5_000
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            quiet_interval_ms: default_quiet_interval_ms(),
            silence_timeout_ms: default_silence_timeout_ms(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
            max_silent_reprompts: default_max_silent_reprompts(),
            reprompt_message: default_reprompt_message(),
            closing_grace_ms: default_closing_grace_ms(),
            closing_phrases: default_closing_phrases(),
            confirmation_phrases: default_confirmation_phrases(),
            end_call_tool: default_end_call_tool(),
            tool_timeout_ms: default_tool_timeout_ms(),
            tool_followup_max_wait_ms: default_tool_followup_max_wait_ms(),
            response_start_timeout_ms: default_response_start_timeout_ms(),
        }
    }
}
