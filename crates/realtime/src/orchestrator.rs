//! Protocol Orchestrator
//!
//! Owns the conversation with the speech service for one call:
//! - configuration handshake and the one-time greeting
//! - turn requests gated on caller speech and a short quiet interval
//! - barge-in (cancel the active response and clear playout)
//! - closing detection, the end-of-call function and the grace period
//! - silence watchdog with a bounded number of re-prompts
//!
//! All state lives on a single task. Network events, playout commands, timer
//! expirations and tool results are all serialized through one select loop.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use voice_bridge_config::{ConversationConfig, RealtimeConfig};

use crate::connection::UpstreamSink;
use crate::events::{ClientEvent, MessageRole, ResponseStatus, ServerEvent, SessionSettings};
use crate::tools::{end_call_declaration, ToolHandler};
use crate::watchdog::SilenceWatchdog;

/// Cancelled response ids remembered for dropping late audio
const CANCELLED_HISTORY: usize = 16;

/// Where agent audio goes
///
/// Implemented by the egress side of the call. Every method must return
/// promptly; the orchestrator calls them from its event loop.
pub trait AudioOutput: Send + Sync {
    /// Queue agent audio (PCM16 LE at the service rate)
    fn push_audio(&self, pcm: &[u8]);

    /// Drop everything not yet played
    fn clear(&self);

    /// The current utterance is complete; play out any partial tail
    fn flush(&self);

    /// Nothing queued or in flight
    fn is_idle(&self) -> bool;
}

/// Conversation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
    Connecting,
    /// Session settings sent, awaiting acknowledgement
    Configuring,
    Greeting,
    Conversing,
    /// Goodbye heard or end of call requested
    Closing,
    Ended,
}

impl OrchestratorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Configuring => "configuring",
            Self::Greeting => "greeting",
            Self::Conversing => "conversing",
            Self::Closing => "closing",
            Self::Ended => "ended",
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "kebab-case")]
pub enum EndReason {
    /// The agent invoked the end-of-call function
    Completed,
    /// The caller stayed silent through every re-prompt
    NoReply,
    /// A goodbye was spoken but the end-of-call function never came
    ClosingTimeout,
    /// Local hangup
    Hangup,
    /// The session configuration was never acknowledged
    HandshakeFailed(String),
    ConnectionClosed(String),
    TransportFault(String),
}

impl EndReason {
    /// Short machine-readable label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::NoReply => "no-reply",
            Self::ClosingTimeout => "closing-timeout",
            Self::Hangup => "hangup",
            Self::HandshakeFailed(_) => "handshake-failed",
            Self::ConnectionClosed(_) => "connection-closed",
            Self::TransportFault(_) => "transport-fault",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeFailed(detail)
            | Self::ConnectionClosed(detail)
            | Self::TransportFault(detail) => write!(f, "{}: {}", self.as_str(), detail),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// Observable conversation events
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    StateChanged(OrchestratorState),
    AgentTranscript { response_id: String, text: String },
    CallerTranscript { text: String },
    BargeIn { response_id: String },
    ToolCalled { name: String, success: bool },
    Ended(EndReason),
}

/// Inputs from the rest of the call
#[derive(Debug, Clone)]
pub enum Command {
    PlayoutStarted,
    /// Everything the agent said has been played
    PlayoutDrained,
    PlayoutFault(String),
    /// Add a message to the conversation and have the agent respond
    Inject { role: MessageRole, text: String },
    Hangup,
}

/// Cloneable control surface for a running orchestrator
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<OrchestratorEvent>,
    state: watch::Receiver<OrchestratorState>,
    ignore_caller_audio: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
}

impl OrchestratorHandle {
    /// Queue a command; false once the orchestrator has stopped
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state
    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    /// Whether caller audio should still be forwarded upstream
    pub fn accepts_caller_audio(&self) -> bool {
        !self.ignore_caller_audio.load(Ordering::Acquire) && !self.is_ended()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

/// Result of a business tool call, delivered back to the event loop
#[derive(Debug)]
struct ToolOutcome {
    call_id: String,
    name: String,
    result: Result<serde_json::Value, String>,
}

/// Response bookkeeping
#[derive(Debug, Default)]
struct TurnTracker {
    /// A response was requested and its id is not known yet
    requested: bool,
    active: Option<String>,
    /// Cancel the next response as soon as it is created
    cancel_next: bool,
    cancelled: VecDeque<String>,
}

impl TurnTracker {
    fn busy(&self) -> bool {
        self.requested || self.active.is_some()
    }

    fn is_cancelled(&self, id: &str) -> bool {
        self.cancelled.iter().any(|c| c == id)
    }

    fn mark_cancelled(&mut self, id: String) {
        if self.cancelled.len() == CANCELLED_HISTORY {
            self.cancelled.pop_front();
        }
        self.cancelled.push_back(id);
    }
}

#[derive(Debug, Default)]
struct CallerState {
    speaking: bool,
    /// Speech ended and its transcript has not arrived yet
    transcript_pending: bool,
    last_spoke: Option<Instant>,
}

/// A turn waiting for the active response to finish
#[derive(Debug)]
struct PendingTurn {
    bypass_gate: bool,
    /// Force the turn anyway once this passes
    wait_deadline: Option<Instant>,
}

/// Receivers consumed by the event loop
struct Inbox {
    commands: mpsc::UnboundedReceiver<Command>,
    watchdog: mpsc::UnboundedReceiver<u64>,
    tools: mpsc::UnboundedReceiver<ToolOutcome>,
}

/// Per-call protocol state machine
pub struct Orchestrator {
    conversation: Conversation,
    inbox: Inbox,
}

struct Conversation {
    realtime: RealtimeConfig,
    config: ConversationConfig,
    upstream: Arc<dyn UpstreamSink>,
    output: Arc<dyn AudioOutput>,
    tools: Arc<dyn ToolHandler>,
    events: broadcast::Sender<OrchestratorEvent>,
    state_tx: watch::Sender<OrchestratorState>,
    tool_results: mpsc::UnboundedSender<ToolOutcome>,
    ignore_caller_audio: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
    watchdog: SilenceWatchdog,
    closing_pattern: Option<Regex>,
    confirmation_pattern: Option<Regex>,

    state: OrchestratorState,
    turn: TurnTracker,
    caller: CallerState,
    pending_turn: Option<PendingTurn>,
    deferred_turn_at: Option<Instant>,
    /// Give up on a requested response that never starts
    request_deadline: Option<Instant>,
    grace_deadline: Option<Instant>,
    handshake_deadline: Option<Instant>,
    greeting_sent: bool,
    end_requested: bool,
    closing_spoken: bool,
    awaiting_confirmation: bool,
    silent_reprompts: u32,
    end_reason: Option<EndReason>,
}

impl Orchestrator {
    pub fn new(
        realtime: RealtimeConfig,
        config: ConversationConfig,
        upstream: Arc<dyn UpstreamSink>,
        output: Arc<dyn AudioOutput>,
        tools: Arc<dyn ToolHandler>,
    ) -> (Self, OrchestratorHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (watchdog, watchdog_rx) = SilenceWatchdog::new();
        let ignore_caller_audio = Arc::new(AtomicBool::new(false));
        let ended = Arc::new(AtomicBool::new(false));
        let (state_tx, state_rx) = watch::channel(OrchestratorState::Connecting);

        let handle = OrchestratorHandle {
            commands: command_tx,
            events: events.clone(),
            state: state_rx,
            ignore_caller_audio: ignore_caller_audio.clone(),
            ended: ended.clone(),
        };

        let conversation = Conversation {
            closing_pattern: phrase_pattern(&config.closing_phrases),
            confirmation_pattern: phrase_pattern(&config.confirmation_phrases),
            realtime,
            config,
            upstream,
            output,
            tools,
            events,
            state_tx,
            tool_results: tool_tx,
            ignore_caller_audio,
            ended,
            watchdog,
            state: OrchestratorState::Connecting,
            turn: TurnTracker::default(),
            caller: CallerState::default(),
            pending_turn: None,
            deferred_turn_at: None,
            request_deadline: None,
            grace_deadline: None,
            handshake_deadline: None,
            greeting_sent: false,
            end_requested: false,
            closing_spoken: false,
            awaiting_confirmation: false,
            silent_reprompts: 0,
            end_reason: None,
        };

        let orchestrator = Self {
            conversation,
            inbox: Inbox {
                commands: command_rx,
                watchdog: watchdog_rx,
                tools: tool_rx,
            },
        };
        (orchestrator, handle)
    }

    /// Drive the conversation until the call ends
    pub async fn run(self, mut server_events: mpsc::Receiver<ServerEvent>) -> EndReason {
        let Orchestrator {
            mut conversation,
            inbox,
        } = self;
        let Inbox {
            mut commands,
            watchdog: mut watchdog_fired,
            tools: mut tool_results,
        } = inbox;

        conversation.begin().await;

        while !conversation.is_ended() {
            let deferred_at = conversation.deferred_turn_at;
            let request_at = conversation.request_deadline;
            let grace_at = conversation.grace_deadline;
            let handshake_at = conversation.handshake_deadline;
            let followup_at = conversation
                .pending_turn
                .as_ref()
                .and_then(|p| p.wait_deadline);

            tokio::select! {
                event = server_events.recv() => match event {
                    Some(event) => conversation.handle_server_event(event).await,
                    None => conversation.end(EndReason::ConnectionClosed(
                        "event stream ended".to_string(),
                    )),
                },
                Some(command) = commands.recv() => conversation.handle_command(command).await,
                Some(epoch) = watchdog_fired.recv() => conversation.on_watchdog(epoch).await,
                Some(outcome) = tool_results.recv() => conversation.on_tool_result(outcome).await,
                _ = sleep_opt(deferred_at) => {
                    conversation.deferred_turn_at = None;
                    conversation.request_turn(false).await;
                }
                _ = sleep_opt(followup_at) => conversation.on_followup_wait_expired().await,
                _ = sleep_opt(request_at) => {
                    conversation.request_deadline = None;
                    conversation.release_unanswered_request("no response created").await;
                }
                _ = sleep_opt(grace_at) => conversation.on_grace_expired(),
                _ = sleep_opt(handshake_at) => conversation.on_handshake_expired(),
            }
        }

        conversation
            .end_reason
            .take()
            .unwrap_or(EndReason::Hangup)
    }
}

impl Conversation {
    fn is_ended(&self) -> bool {
        self.state == OrchestratorState::Ended
    }

    fn is_closing(&self) -> bool {
        self.state == OrchestratorState::Closing
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: OrchestratorState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "Conversation state changed");
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(OrchestratorEvent::StateChanged(state));
    }

    async fn send(&self, event: ClientEvent) -> bool {
        match self.upstream.send(event).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send upstream event");
                false
            }
        }
    }

    /// Send the session configuration
    async fn begin(&mut self) {
        self.set_state(OrchestratorState::Configuring);

        let mut tools = vec![end_call_declaration(&self.config.end_call_tool)];
        tools.extend(self.tools.declarations());
        let settings = SessionSettings {
            instructions: self.realtime.instructions.clone(),
            voice: self.realtime.voice.clone(),
            sample_rate: self.realtime.sample_rate,
            transcription_model: self.realtime.transcription_model.clone(),
            vad_threshold: self.realtime.vad_threshold,
            prefix_padding_ms: self.realtime.prefix_padding_ms,
            silence_duration_ms: self.realtime.silence_duration_ms,
            tools,
        };

        if !self.send(ClientEvent::SessionUpdate(settings)).await {
            self.end(EndReason::HandshakeFailed(
                "session settings could not be sent".to_string(),
            ));
            return;
        }
        self.handshake_deadline =
            Some(Instant::now() + Duration::from_millis(self.realtime.handshake_timeout_ms));
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionCreated => tracing::debug!("Realtime session created"),
            ServerEvent::SessionUpdated => self.on_configured().await,
            ServerEvent::ResponseCreated { id } => self.on_response_created(id).await,
            ServerEvent::ResponseDone { id, status } => self.on_response_done(id, status).await,
            ServerEvent::AudioDelta { response_id, audio } => {
                self.on_audio_delta(response_id, &audio)
            }
            ServerEvent::AgentTranscriptDelta { .. } => {}
            ServerEvent::AgentTranscriptDone { response_id, text } => {
                self.on_agent_transcript(response_id, text)
            }
            ServerEvent::CallerTranscript { text } => self.on_caller_transcript(text).await,
            ServerEvent::CallerTranscriptFailed => {
                tracing::debug!("Caller transcription failed");
                self.caller.transcript_pending = false;
                self.request_turn(false).await;
            }
            ServerEvent::SpeechStarted => self.on_speech_started().await,
            ServerEvent::SpeechStopped => self.on_speech_stopped().await,
            ServerEvent::FunctionCall {
                call_id,
                name,
                arguments,
            } => self.on_function_call(call_id, name, arguments).await,
            ServerEvent::Error { message } => {
                tracing::warn!(error = %message, "Speech service reported an error");
                metrics::counter!("voice_bridge_realtime_errors_total").increment(1);
                self.release_unanswered_request(&message).await;
            }
            ServerEvent::Closed { reason } => self.end(EndReason::ConnectionClosed(reason)),
            ServerEvent::Ignored => {}
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::PlayoutStarted => self.watchdog.disarm(),
            Command::PlayoutDrained => {
                self.finish_if_complete();
                if !self.turn.busy() {
                    self.arm_watchdog();
                }
            }
            Command::PlayoutFault(message) => self.end(EndReason::TransportFault(message)),
            Command::Inject { role, text } => {
                if self.is_ended() {
                    return;
                }
                if self.send(ClientEvent::InjectMessage { role, text }).await {
                    self.request_turn(true).await;
                }
            }
            Command::Hangup => self.end(EndReason::Hangup),
        }
    }

    async fn on_configured(&mut self) {
        self.handshake_deadline = None;
        if self.greeting_sent {
            tracing::debug!("Repeated session acknowledgement ignored");
            return;
        }
        self.greeting_sent = true;
        tracing::info!("Session configured, greeting caller");
        self.set_state(OrchestratorState::Greeting);

        let instructions = Some(self.realtime.greeting_instructions.clone())
            .filter(|text| !text.trim().is_empty());
        self.mark_requested();
        self.send(ClientEvent::CreateResponse { instructions }).await;
    }

    /// Ask the agent to speak, unless a gate holds the request back
    async fn request_turn(&mut self, bypass_gate: bool) {
        if self.is_ended() || self.is_closing() {
            tracing::debug!(state = %self.state, "Turn request dropped");
            return;
        }

        if self.turn.busy() {
            let bypass_gate = bypass_gate
                || self
                    .pending_turn
                    .as_ref()
                    .map(|p| p.bypass_gate)
                    .unwrap_or(false);
            let wait_deadline = self.pending_turn.as_ref().and_then(|p| p.wait_deadline);
            self.pending_turn = Some(PendingTurn {
                bypass_gate,
                wait_deadline,
            });
            return;
        }

        if !bypass_gate {
            if self.caller.speaking || self.caller.transcript_pending {
                tracing::debug!("Turn held back while caller speech is pending");
                return;
            }
            if let Some(last) = self.caller.last_spoke {
                let ready_at = last + Duration::from_millis(self.config.quiet_interval_ms);
                if Instant::now() < ready_at {
                    self.deferred_turn_at = Some(ready_at);
                    return;
                }
            }
        }

        self.deferred_turn_at = None;
        self.watchdog.disarm();
        self.mark_requested();
        metrics::counter!("voice_bridge_turns_requested_total").increment(1);
        self.send(ClientEvent::CreateResponse { instructions: None })
            .await;
    }

    fn mark_requested(&mut self) {
        self.turn.requested = true;
        self.request_deadline = Some(
            Instant::now() + Duration::from_millis(self.config.response_start_timeout_ms),
        );
    }

    /// A requested response was rejected or never started; free the turn
    async fn release_unanswered_request(&mut self, cause: &str) {
        if self.is_ended() || !self.turn.requested || self.turn.active.is_some() {
            return;
        }
        tracing::warn!(cause = %cause, "Requested response never started, releasing turn");
        self.turn.requested = false;
        self.turn.cancel_next = false;
        self.request_deadline = None;
        if self.state == OrchestratorState::Greeting {
            self.set_state(OrchestratorState::Conversing);
        }

        if let Some(pending) = self.pending_turn.take() {
            self.request_turn(pending.bypass_gate).await;
        }
        self.finish_if_complete();
        if !self.turn.busy() && self.output.is_idle() {
            self.arm_watchdog();
        }
    }

    async fn on_response_created(&mut self, id: String) {
        self.turn.requested = false;
        self.request_deadline = None;
        if let Some(previous) = self.turn.active.as_ref().filter(|active| **active != id) {
            tracing::debug!(previous = %previous, response_id = %id, "Response superseded");
        }
        self.turn.active = Some(id.clone());
        self.watchdog.disarm();

        if self.turn.cancel_next {
            self.turn.cancel_next = false;
            self.barge_in(id).await;
        }
    }

    async fn on_response_done(&mut self, id: String, status: ResponseStatus) {
        if self.turn.active.as_deref() != Some(id.as_str()) {
            tracing::debug!(response_id = %id, "Completion for inactive response ignored");
            return;
        }
        tracing::debug!(response_id = %id, ?status, "Response finished");
        self.turn.active = None;

        if !self.turn.is_cancelled(&id) {
            self.output.flush();
        }
        if self.state == OrchestratorState::Greeting {
            self.set_state(OrchestratorState::Conversing);
        }

        if let Some(pending) = self.pending_turn.take() {
            self.request_turn(pending.bypass_gate).await;
        }

        self.finish_if_complete();
        if !self.turn.busy() && self.output.is_idle() {
            self.arm_watchdog();
        }
    }

    fn on_audio_delta(&mut self, response_id: Option<String>, audio: &[u8]) {
        if self.is_ended() {
            return;
        }
        let dropped = match response_id.as_deref().or(self.turn.active.as_deref()) {
            Some(id) => self.turn.is_cancelled(id),
            None => self.turn.cancel_next,
        };
        if dropped {
            metrics::counter!("voice_bridge_cancelled_audio_bytes_total")
                .increment(audio.len() as u64);
            return;
        }
        self.watchdog.disarm();
        self.output.push_audio(audio);
    }

    fn on_agent_transcript(&mut self, response_id: String, text: String) {
        if self.turn.is_cancelled(&response_id) {
            return;
        }
        tracing::debug!(response_id = %response_id, text = %text, "Agent said");

        let closing = self
            .closing_pattern
            .as_ref()
            .map(|re| re.is_match(&text))
            .unwrap_or(false);
        let confirmation = self
            .confirmation_pattern
            .as_ref()
            .map(|re| re.is_match(&text))
            .unwrap_or(false);

        self.emit(OrchestratorEvent::AgentTranscript { response_id, text });

        if closing && !self.closing_spoken {
            tracing::info!("Closing phrase detected, ignoring further caller audio");
            self.closing_spoken = true;
            self.enter_closing();
        } else if confirmation {
            self.awaiting_confirmation = true;
        }
    }

    async fn on_caller_transcript(&mut self, text: String) {
        self.caller.transcript_pending = false;
        self.awaiting_confirmation = false;
        if self.ignore_caller_audio.load(Ordering::Acquire) {
            return;
        }

        if text.trim().is_empty() {
            if !self.turn.busy() && self.output.is_idle() {
                self.arm_watchdog();
            }
            return;
        }

        tracing::debug!(text = %text, "Caller said");
        self.emit(OrchestratorEvent::CallerTranscript { text });
        self.silent_reprompts = 0;
        self.request_turn(false).await;
    }

    async fn on_speech_started(&mut self) {
        if self.ignore_caller_audio.load(Ordering::Acquire) || self.is_ended() {
            return;
        }
        self.caller.speaking = true;
        self.caller.last_spoke = Some(Instant::now());
        self.silent_reprompts = 0;
        self.deferred_turn_at = None;
        self.watchdog.disarm();

        match self.turn.active.clone() {
            Some(id) if !self.turn.is_cancelled(&id) => self.barge_in(id).await,
            Some(_) => {}
            None if self.turn.requested => self.turn.cancel_next = true,
            None => {
                if !self.output.is_idle() {
                    self.output.clear();
                }
            }
        }
    }

    async fn on_speech_stopped(&mut self) {
        if self.ignore_caller_audio.load(Ordering::Acquire) || self.is_ended() {
            return;
        }
        self.caller.speaking = false;
        self.caller.last_spoke = Some(Instant::now());

        if self.realtime.transcription_model.is_some() {
            self.caller.transcript_pending = true;
        } else {
            self.request_turn(false).await;
        }
    }

    /// Cancel an agent response the caller talked over
    async fn barge_in(&mut self, response_id: String) {
        tracing::info!(response_id = %response_id, "Barge-in, cancelling response");
        metrics::counter!("voice_bridge_barge_ins_total").increment(1);
        self.turn.mark_cancelled(response_id.clone());
        self.output.clear();
        self.send(ClientEvent::CancelResponse).await;
        self.emit(OrchestratorEvent::BargeIn { response_id });
    }

    async fn on_function_call(&mut self, call_id: String, name: String, arguments: String) {
        if self.is_ended() {
            return;
        }

        if name == self.config.end_call_tool {
            tracing::info!(arguments = %arguments, "Agent requested end of call");
            let output = serde_json::json!({ "ok": true }).to_string();
            self.send(ClientEvent::FunctionResult { call_id, output }).await;
            self.emit(OrchestratorEvent::ToolCalled {
                name,
                success: true,
            });
            self.end_requested = true;
            self.enter_closing();
            self.finish_if_complete();
            return;
        }

        let arguments = match serde_json::from_str(&arguments) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "Tool arguments are not valid JSON");
                let _ = self.tool_results.send(ToolOutcome {
                    call_id,
                    name,
                    result: Err(format!("invalid arguments: {}", e)),
                });
                return;
            }
        };

        tracing::debug!(tool = %name, "Dispatching tool call");
        let tools = self.tools.clone();
        let results = self.tool_results.clone();
        let budget = Duration::from_millis(self.config.tool_timeout_ms);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(budget, tools.call(&name, arguments)).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {}ms", budget.as_millis())),
            };
            let _ = results.send(ToolOutcome {
                call_id,
                name,
                result,
            });
        });
    }

    async fn on_tool_result(&mut self, outcome: ToolOutcome) {
        let ToolOutcome {
            call_id,
            name,
            result,
        } = outcome;
        let success = result.is_ok();
        let output = match result {
            Ok(value) => value.to_string(),
            Err(error) => {
                tracing::warn!(tool = %name, error = %error, "Tool call failed");
                serde_json::json!({ "error": error }).to_string()
            }
        };
        let label = if success { "ok" } else { "error" };
        metrics::counter!("voice_bridge_tool_calls_total", "outcome" => label).increment(1);

        if self.is_ended() {
            return;
        }
        self.send(ClientEvent::FunctionResult { call_id, output }).await;
        self.emit(OrchestratorEvent::ToolCalled { name, success });

        if self.is_closing() {
            return;
        }
        if self.turn.busy() {
            let wait = Duration::from_millis(self.config.tool_followup_max_wait_ms);
            self.pending_turn = Some(PendingTurn {
                bypass_gate: true,
                wait_deadline: Some(Instant::now() + wait),
            });
        } else {
            self.request_turn(true).await;
        }
    }

    /// The in-flight response never finished; follow up regardless
    async fn on_followup_wait_expired(&mut self) {
        let Some(pending) = self.pending_turn.take() else {
            return;
        };
        tracing::warn!(
            active = ?self.turn.active,
            "Active response did not finish in time, requesting tool follow-up"
        );
        self.turn.requested = false;
        self.request_deadline = None;
        if let Some(stuck) = self.turn.active.take() {
            // the service refuses a new response while the old one is live
            self.turn.mark_cancelled(stuck);
            self.send(ClientEvent::CancelResponse).await;
        }
        self.request_turn(pending.bypass_gate).await;
    }

    fn enter_closing(&mut self) {
        self.ignore_caller_audio.store(true, Ordering::Release);
        self.watchdog.disarm();
        self.pending_turn = None;
        self.deferred_turn_at = None;
        self.set_state(OrchestratorState::Closing);
        if self.grace_deadline.is_none() {
            self.grace_deadline =
                Some(Instant::now() + Duration::from_millis(self.config.closing_grace_ms));
        }
    }

    /// End once the farewell has been fully played
    fn finish_if_complete(&mut self) {
        if self.end_requested && !self.turn.busy() && self.output.is_idle() {
            self.end(EndReason::Completed);
        }
    }

    fn on_grace_expired(&mut self) {
        self.grace_deadline = None;
        if self.end_requested {
            tracing::warn!("Farewell playout did not finish within the grace period");
            self.end(EndReason::Completed);
        } else {
            tracing::warn!("No end-of-call request after goodbye, ending call");
            self.end(EndReason::ClosingTimeout);
        }
    }

    fn on_handshake_expired(&mut self) {
        self.handshake_deadline = None;
        tracing::error!(
            timeout_ms = self.realtime.handshake_timeout_ms,
            "Session configuration was not acknowledged"
        );
        self.end(EndReason::HandshakeFailed(
            "configuration not acknowledged".to_string(),
        ));
    }

    fn arm_watchdog(&mut self) {
        if self.state != OrchestratorState::Conversing || self.caller.speaking {
            return;
        }
        let timeout_ms = if self.awaiting_confirmation {
            self.config.confirmation_timeout_ms
        } else {
            self.config.silence_timeout_ms
        };
        self.watchdog.arm(Duration::from_millis(timeout_ms));
    }

    async fn on_watchdog(&mut self, epoch: u64) {
        if !self.watchdog.is_current(epoch)
            || self.state != OrchestratorState::Conversing
            || self.turn.busy()
            || self.caller.speaking
        {
            return;
        }

        if self.silent_reprompts >= self.config.max_silent_reprompts {
            tracing::info!(
                reprompts = self.silent_reprompts,
                "Caller never answered, ending call"
            );
            self.end(EndReason::NoReply);
            return;
        }

        self.silent_reprompts += 1;
        tracing::info!(attempt = self.silent_reprompts, "Caller silent, re-prompting");
        metrics::counter!("voice_bridge_reprompts_total").increment(1);
        let text = self.config.reprompt_message.clone();
        if self
            .send(ClientEvent::InjectMessage {
                role: MessageRole::System,
                text,
            })
            .await
        {
            self.request_turn(true).await;
        }
    }

    /// Idempotent
    fn end(&mut self, reason: EndReason) {
        if self.is_ended() {
            return;
        }
        tracing::info!(reason = %reason, "Call ended");
        metrics::counter!("voice_bridge_calls_ended_total", "reason" => reason.as_str())
            .increment(1);

        self.watchdog.disarm();
        self.grace_deadline = None;
        self.handshake_deadline = None;
        self.deferred_turn_at = None;
        self.request_deadline = None;
        self.pending_turn = None;
        self.ignore_caller_audio.store(true, Ordering::Release);
        self.ended.store(true, Ordering::Release);
        self.end_reason = Some(reason.clone());
        self.set_state(OrchestratorState::Ended);
        self.emit(OrchestratorEvent::Ended(reason));
    }
}

/// Case-insensitive whole-word match on any phrase
fn phrase_pattern(phrases: &[String]) -> Option<Regex> {
    let alternatives: Vec<String> = phrases
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return None;
    }

    let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid phrase list, detection disabled");
            None
        }
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryUpstream;
    use crate::tools::NoTools;
    use crate::RealtimeError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct TestOutput {
        pushed: AtomicUsize,
        clears: AtomicUsize,
        flushes: AtomicUsize,
        busy: AtomicBool,
    }

    impl TestOutput {
        fn drained(&self) {
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    impl AudioOutput for TestOutput {
        fn push_audio(&self, pcm: &[u8]) {
            self.pushed.fetch_add(pcm.len(), Ordering::SeqCst);
            self.busy.store(true, Ordering::SeqCst);
        }
        fn clear(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
            self.busy.store(false, Ordering::SeqCst);
        }
        fn flush(&self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
        fn is_idle(&self) -> bool {
            !self.busy.load(Ordering::SeqCst)
        }
    }

    struct QuoteTool;

    #[async_trait]
    impl ToolHandler for QuoteTool {
        fn declarations(&self) -> Vec<crate::events::ToolDeclaration> {
            vec![crate::events::ToolDeclaration {
                name: "quote".to_string(),
                description: "Price lookup".to_string(),
                parameters: serde_json::json!({ "type": "object" }),
            }]
        }

        async fn call(
            &self,
            name: &str,
            arguments: serde_json::Value,
        ) -> Result<serde_json::Value, RealtimeError> {
            assert_eq!(name, "quote");
            Ok(serde_json::json!({ "item": arguments["item"], "price": 10 }))
        }
    }

    struct Harness {
        server: mpsc::Sender<ServerEvent>,
        sent: mpsc::UnboundedReceiver<ClientEvent>,
        output: Arc<TestOutput>,
        handle: OrchestratorHandle,
        task: JoinHandle<EndReason>,
    }

    fn start(tools: Arc<dyn ToolHandler>) -> Harness {
        start_with(RealtimeConfig::default(), ConversationConfig::default(), tools)
    }

    fn start_with(
        realtime: RealtimeConfig,
        config: ConversationConfig,
        tools: Arc<dyn ToolHandler>,
    ) -> Harness {
        let (upstream, sent) = MemoryUpstream::new();
        let output = Arc::new(TestOutput::default());
        let (orchestrator, handle) =
            Orchestrator::new(realtime, config, upstream, output.clone(), tools);
        let (server, server_rx) = mpsc::channel(64);
        let task = tokio::spawn(orchestrator.run(server_rx));
        Harness {
            server,
            sent,
            output,
            handle,
            task,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    impl Harness {
        async fn feed(&self, event: ServerEvent) {
            self.server.send(event).await.unwrap();
            settle().await;
        }

        async fn next_sent(&mut self) -> ClientEvent {
            tokio::time::timeout(Duration::from_secs(60), self.sent.recv())
                .await
                .expect("no upstream event")
                .expect("upstream closed")
        }

        fn nothing_sent(&mut self) -> bool {
            self.sent.try_recv().is_err()
        }

        /// Configure, greet and finish the greeting
        async fn converse(&mut self) {
            assert!(matches!(self.next_sent().await, ClientEvent::SessionUpdate(_)));
            self.feed(ServerEvent::SessionUpdated).await;
            assert!(matches!(
                self.next_sent().await,
                ClientEvent::CreateResponse { .. }
            ));
            self.feed(created("greeting")).await;
            self.feed(done("greeting")).await;
        }

        async fn end_reason(self) -> EndReason {
            tokio::time::timeout(Duration::from_secs(120), self.task)
                .await
                .expect("orchestrator still running")
                .unwrap()
        }
    }

    fn created(id: &str) -> ServerEvent {
        ServerEvent::ResponseCreated { id: id.to_string() }
    }

    fn done(id: &str) -> ServerEvent {
        ServerEvent::ResponseDone {
            id: id.to_string(),
            status: ResponseStatus::Completed,
        }
    }

    fn audio(id: &str) -> ServerEvent {
        ServerEvent::AudioDelta {
            response_id: Some(id.to_string()),
            audio: vec![0u8; 960],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_update_declares_tools() {
        let mut h = start(Arc::new(QuoteTool));
        match h.next_sent().await {
            ClientEvent::SessionUpdate(settings) => {
                let names: Vec<_> = settings.tools.iter().map(|t| t.name.as_str()).collect();
                assert_eq!(names, vec!["end_call", "quote"]);
                assert_eq!(settings.sample_rate, 24000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_greeting_sent_once() {
        let mut h = start(Arc::new(NoTools));
        let mut events = h.handle.subscribe();
        assert!(matches!(h.next_sent().await, ClientEvent::SessionUpdate(_)));

        h.feed(ServerEvent::SessionUpdated).await;
        h.feed(ServerEvent::SessionUpdated).await;

        match h.next_sent().await {
            ClientEvent::CreateResponse { instructions } => assert!(instructions.is_some()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.nothing_sent());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![OrchestratorState::Configuring, OrchestratorState::Greeting]
        );
        assert_eq!(h.handle.state(), OrchestratorState::Greeting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_completion_does_not_release_turn() {
        let mut h = start(Arc::new(NoTools));
        h.converse().await;

        h.handle.send(Command::Inject {
            role: MessageRole::User,
            text: "first".to_string(),
        });
        settle().await;
        assert!(matches!(h.next_sent().await, ClientEvent::InjectMessage { .. }));
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));
        h.feed(created("a")).await;

        h.handle.send(Command::Inject {
            role: MessageRole::User,
            text: "second".to_string(),
        });
        settle().await;
        assert!(matches!(h.next_sent().await, ClientEvent::InjectMessage { .. }));

        // Completion for some other response must not free the turn
        h.feed(done("greeting")).await;
        h.feed(done("zzz")).await;
        assert!(h.nothing_sent());

        h.feed(done("a")).await;
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_cancels_and_clears() {
        let mut h = start(Arc::new(NoTools));
        let mut events = h.handle.subscribe();
        h.converse().await;
        while events.try_recv().is_ok() {}

        h.handle.send(Command::Inject {
            role: MessageRole::User,
            text: "tell me a story".to_string(),
        });
        settle().await;
        assert!(matches!(h.next_sent().await, ClientEvent::InjectMessage { .. }));
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));
        h.feed(created("story")).await;
        h.feed(audio("story")).await;
        assert_eq!(h.output.pushed.load(Ordering::SeqCst), 960);

        h.feed(ServerEvent::SpeechStarted).await;
        assert_eq!(h.next_sent().await, ClientEvent::CancelResponse);
        assert_eq!(h.output.clears.load(Ordering::SeqCst), 1);

        // Late audio from the cancelled response is dropped
        h.feed(audio("story")).await;
        assert_eq!(h.output.pushed.load(Ordering::SeqCst), 960);

        let mut barged = false;
        while let Ok(event) = events.try_recv() {
            if event
                == (OrchestratorEvent::BargeIn {
                    response_id: "story".to_string(),
                })
            {
                barged = true;
            }
        }
        assert!(barged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_before_response_created() {
        let mut h = start(Arc::new(NoTools));
        assert!(matches!(h.next_sent().await, ClientEvent::SessionUpdate(_)));
        h.feed(ServerEvent::SessionUpdated).await;
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));

        h.feed(ServerEvent::SpeechStarted).await;
        assert!(h.nothing_sent());

        h.feed(created("greeting")).await;
        assert_eq!(h.next_sent().await, ClientEvent::CancelResponse);
        h.feed(audio("greeting")).await;
        assert_eq!(h.output.pushed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_waits_for_quiet_interval() {
        let mut h = start(Arc::new(NoTools));
        h.converse().await;

        h.feed(ServerEvent::SpeechStarted).await;
        h.feed(ServerEvent::SpeechStopped).await;
        assert!(h.nothing_sent());

        // Transcript right after speech ends; the quiet interval is not over yet
        h.feed(ServerEvent::CallerTranscript {
            text: "what are your opening hours".to_string(),
        })
        .await;
        assert!(h.nothing_sent());

        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;
        assert!(h.nothing_sent());

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert!(matches!(
            h.sent.try_recv(),
            Ok(ClientEvent::CreateResponse { instructions: None })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_reprompts_then_no_reply() {
        let mut h = start(Arc::new(NoTools));
        h.converse().await;
        h.handle.send(Command::PlayoutDrained);
        settle().await;

        for attempt in 0..2 {
            match h.next_sent().await {
                ClientEvent::InjectMessage { role, .. } => assert_eq!(role, MessageRole::System),
                other => panic!("unexpected {:?}", other),
            }
            assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));
            let id = format!("reprompt-{}", attempt);
            h.feed(created(&id)).await;
            h.feed(done(&id)).await;
        }

        let began = Instant::now();
        assert_eq!(h.end_reason().await, EndReason::NoReply);
        assert!(began.elapsed() >= Duration::from_millis(8_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_speech_resets_watchdog() {
        let mut h = start(Arc::new(NoTools));
        h.converse().await;
        h.handle.send(Command::PlayoutDrained);
        settle().await;

        tokio::time::sleep(Duration::from_millis(7_000)).await;
        h.feed(ServerEvent::SpeechStarted).await;
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        settle().await;
        assert!(h.nothing_sent());
        assert!(!h.handle.is_ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_uses_longer_timeout() {
        let mut h = start(Arc::new(NoTools));
        assert!(matches!(h.next_sent().await, ClientEvent::SessionUpdate(_)));
        h.feed(ServerEvent::SessionUpdated).await;
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));
        h.feed(created("greeting")).await;
        h.feed(ServerEvent::AgentTranscriptDone {
            response_id: "greeting".to_string(),
            text: "You want two tickets, is that correct?".to_string(),
        })
        .await;
        h.feed(done("greeting")).await;
        h.handle.send(Command::PlayoutDrained);
        settle().await;

        tokio::time::sleep(Duration::from_millis(9_000)).await;
        settle().await;
        assert!(h.nothing_sent());

        tokio::time::sleep(Duration::from_millis(6_500)).await;
        settle().await;
        assert!(matches!(
            h.sent.try_recv(),
            Ok(ClientEvent::InjectMessage { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_goodbye_without_end_call_times_out() {
        let mut h = start(Arc::new(NoTools));
        h.converse().await;
        assert!(h.handle.accepts_caller_audio());

        h.feed(ServerEvent::AgentTranscriptDone {
            response_id: "greeting".to_string(),
            text: "Thanks for calling, Goodbye!".to_string(),
        })
        .await;
        assert!(!h.handle.accepts_caller_audio());
        assert!(!h.handle.is_ended());

        // Caller speech is ignored while closing
        h.feed(ServerEvent::SpeechStarted).await;
        assert!(h.nothing_sent());

        let began = Instant::now();
        assert_eq!(h.end_reason().await, EndReason::ClosingTimeout);
        assert!(began.elapsed() >= Duration::from_millis(9_900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_call_waits_for_playout() {
        let mut h = start(Arc::new(NoTools));
        h.converse().await;
        h.handle.send(Command::Inject {
            role: MessageRole::User,
            text: "that's all".to_string(),
        });
        settle().await;
        assert!(matches!(h.next_sent().await, ClientEvent::InjectMessage { .. }));
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));

        h.feed(created("bye")).await;
        h.feed(audio("bye")).await;
        h.feed(ServerEvent::FunctionCall {
            call_id: "call-1".to_string(),
            name: "end_call".to_string(),
            arguments: "{}".to_string(),
        })
        .await;
        match h.next_sent().await {
            ClientEvent::FunctionResult { call_id, .. } => assert_eq!(call_id, "call-1"),
            other => panic!("unexpected {:?}", other),
        }

        h.feed(done("bye")).await;
        assert_eq!(h.output.flushes.load(Ordering::SeqCst), 2);
        assert!(!h.handle.is_ended());

        h.output.drained();
        h.handle.send(Command::PlayoutDrained);
        settle().await;
        assert!(h.handle.is_ended());
        assert_eq!(h.end_reason().await, EndReason::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_result_followed_by_turn() {
        let mut h = start(Arc::new(QuoteTool));
        h.converse().await;
        h.handle.send(Command::Inject {
            role: MessageRole::User,
            text: "how much is a ticket".to_string(),
        });
        settle().await;
        assert!(matches!(h.next_sent().await, ClientEvent::InjectMessage { .. }));
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));
        h.feed(created("lookup")).await;

        h.feed(ServerEvent::FunctionCall {
            call_id: "call-7".to_string(),
            name: "quote".to_string(),
            arguments: r#"{"item":"ticket"}"#.to_string(),
        })
        .await;
        match h.next_sent().await {
            ClientEvent::FunctionResult { call_id, output } => {
                assert_eq!(call_id, "call-7");
                let value: serde_json::Value = serde_json::from_str(&output).unwrap();
                assert_eq!(value["price"], 10);
                assert_eq!(value["item"], "ticket");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.nothing_sent());

        h.feed(done("lookup")).await;
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_followup_wait_is_bounded() {
        let mut h = start(Arc::new(QuoteTool));
        h.converse().await;
        h.handle.send(Command::Inject {
            role: MessageRole::User,
            text: "price please".to_string(),
        });
        settle().await;
        assert!(matches!(h.next_sent().await, ClientEvent::InjectMessage { .. }));
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));
        h.feed(created("stuck")).await;
        h.feed(ServerEvent::FunctionCall {
            call_id: "call-8".to_string(),
            name: "quote".to_string(),
            arguments: "{}".to_string(),
        })
        .await;
        assert!(matches!(h.next_sent().await, ClientEvent::FunctionResult { .. }));

        let began = Instant::now();
        assert_eq!(h.next_sent().await, ClientEvent::CancelResponse);
        assert!(began.elapsed() >= Duration::from_millis(5_000));
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));

        // the abandoned response can no longer reach the caller
        h.feed(audio("stuck")).await;
        assert_eq!(h.output.pushed.load(Ordering::SeqCst), 0);
    }

    fn rejected() -> ServerEvent {
        ServerEvent::Error {
            message: "Conversation already has an active response".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_response_request_releases_turn() {
        let mut h = start(Arc::new(NoTools));
        h.converse().await;

        h.feed(ServerEvent::CallerTranscript {
            text: "can I change my booking".to_string(),
        })
        .await;
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));

        // queued behind the outstanding request
        h.handle.send(Command::Inject {
            role: MessageRole::User,
            text: "booking 42".to_string(),
        });
        settle().await;
        assert!(matches!(h.next_sent().await, ClientEvent::InjectMessage { .. }));
        assert!(h.nothing_sent());

        h.feed(rejected()).await;
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));

        // rejected again with nothing queued: the watchdog takes over
        h.feed(rejected()).await;
        let began = Instant::now();
        match h.next_sent().await {
            ClientEvent::InjectMessage { role, .. } => assert_eq!(role, MessageRole::System),
            other => panic!("unexpected {:?}", other),
        }
        assert!(began.elapsed() >= Duration::from_millis(8_000));
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));
        assert!(!h.handle.is_ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_response_request_times_out() {
        let mut h = start(Arc::new(NoTools));
        h.converse().await;

        h.feed(ServerEvent::CallerTranscript {
            text: "hello?".to_string(),
        })
        .await;
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));

        let began = Instant::now();
        assert!(matches!(h.next_sent().await, ClientEvent::InjectMessage { .. }));
        assert!(began.elapsed() >= Duration::from_millis(5_000 + 8_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_greeting_moves_to_conversing() {
        let mut h = start(Arc::new(NoTools));
        let mut events = h.handle.subscribe();
        assert!(matches!(h.next_sent().await, ClientEvent::SessionUpdate(_)));
        h.feed(ServerEvent::SessionUpdated).await;
        assert!(matches!(h.next_sent().await, ClientEvent::CreateResponse { .. }));

        h.feed(rejected()).await;
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(states.last(), Some(&OrchestratorState::Conversing));

        // a late completion for nothing we track changes nothing
        h.feed(done("greeting")).await;
        assert!(h.nothing_sent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_tool_arguments_report_error() {
        let mut h = start(Arc::new(QuoteTool));
        h.converse().await;
        h.feed(ServerEvent::FunctionCall {
            call_id: "call-9".to_string(),
            name: "quote".to_string(),
            arguments: "{not json".to_string(),
        })
        .await;
        match h.next_sent().await {
            ClientEvent::FunctionResult { output, .. } => assert!(output.contains("error")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_configuration_ends_call() {
        let mut h = start(Arc::new(NoTools));
        assert!(matches!(h.next_sent().await, ClientEvent::SessionUpdate(_)));
        assert_eq!(
            h.end_reason().await,
            EndReason::HandshakeFailed("configuration not acknowledged".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_close_ends_once() {
        let mut h = start(Arc::new(NoTools));
        let mut events = h.handle.subscribe();
        h.converse().await;
        h.feed(ServerEvent::Closed {
            reason: "going away".to_string(),
        })
        .await;
        h.handle.send(Command::Hangup);
        settle().await;

        let mut ended = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::Ended(reason) = event {
                ended.push(reason);
            }
        }
        assert_eq!(
            ended,
            vec![EndReason::ConnectionClosed("going away".to_string())]
        );
        assert!(!h.handle.accepts_caller_audio());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_command() {
        let h = start(Arc::new(NoTools));
        h.handle.send(Command::Hangup);
        assert_eq!(h.end_reason().await, EndReason::Hangup);
    }

    #[test]
    fn test_phrase_pattern_matches_whole_words() {
        let re = phrase_pattern(&["goodbye".to_string(), "take care".to_string()]).unwrap();
        assert!(re.is_match("OK, GoodBye then"));
        assert!(re.is_match("take care!"));
        assert!(!re.is_match("goodbyes are hard"));
        assert!(phrase_pattern(&[" ".to_string()]).is_none());
    }

    #[test]
    fn test_end_reason_labels() {
        assert_eq!(EndReason::NoReply.as_str(), "no-reply");
        assert_eq!(
            EndReason::TransportFault("socket closed".to_string()).to_string(),
            "transport-fault: socket closed"
        );
        assert_eq!(
            serde_json::to_value(EndReason::ConnectionClosed("bye".to_string())).unwrap(),
            serde_json::json!({ "reason": "connection-closed", "detail": "bye" })
        );
        assert_eq!(
            serde_json::to_value(EndReason::NoReply).unwrap(),
            serde_json::json!({ "reason": "no-reply" })
        );
    }
}
