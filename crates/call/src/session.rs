//! Call Session
//!
//! One bridged call: owns the ingress pipeline, the playout engine, the
//! egress bridge and the orchestrator, and nothing is shared between calls.
//!
//! Task layout per call:
//! - caller audio: inbound packets → ingress pipeline → upstream
//! - playout events → orchestrator commands
//! - orchestrator events → [`CallEvent`] broadcast
//! - the orchestrator itself, followed by teardown once it ends
//!
//! The pacing loop runs on its own thread inside the playout engine.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use voice_bridge_config::Settings;
use voice_bridge_core::AudioFormat;
use voice_bridge_realtime::{
    ClientEvent, Command, EndReason, MessageRole, Orchestrator, OrchestratorEvent,
    OrchestratorHandle, OrchestratorState, RealtimeConnection, RealtimeError, ServerEvent,
    ToolHandler, UpstreamSink,
};
use voice_bridge_transport::rtp::RtpPacket;
use voice_bridge_transport::{
    CallInfo, IngressPipeline, IngressStats, IngressStatsHandle, PlayoutEngine, PlayoutEvent,
    PlayoutStats, TelephonyTransport,
};

use crate::egress::EgressBridge;
use crate::events::{CallEvent, CallEventKind};
use crate::CallError;

const EVENT_CAPACITY: usize = 256;

/// Per-call counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStats {
    pub ingress: IngressStats,
    pub playout: PlayoutStats,
    /// Service audio waiting to complete a 20ms chunk
    pub egress_pending_bytes: usize,
}

/// A bridged call
pub struct CallSession {
    call_id: String,
    info: CallInfo,
    handle: OrchestratorHandle,
    events: broadcast::Sender<CallEvent>,
    egress: Arc<EgressBridge>,
    ingress_stats: IngressStatsHandle,
    ended: watch::Receiver<Option<EndReason>>,
    started_at: DateTime<Utc>,
}

impl CallSession {
    /// Answer the next call on `transport` and connect it to the speech service
    ///
    /// Fails if the service cannot be reached or does not acknowledge the
    /// session configuration in time.
    pub async fn start(
        settings: &Settings,
        transport: Arc<dyn TelephonyTransport>,
        tools: Arc<dyn ToolHandler>,
    ) -> Result<Self, CallError> {
        let info = transport.accept_call().await?;
        let (connection, server_events) = match RealtimeConnection::connect(&settings.realtime).await
        {
            Ok(connected) => connected,
            Err(e) => {
                tracing::error!(call = %info.call_id, error = %e, "Speech service unavailable");
                if let Err(end_err) = transport.end_call("upstream-unavailable").await {
                    tracing::warn!(error = %end_err, "Failed to end call");
                }
                return Err(e.into());
            }
        };
        Self::establish(settings, transport, info, tools, connection, server_events).await
    }

    /// Like [`CallSession::start`] over an already connected upstream
    pub async fn start_with_upstream(
        settings: &Settings,
        transport: Arc<dyn TelephonyTransport>,
        tools: Arc<dyn ToolHandler>,
        upstream: Arc<dyn UpstreamSink>,
        server_events: mpsc::Receiver<ServerEvent>,
    ) -> Result<Self, CallError> {
        let info = transport.accept_call().await?;
        Self::establish(settings, transport, info, tools, upstream, server_events).await
    }

    async fn establish(
        settings: &Settings,
        transport: Arc<dyn TelephonyTransport>,
        info: CallInfo,
        tools: Arc<dyn ToolHandler>,
        upstream: Arc<dyn UpstreamSink>,
        server_events: mpsc::Receiver<ServerEvent>,
    ) -> Result<Self, CallError> {
        let call_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("call", call_id = %call_id, transport_call = %info.call_id);
        let service_rate = settings.realtime.sample_rate;

        let packets = match transport.subscribe() {
            Ok(packets) => packets,
            Err(e) => {
                upstream.close().await;
                return Err(e.into());
            }
        };

        let (engine, playout_events) =
            PlayoutEngine::new(settings.playout.clone(), AudioFormat::G711(info.codec));
        let engine = Arc::new(engine);
        if let Err(e) = span.in_scope(|| engine.start(transport.frame_sink())) {
            upstream.close().await;
            return Err(e.into());
        }

        let egress = Arc::new(EgressBridge::new(
            engine.clone(),
            service_rate,
            info.codec,
            settings.ingress.resampler,
        ));
        let ingress = IngressPipeline::new(&settings.ingress, info.codec, service_rate);
        let ingress_stats = ingress.stats_handle();

        let (orchestrator, handle) = Orchestrator::new(
            settings.realtime.clone(),
            settings.conversation.clone(),
            upstream.clone(),
            egress.clone(),
            tools,
        );
        let mut progress = handle.subscribe();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ended_tx, ended_rx) = watch::channel(None);

        let ingress_task = tokio::spawn(
            forward_caller_audio(ingress, packets, upstream.clone(), handle.clone())
                .instrument(span.clone()),
        );
        tokio::spawn(
            forward_playout_events(playout_events, handle.clone(), events.clone(), call_id.clone())
                .instrument(span.clone()),
        );
        tokio::spawn(
            forward_orchestrator_events(handle.subscribe(), events.clone(), call_id.clone())
                .instrument(span.clone()),
        );

        let teardown = Teardown {
            engine,
            upstream,
            transport,
            ingress_task,
            ended: ended_tx,
            started: Instant::now(),
        };
        tokio::spawn(
            async move {
                let reason = orchestrator.run(server_events).await;
                teardown.finish(reason).await;
            }
            .instrument(span.clone()),
        );

        metrics::counter!("voice_bridge_calls_started_total").increment(1);

        // Established once the configuration is acknowledged and the greeting requested
        loop {
            match progress.recv().await {
                Ok(OrchestratorEvent::StateChanged(OrchestratorState::Greeting)) => break,
                Ok(OrchestratorEvent::Ended(EndReason::HandshakeFailed(_))) => {
                    return Err(CallError::Upstream(RealtimeError::HandshakeTimeout(
                        settings.realtime.handshake_timeout_ms,
                    )));
                }
                Ok(OrchestratorEvent::Ended(reason)) => return Err(CallError::EndedEarly(reason)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CallError::EndedEarly(EndReason::ConnectionClosed(
                        "orchestrator stopped".to_string(),
                    )));
                }
            }
        }

        span.in_scope(|| tracing::info!(codec = ?info.codec, service_rate, "Call established"));
        Ok(Self {
            call_id,
            info,
            handle,
            events,
            egress,
            ingress_stats,
            ended: ended_rx,
            started_at: Utc::now(),
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Events from this point on
    ///
    /// The `Configuring` and `Greeting` transitions happen before `start`
    /// returns and are not replayed; read [`CallSession::state`] first.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> OrchestratorState {
        self.handle.state()
    }

    /// Add a message to the conversation; the agent responds to it
    pub fn inject_message(&self, role: MessageRole, text: impl Into<String>) -> Result<(), CallError> {
        let command = Command::Inject {
            role,
            text: text.into(),
        };
        if self.handle.is_ended() || !self.handle.send(command) {
            return Err(CallError::Ended);
        }
        Ok(())
    }

    /// End the call; teardown continues in the background
    pub fn hangup(&self) {
        self.handle.send(Command::Hangup);
    }

    pub fn is_ended(&self) -> bool {
        self.handle.is_ended()
    }

    /// Reason, once teardown has finished
    pub fn end_reason(&self) -> Option<EndReason> {
        self.ended.borrow().clone()
    }

    /// Wait until the call has ended and been torn down
    pub async fn wait_ended(&self) -> EndReason {
        let mut ended = self.ended.clone();
        let reason = match ended.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or(EndReason::Hangup)
    }

    pub fn stats(&self) -> CallStats {
        CallStats {
            ingress: self.ingress_stats.snapshot(),
            playout: self.egress.engine().stats(),
            egress_pending_bytes: self.egress.pending_bytes(),
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if !self.handle.is_ended() {
            self.handle.send(Command::Hangup);
        }
    }
}

/// Everything released when the orchestrator finishes
struct Teardown {
    engine: Arc<PlayoutEngine>,
    upstream: Arc<dyn UpstreamSink>,
    transport: Arc<dyn TelephonyTransport>,
    ingress_task: JoinHandle<()>,
    ended: watch::Sender<Option<EndReason>>,
    started: Instant,
}

impl Teardown {
    async fn finish(self, reason: EndReason) {
        self.ingress_task.abort();
        self.upstream.close().await;

        let engine = self.engine.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || engine.stop()).await {
            tracing::warn!(error = %e, "Playout shutdown did not complete");
        }
        if let Err(e) = self.transport.end_call(reason.as_str()).await {
            tracing::warn!(error = %e, "Failed to end call on transport");
        }

        let duration = self.started.elapsed().as_secs_f64();
        metrics::histogram!("voice_bridge_call_duration_seconds").record(duration);
        tracing::info!(reason = %reason, duration_secs = duration, "Call torn down");
        let _ = self.ended.send(Some(reason));
    }
}

async fn forward_caller_audio(
    mut pipeline: IngressPipeline,
    mut packets: mpsc::Receiver<RtpPacket>,
    upstream: Arc<dyn UpstreamSink>,
    handle: OrchestratorHandle,
) {
    while let Some(packet) = packets.recv().await {
        let frames = pipeline.push_packet(&packet);
        if !handle.accepts_caller_audio() {
            if handle.is_ended() {
                break;
            }
            continue;
        }

        for frame in frames {
            let audio = ClientEvent::AppendAudio(frame.frame.into_bytes());
            if let Err(e) = upstream.send(audio).await {
                tracing::debug!(error = %e, "Caller audio not forwarded");
                metrics::counter!("voice_bridge_ingress_forward_failures_total").increment(1);
                break;
            }
        }
    }
    tracing::debug!("Caller audio stream ended");
}

async fn forward_playout_events(
    mut playout_events: mpsc::UnboundedReceiver<PlayoutEvent>,
    handle: OrchestratorHandle,
    events: broadcast::Sender<CallEvent>,
    call_id: String,
) {
    while let Some(event) = playout_events.recv().await {
        let command = match event {
            PlayoutEvent::Started => Command::PlayoutStarted,
            PlayoutEvent::QueueEmptied => Command::PlayoutDrained,
            PlayoutEvent::Fault {
                consecutive_failures,
                message,
            } => {
                let _ = events.send(CallEvent::new(
                    &call_id,
                    CallEventKind::PlayoutFault {
                        consecutive_failures,
                        message: message.clone(),
                    },
                ));
                Command::PlayoutFault(message)
            }
        };
        if !handle.send(command) {
            break;
        }
    }
}

async fn forward_orchestrator_events(
    mut orchestrator_events: broadcast::Receiver<OrchestratorEvent>,
    events: broadcast::Sender<CallEvent>,
    call_id: String,
) {
    loop {
        match orchestrator_events.recv().await {
            Ok(event) => {
                let ended = matches!(event, OrchestratorEvent::Ended(_));
                let _ = events.send(CallEvent::new(&call_id, event.into()));
                if ended {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Call event subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
