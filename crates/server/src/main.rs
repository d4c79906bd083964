//! Voice Bridge Entry Point
//!
//! Answers one call on the configured telephony adapter, bridges it to the
//! realtime speech service and exits when the call ends or on shutdown.

mod metrics;

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use voice_bridge_call::{CallEventKind, CallSession};
use voice_bridge_config::{load_settings, Settings, TransportAdapter};
use voice_bridge_realtime::NoTools;
use voice_bridge_transport::{RtpUdpTransport, TelephonyTransport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env = std::env::var("VOICE_BRIDGE_ENV").ok();
    let settings = load_settings(env.as_deref())?;

    init_tracing(&settings);
    tracing::info!("Starting Voice Bridge v{}", env!("CARGO_PKG_VERSION"));

    if settings.observability.metrics_enabled {
        metrics::init_metrics(settings.observability.metrics_port)?;
    }

    let transport = build_transport(&settings).await?;
    tracing::info!(codec = ?transport.codec(), "Waiting for call");

    let session = tokio::select! {
        result = CallSession::start(&settings, transport.clone(), Arc::new(NoTools)) => result?,
        _ = shutdown_signal() => {
            tracing::info!("Shutdown before a call was answered");
            return Ok(());
        }
    };
    metrics::record_active_calls(1);

    let mut events = session.subscribe();
    let call_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(json) = event.to_json() {
                tracing::debug!(target: "voice_bridge::events", "{}", json);
            }
            match &event.kind {
                CallEventKind::AgentTranscript { text } => {
                    tracing::info!(call_id = %event.call_id, "Agent: {}", text)
                }
                CallEventKind::CallerTranscript { text } => {
                    tracing::info!(call_id = %event.call_id, "Caller: {}", text)
                }
                CallEventKind::Ended(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        reason = session.wait_ended() => {
            tracing::info!(call_id = %session.call_id(), reason = %reason, "Call finished");
        }
        _ = shutdown_signal() => {
            session.hangup();
            let reason = session.wait_ended().await;
            tracing::info!(call_id = %session.call_id(), reason = %reason, "Call hung up on shutdown");
        }
    }

    let stats = session.stats();
    tracing::info!(
        packets = stats.ingress.packets,
        concealed = stats.ingress.concealed,
        frames_sent = stats.playout.frames_sent,
        send_failures = stats.playout.send_failures,
        "Call statistics"
    );
    metrics::record_active_calls(0);
    call_log.abort();

    tracing::info!("Voice Bridge shutdown complete");
    Ok(())
}

/// Build the configured telephony adapter
async fn build_transport(
    settings: &Settings,
) -> Result<Arc<dyn TelephonyTransport>, Box<dyn std::error::Error>> {
    match settings.telephony.adapter {
        TransportAdapter::RtpUdp => {
            let transport = RtpUdpTransport::bind(&settings.telephony).await?;
            tracing::info!(local = %transport.local_addr()?, "RTP/UDP transport bound");
            Ok(Arc::new(transport))
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Console logging, plain or JSON
fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &settings.observability.log_level;
        format!("voice_bridge={level},voice_bridge_call={level},voice_bridge_transport={level},voice_bridge_realtime={level}").into()
    });

    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
