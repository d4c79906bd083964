//! Prometheus metrics
//!
//! Counters are recorded through the `metrics` facade throughout the
//! workspace; this module installs the exporter and registers the series
//! that should be visible before the first call.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the recorder and serve `/metrics` on `port`
pub fn init_metrics(port: u16) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    register_default_metrics();
    tracing::info!(%addr, "Prometheus metrics listener started");
    Ok(())
}

fn register_default_metrics() {
    gauge!("voice_bridge_calls_active").set(0.0);
    counter!("voice_bridge_calls_started_total").absolute(0);
    counter!("voice_bridge_playout_frames_sent_total").absolute(0);
    counter!("voice_bridge_playout_send_failures_total").absolute(0);
    counter!("voice_bridge_barge_ins_total").absolute(0);
}

/// Track the bridged call count
pub fn record_active_calls(count: usize) {
    gauge!("voice_bridge_calls_active").set(count as f64);
}
