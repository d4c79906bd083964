//! Telephony-side media configuration
//!
//! Thresholds for the ingress jitter buffer and DSP chain, and for the egress
//! playout engine. The defaults are tuned for 20ms G.711 over a LAN/WAN trunk.

use serde::{Deserialize, Serialize};
use voice_bridge_core::G711Law;

/// Telephony transport adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportAdapter {
    /// Plain RTP over UDP
    #[default]
    RtpUdp,
}

/// Telephony transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    /// Adapter selected at startup
    #[serde(default)]
    pub adapter: TransportAdapter,

    /// Negotiated G.711 variant
    #[serde(default)]
    pub codec: G711Law,

    /// Local RTP bind address
    #[serde(default = "default_local_addr")]
    pub local_addr: String,

    /// Remote RTP address; learned from the first inbound packet when unset
    #[serde(default)]
    pub remote_addr: Option<String>,

    /// Outbound SSRC; random when unset
    #[serde(default)]
    pub ssrc: Option<u32>,
}

fn default_local_addr() -> String {
    "0.0.0.0:40000".to_string()
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            adapter: TransportAdapter::default(),
            codec: G711Law::default(),
            local_addr: default_local_addr(),
            remote_addr: None,
            ssrc: None,
        }
    }
}

/// Resampler implementation preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplerKind {
    /// FFT/sinc based, falls back to linear when it cannot be built
    #[default]
    Sinc,
    /// Linear interpolation
    Linear,
}

/// Ingress (caller → service) pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Packets buffered before the first frame is released
    #[serde(default = "default_min_fill")]
    pub min_fill: usize,

    /// Consecutive missing frames concealed before waiting/resyncing
    #[serde(default = "default_max_concealed")]
    pub max_concealed_frames: usize,

    /// Buffered future packets required to jump over a gap
    #[serde(default = "default_resync_threshold")]
    pub resync_threshold: usize,

    /// Hard cap on buffered packets
    #[serde(default = "default_max_buffered")]
    pub max_buffered: usize,

    /// Gain applied to the replayed frame during concealment
    #[serde(default = "default_plc_attenuation")]
    pub plc_attenuation: f32,

    /// DC-blocking filter pole
    #[serde(default = "default_dc_block_pole")]
    pub dc_block_pole: f32,

    /// Pre-emphasis coefficient (0 disables)
    #[serde(default = "default_pre_emphasis")]
    pub pre_emphasis: f32,

    /// Enable the noise gate
    #[serde(default = "default_true")]
    pub noise_gate_enabled: bool,

    /// Raw RMS (sample units) that opens the gate
    #[serde(default = "default_gate_open_rms")]
    pub gate_open_rms: f32,

    /// Raw RMS below which the gate may close
    #[serde(default = "default_gate_close_rms")]
    pub gate_close_rms: f32,

    /// Frames the gate stays open after energy drops
    #[serde(default = "default_gate_hold_frames")]
    pub gate_hold_frames: u32,

    /// Gain applied while the gate is closed
    #[serde(default = "default_gate_closed_gain")]
    pub gate_closed_gain: f32,

    /// Enable automatic gain control
    #[serde(default = "default_true")]
    pub agc_enabled: bool,

    /// AGC target RMS (sample units)
    #[serde(default = "default_agc_target_rms")]
    pub agc_target_rms: f32,

    #[serde(default = "default_agc_min_gain")]
    pub agc_min_gain: f32,

    #[serde(default = "default_agc_max_gain")]
    pub agc_max_gain: f32,

    /// EMA factor for frame energy
    #[serde(default = "default_agc_energy_smoothing")]
    pub agc_energy_smoothing: f32,

    /// Smoothing factor for gain changes
    #[serde(default = "default_agc_gain_smoothing")]
    pub agc_gain_smoothing: f32,

    /// Resampler preference
    #[serde(default)]
    pub resampler: ResamplerKind,
}

fn default_min_fill() -> usize {
    3
}
fn default_max_concealed() -> usize {
    2
}
fn default_resync_threshold() -> usize {
    4
}
fn default_max_buffered() -> usize {
    50
}
fn default_plc_attenuation() -> f32 {
    0.92
}
fn default_dc_block_pole() -> f32 {
    0.995
}
fn default_pre_emphasis() -> f32 {
    0.97
}
fn default_true() -> bool {
    true
}
fn default_gate_open_rms() -> f32 {
    450.0
}
fn default_gate_close_rms() -> f32 {
    250.0
}
fn default_gate_hold_frames() -> u32 {
    15
}
fn default_gate_closed_gain() -> f32 {
    0.1
}
fn default_agc_target_rms() -> f32 {
    3000.0
}
fn default_agc_min_gain() -> f32 {
    0.5
}
fn default_agc_max_gain() -> f32 {
    4.0
}
fn default_agc_energy_smoothing() -> f32 {
    0.1
}
fn default_agc_gain_smoothing() -> f32 {
    0.05
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            min_fill: default_min_fill(),
            max_concealed_frames: default_max_concealed(),
            resync_threshold: default_resync_threshold(),
            max_buffered: default_max_buffered(),
            plc_attenuation: default_plc_attenuation(),
            dc_block_pole: default_dc_block_pole(),
            pre_emphasis: default_pre_emphasis(),
            noise_gate_enabled: true,
            gate_open_rms: default_gate_open_rms(),
            gate_close_rms: default_gate_close_rms(),
            gate_hold_frames: default_gate_hold_frames(),
            gate_closed_gain: default_gate_closed_gain(),
            agc_enabled: true,
            agc_target_rms: default_agc_target_rms(),
            agc_min_gain: default_agc_min_gain(),
            agc_max_gain: default_agc_max_gain(),
            agc_energy_smoothing: default_agc_energy_smoothing(),
            agc_gain_smoothing: default_agc_gain_smoothing(),
            resampler: ResamplerKind::default(),
        }
    }
}

/// Egress (service → caller) playout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayoutConfig {
    /// Frames queued before the first playback starts
    #[serde(default = "default_cold_start_frames")]
    pub cold_start_frames: usize,

    /// Frames queued before playback resumes after a drain
    #[serde(default = "default_resume_frames")]
    pub resume_frames: usize,

    /// Queue capacity; the oldest frame is dropped on overflow
    #[serde(default = "default_max_queue_frames")]
    pub max_queue_frames: usize,

    /// Frame buffers kept for reuse
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// Consecutive send failures that trip the breaker
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// Lateness after which the pacing baseline snaps forward
    #[serde(default = "default_drift_snap_ms")]
    pub drift_snap_ms: u64,

    /// Bound on joining the pacing thread at shutdown
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Raise the pacing thread's scheduling priority when permitted
    #[serde(default = "default_true")]
    pub elevated_priority: bool,
}

fn default_cold_start_frames() -> usize {
    10
}
fn default_resume_frames() -> usize {
    3
}
fn default_max_queue_frames() -> usize {
    250
}
fn default_pool_capacity() -> usize {
    64
}
fn default_breaker_threshold() -> u32 {
    20
}
fn default_drift_snap_ms() -> u64 {
    100
}
fn default_join_timeout_ms() -> u64 {
    500
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            cold_start_frames: default_cold_start_frames(),
            resume_frames: default_resume_frames(),
            max_queue_frames: default_max_queue_frames(),
            pool_capacity: default_pool_capacity(),
            breaker_threshold: default_breaker_threshold(),
            drift_snap_ms: default_drift_snap_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            elevated_priority: true,
        }
    }
}
