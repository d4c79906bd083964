//! Ingress Pipeline
//!
//! Turns jittery, possibly reordered G.711 packets into a steady stream of
//! conditioned 20ms PCM16 frames at the speech service's rate:
//!
//! packet -> jitter buffer -> decode / conceal -> DSP -> resample -> frame
//!
//! Processing is synchronous and bounded; it runs directly on the packet
//! receive path.

pub mod dsp;
pub mod jitter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use voice_bridge_config::IngressConfig;
use voice_bridge_core::{AudioFrame, G711Law, TELEPHONY_SAMPLE_RATE};

use crate::codec::G711Codec;
use crate::resample::Resampler;
use crate::rtp::RtpPacket;

pub use dsp::{DspChain, FrameAnalysis};
pub use jitter::{JitterBuffer, JitterOutput, JitterStats};

const INPUT_FRAME_SAMPLES: usize = 160;

/// One conditioned frame ready for the speech service
#[derive(Debug, Clone)]
pub struct IngressFrame {
    /// RTP timestamp of the first input sample
    pub timestamp: u32,
    /// PCM16 frame at the output rate
    pub frame: AudioFrame,
    /// Synthesised by loss concealment
    pub concealed: bool,
    /// Noise gate state for this frame
    pub gate_open: bool,
}

/// Ingress counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressStats {
    pub packets: u64,
    pub frames: u64,
    pub concealed: u64,
    pub resyncs: u64,
    pub late: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets: AtomicU64,
    frames: AtomicU64,
    concealed: AtomicU64,
    resyncs: AtomicU64,
    late: AtomicU64,
    rejected: AtomicU64,
}

/// Readable from other tasks while the pipeline runs
#[derive(Debug, Clone, Default)]
pub struct IngressStatsHandle(Arc<Counters>);

impl IngressStatsHandle {
    pub fn snapshot(&self) -> IngressStats {
        let c = &self.0;
        IngressStats {
            packets: c.packets.load(Ordering::Relaxed),
            frames: c.frames.load(Ordering::Relaxed),
            concealed: c.concealed.load(Ordering::Relaxed),
            resyncs: c.resyncs.load(Ordering::Relaxed),
            late: c.late.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Caller-to-service audio pipeline for one call
pub struct IngressPipeline {
    codec: G711Codec,
    jitter: JitterBuffer,
    dsp: DspChain,
    resampler: Resampler,
    output_rate: u32,
    plc_attenuation: f32,
    /// Last decoded frame, attenuated in place on each concealment
    last_frame: Vec<i16>,
    decoded: Vec<i16>,
    counters: IngressStatsHandle,
}

impl IngressPipeline {
    pub fn new(config: &IngressConfig, law: G711Law, output_rate: u32) -> Self {
        let resampler = Resampler::new(TELEPHONY_SAMPLE_RATE, output_rate, config.resampler);
        tracing::debug!(
            ?law,
            output_rate,
            resampler = resampler.engine_name(),
            "Ingress pipeline created"
        );
        Self {
            codec: G711Codec::new(law),
            jitter: JitterBuffer::new(config, INPUT_FRAME_SAMPLES),
            dsp: DspChain::new(config),
            resampler,
            output_rate,
            plc_attenuation: config.plc_attenuation,
            last_frame: Vec::new(),
            decoded: Vec::with_capacity(INPUT_FRAME_SAMPLES),
            counters: IngressStatsHandle::default(),
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn stats_handle(&self) -> IngressStatsHandle {
        self.counters.clone()
    }

    /// Feed one RTP packet; packets of another payload type (e.g. DTMF) are
    /// ignored
    pub fn push_packet(&mut self, packet: &RtpPacket) -> Vec<IngressFrame> {
        if packet.payload_type != self.codec.law().payload_type() {
            self.counters.0.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(payload_type = packet.payload_type, "Ignoring packet");
            return Vec::new();
        }
        self.push_payload(packet.timestamp, packet.payload.clone())
    }

    /// Feed one encoded payload stamped with `timestamp`
    pub fn push_payload(&mut self, timestamp: u32, payload: Vec<u8>) -> Vec<IngressFrame> {
        self.counters.0.packets.fetch_add(1, Ordering::Relaxed);
        let before = self.jitter.stats();
        let released = self.jitter.push(timestamp, payload);
        let after = self.jitter.stats();
        self.counters
            .0
            .resyncs
            .fetch_add(after.resyncs - before.resyncs, Ordering::Relaxed);
        self.counters
            .0
            .late
            .fetch_add(after.late - before.late, Ordering::Relaxed);

        let mut frames = Vec::new();
        for item in released {
            match item {
                JitterOutput::Packet { timestamp, payload } => {
                    let mut decoded = std::mem::take(&mut self.decoded);
                    decoded.clear();
                    self.codec.decode_into(&payload, &mut decoded);
                    for (i, chunk) in decoded.chunks(INPUT_FRAME_SAMPLES).enumerate() {
                        let mut samples = chunk.to_vec();
                        samples.resize(INPUT_FRAME_SAMPLES, 0);
                        self.last_frame.clone_from(&samples);
                        let ts = timestamp.wrapping_add((i * INPUT_FRAME_SAMPLES) as u32);
                        frames.push(self.condition(ts, samples, false));
                    }
                    self.decoded = decoded;
                }
                JitterOutput::Concealed { timestamp, samples } => {
                    let count = (samples as usize / INPUT_FRAME_SAMPLES).max(1);
                    for i in 0..count {
                        let replacement = self.conceal();
                        let ts = timestamp.wrapping_add((i * INPUT_FRAME_SAMPLES) as u32);
                        frames.push(self.condition(ts, replacement, true));
                    }
                }
            }
        }
        frames
    }

    /// Attenuated replay of the last decoded frame
    fn conceal(&mut self) -> Vec<i16> {
        if self.last_frame.is_empty() {
            return vec![0; INPUT_FRAME_SAMPLES];
        }
        for s in self.last_frame.iter_mut() {
            *s = (*s as f32 * self.plc_attenuation).round() as i16;
        }
        tracing::debug!(attenuation = self.plc_attenuation, "Concealing lost frame");
        self.counters.0.concealed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("voice_bridge_ingress_concealed_frames_total").increment(1);
        self.last_frame.clone()
    }

    fn condition(&mut self, timestamp: u32, mut samples: Vec<i16>, concealed: bool) -> IngressFrame {
        let analysis = self.dsp.process(&mut samples);
        let resampled = self.resampler.process_frame(&samples);
        self.counters.0.frames.fetch_add(1, Ordering::Relaxed);
        IngressFrame {
            timestamp,
            frame: AudioFrame::from_pcm(&resampled, self.output_rate),
            concealed,
            gate_open: analysis.gate_open,
        }
    }

    pub fn reset(&mut self) {
        self.jitter.reset();
        self.last_frame.clear();
    }
}
