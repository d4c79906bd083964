//! Egress bridge
//!
//! Turns service audio (PCM16 LE at 16/24 kHz, arbitrary chunk sizes) into
//! 20ms 8 kHz G.711 frames and hands them to the playout engine.

use std::sync::Arc;

use parking_lot::Mutex;
use voice_bridge_config::ResamplerKind;
use voice_bridge_core::{pcm, G711Law, TELEPHONY_SAMPLE_RATE};
use voice_bridge_realtime::AudioOutput;
use voice_bridge_transport::playout::Reframer;
use voice_bridge_transport::{G711Codec, PlayoutEngine, Resampler};

struct Transcoder {
    /// Service-rate PCM carried across chunks
    reframer: Reframer,
    resampler: Resampler,
    codec: G711Codec,
}

/// Service PCM → playout engine
pub struct EgressBridge {
    engine: Arc<PlayoutEngine>,
    transcoder: Mutex<Transcoder>,
}

impl EgressBridge {
    pub fn new(
        engine: Arc<PlayoutEngine>,
        service_rate: u32,
        law: G711Law,
        resampler: ResamplerKind,
    ) -> Self {
        let resampler = Resampler::new(service_rate, TELEPHONY_SAMPLE_RATE, resampler);
        let chunk_bytes = resampler.input_frame_len() * 2;
        tracing::debug!(
            service_rate,
            ?law,
            resampler = resampler.engine_name(),
            "Egress bridge created"
        );
        Self {
            engine,
            transcoder: Mutex::new(Transcoder {
                reframer: Reframer::new(chunk_bytes),
                resampler,
                codec: G711Codec::new(law),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<PlayoutEngine> {
        &self.engine
    }

    /// Service-rate bytes not yet transcoded
    pub fn pending_bytes(&self) -> usize {
        self.transcoder.lock().reframer.pending_len()
    }

    /// Transcode and queue; returns telephony frames produced
    pub fn push(&self, pcm_bytes: &[u8]) -> usize {
        let mut transcoder = self.transcoder.lock();
        let Transcoder {
            reframer,
            resampler,
            codec,
        } = &mut *transcoder;
        let engine = &self.engine;

        let mut frames = 0;
        reframer.push(pcm_bytes, |chunk| {
            frames += encode_chunk(chunk, resampler, codec, engine);
        });
        frames
    }
}

fn encode_chunk(
    chunk: &[u8],
    resampler: &mut Resampler,
    codec: &G711Codec,
    engine: &PlayoutEngine,
) -> usize {
    let samples = pcm::bytes_to_samples(chunk);
    let telephony = resampler.process_frame(&samples);
    engine.push(&codec.encode(&telephony))
}

impl AudioOutput for EgressBridge {
    fn push_audio(&self, pcm: &[u8]) {
        self.push(pcm);
    }

    fn clear(&self) {
        let mut transcoder = self.transcoder.lock();
        transcoder.reframer.clear();
        let dropped = self.engine.clear();
        tracing::debug!(dropped, "Egress cleared");
    }

    fn flush(&self) {
        let mut transcoder = self.transcoder.lock();
        let Transcoder {
            reframer,
            resampler,
            codec,
        } = &mut *transcoder;
        if let Some(tail) = reframer.take_padded(0) {
            encode_chunk(&tail, resampler, codec, &self.engine);
        }
        self.engine.flush();
    }

    fn is_idle(&self) -> bool {
        self.transcoder.lock().reframer.pending_len() == 0 && self.engine.is_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_bridge_config::PlayoutConfig;
    use voice_bridge_core::AudioFormat;
    use voice_bridge_transport::playout::PlayoutState;

    fn bridge(service_rate: u32) -> EgressBridge {
        let (engine, _events) =
            PlayoutEngine::new(PlayoutConfig::default(), AudioFormat::G711(G711Law::ALaw));
        EgressBridge::new(
            Arc::new(engine),
            service_rate,
            G711Law::ALaw,
            ResamplerKind::Linear,
        )
    }

    fn tone(samples: usize) -> Vec<u8> {
        let pcm: Vec<i16> = (0..samples)
            .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
            .collect();
        pcm::samples_to_bytes(&pcm)
    }

    #[test]
    fn test_odd_chunks_are_carried_over() {
        let bridge = bridge(24000);
        // 37ms at 24 kHz: one frame out, 17ms retained
        assert_eq!(bridge.push(&tone(888)), 1);
        assert_eq!(bridge.pending_bytes(), 408 * 2);
        assert_eq!(bridge.engine().queued_frames(), 1);

        // Another 20ms completes a second frame, 17ms still retained
        assert_eq!(bridge.push(&tone(480)), 1);
        assert_eq!(bridge.engine().queued_frames(), 2);
        assert_eq!(bridge.pending_bytes(), 408 * 2);
    }

    #[test]
    fn test_flush_pads_tail_and_starts_playout() {
        let bridge = bridge(16000);
        bridge.push(&tone(100));
        assert_eq!(bridge.engine().queued_frames(), 0);
        assert!(!bridge.is_idle());

        bridge.flush();
        assert_eq!(bridge.engine().queued_frames(), 1);
        assert_eq!(bridge.pending_bytes(), 0);
    }

    #[test]
    fn test_clear_drops_everything() {
        let bridge = bridge(24000);
        bridge.push(&tone(480 * 5 + 100));
        assert_eq!(bridge.engine().queued_frames(), 5);

        bridge.clear();
        assert!(bridge.is_idle());
        assert_eq!(bridge.engine().state(), PlayoutState::Buffering);
    }

    #[test]
    fn test_frames_are_telephony_sized() {
        let (engine, _events) =
            PlayoutEngine::new(PlayoutConfig::default(), AudioFormat::G711(G711Law::MuLaw));
        let engine = Arc::new(engine);
        let bridge = EgressBridge::new(engine.clone(), 24000, G711Law::MuLaw, ResamplerKind::Sinc);
        bridge.push(&tone(480 * 3));
        assert_eq!(engine.queued_frames(), 3);
        assert_eq!(engine.pending_bytes(), 0);
    }
}
