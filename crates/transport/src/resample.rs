//! Frame Resampler
//!
//! Converts one 20ms frame at the source rate into exactly one 20ms frame at
//! the target rate. The FFT/sinc resampler from Rubato is preferred; when it
//! cannot be built, or fails at runtime, the stream continues on linear
//! interpolation with the same output contract.

use rubato::{FftFixedIn, Resampler as RubatoResampler};
use voice_bridge_config::ResamplerKind;
use voice_bridge_core::{pcm, FRAME_MS};

use crate::TransportError;

/// Frame-oriented resampling engine
pub trait FrameResampler: Send {
    /// Resample one input frame; the output length may deviate from the
    /// nominal frame size and is normalised by [`Resampler`]
    fn process(&mut self, input: &[i16]) -> Result<Vec<i16>, TransportError>;

    /// Engine name for logs
    fn name(&self) -> &'static str;
}

/// High-quality FFT resampler
pub struct SincResampler {
    inner: FftFixedIn<f32>,
    scratch: Vec<f32>,
}

impl SincResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, TransportError> {
        let chunk = frame_len(from_rate);
        let inner = FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, chunk, 2, 1)
            .map_err(|e| TransportError::Resampler(format!("Rubato init failed: {}", e)))?;
        Ok(Self {
            inner,
            scratch: Vec::with_capacity(chunk),
        })
    }
}

impl FrameResampler for SincResampler {
    fn process(&mut self, input: &[i16]) -> Result<Vec<i16>, TransportError> {
        let needed = self.inner.input_frames_next();
        self.scratch.clear();
        self.scratch.extend(pcm::to_f32(input).into_iter().take(needed));
        self.scratch.resize(needed, 0.0);

        let output = self
            .inner
            .process(&[&self.scratch[..]], None)
            .map_err(|e| TransportError::Resampler(format!("Rubato processing failed: {}", e)))?;

        Ok(output
            .first()
            .map(|channel| pcm::from_f32(channel))
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "sinc"
    }
}

/// Linear interpolation resampler
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self { from_rate, to_rate }
    }
}

impl FrameResampler for LinearResampler {
    fn process(&mut self, input: &[i16]) -> Result<Vec<i16>, TransportError> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let ratio = self.to_rate as f64 / self.from_rate as f64;
        let output_len = (input.len() as f64 * ratio).round() as usize;
        let last = input.len() - 1;

        let output = (0..output_len)
            .map(|i| {
                let src = i as f64 / ratio;
                let floor = (src.floor() as usize).min(last);
                let ceil = (floor + 1).min(last);
                let frac = src - floor as f64;
                let sample = input[floor] as f64 * (1.0 - frac) + input[ceil] as f64 * frac;
                sample.round() as i16
            })
            .collect();
        Ok(output)
    }

    fn name(&self) -> &'static str {
        "linear"
    }
}

/// Copies frames when the rates match
struct Passthrough;

impl FrameResampler for Passthrough {
    fn process(&mut self, input: &[i16]) -> Result<Vec<i16>, TransportError> {
        Ok(input.to_vec())
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

fn frame_len(rate: u32) -> usize {
    (rate * FRAME_MS / 1000) as usize
}

/// Resampler with a guaranteed output contract
///
/// `process_frame` always returns exactly `output_frame_len()` samples, zero
/// padded when the engine produces fewer.
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    engine: Box<dyn FrameResampler>,
}

impl Resampler {
    /// Build the preferred engine, degrading to linear interpolation
    pub fn new(from_rate: u32, to_rate: u32, kind: ResamplerKind) -> Self {
        let engine: Box<dyn FrameResampler> = if from_rate == to_rate {
            Box::new(Passthrough)
        } else {
            match kind {
                ResamplerKind::Sinc => match SincResampler::new(from_rate, to_rate) {
                    Ok(sinc) => Box::new(sinc),
                    Err(e) => {
                        tracing::warn!(from_rate, to_rate, "{}, using linear resampler", e);
                        Box::new(LinearResampler::new(from_rate, to_rate))
                    }
                },
                ResamplerKind::Linear => Box::new(LinearResampler::new(from_rate, to_rate)),
            }
        };
        Self::with_engine(from_rate, to_rate, engine)
    }

    /// Use a specific engine
    pub fn with_engine(from_rate: u32, to_rate: u32, engine: Box<dyn FrameResampler>) -> Self {
        Self {
            from_rate,
            to_rate,
            engine,
        }
    }

    /// Samples expected per input frame
    pub fn input_frame_len(&self) -> usize {
        frame_len(self.from_rate)
    }

    /// Samples produced per output frame
    pub fn output_frame_len(&self) -> usize {
        frame_len(self.to_rate)
    }

    /// Active engine name
    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Resample one 20ms frame
    pub fn process_frame(&mut self, input: &[i16]) -> Vec<i16> {
        let mut output = match self.engine.process(input) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(
                    engine = self.engine.name(),
                    "{}, switching to linear resampler",
                    e
                );
                metrics::counter!("voice_bridge_resampler_fallbacks_total").increment(1);
                self.engine = Box::new(LinearResampler::new(self.from_rate, self.to_rate));
                self.engine.process(input).unwrap_or_default()
            }
        };
        output.resize(self.output_frame_len(), 0);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl FrameResampler for Failing {
        fn process(&mut self, _input: &[i16]) -> Result<Vec<i16>, TransportError> {
            Err(TransportError::Resampler("boom".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn sine(len: usize, rate: f32) -> Vec<i16> {
        (0..len)
            .map(|i| ((i as f32 * 440.0 * 2.0 * std::f32::consts::PI / rate).sin() * 8000.0) as i16)
            .collect()
    }

    #[test]
    fn test_linear_upsample_length() {
        let mut resampler = Resampler::new(8000, 16000, ResamplerKind::Linear);
        assert_eq!(resampler.engine_name(), "linear");
        let out = resampler.process_frame(&sine(160, 8000.0));
        assert_eq!(out.len(), 320);
    }

    #[test]
    fn test_short_input_is_zero_padded() {
        let mut resampler = Resampler::new(8000, 24000, ResamplerKind::Linear);
        let out = resampler.process_frame(&[1000; 80]);
        assert_eq!(out.len(), 480);
        assert!(out[300..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_sinc_downsample_length() {
        let mut resampler = Resampler::new(24000, 8000, ResamplerKind::Sinc);
        for _ in 0..5 {
            let out = resampler.process_frame(&sine(480, 24000.0));
            assert_eq!(out.len(), 160);
        }
    }

    #[test]
    fn test_sinc_preserves_energy_in_steady_state() {
        let mut resampler = Resampler::new(8000, 16000, ResamplerKind::Sinc);
        let input = sine(160 * 10, 8000.0);
        let mut last = Vec::new();
        for chunk in input.chunks(160) {
            last = resampler.process_frame(chunk);
        }
        let rms = pcm::rms(&last);
        assert!(rms > 2000.0, "output too quiet: {}", rms);
    }

    #[test]
    fn test_runtime_failure_falls_back_to_linear() {
        let mut resampler = Resampler::with_engine(8000, 16000, Box::new(Failing));
        let out = resampler.process_frame(&[500; 160]);
        assert_eq!(out.len(), 320);
        assert_eq!(resampler.engine_name(), "linear");
        assert!(out.iter().all(|&s| s == 500));
    }

    #[test]
    fn test_equal_rates_pass_through() {
        let mut resampler = Resampler::new(16000, 16000, ResamplerKind::Sinc);
        assert_eq!(resampler.engine_name(), "passthrough");
        assert_eq!(resampler.process_frame(&[7; 320]), vec![7; 320]);
    }
}
