//! Per-frame conditioning for caller audio
//!
//! Order: DC block, pre-emphasis, noise gate, AGC. The gate decision uses the
//! RMS of the raw frame before any filtering.

use voice_bridge_config::IngressConfig;
use voice_bridge_core::pcm;

/// One-pole DC blocking filter: `y[n] = x[n] - x[n-1] + p * y[n-1]`
#[derive(Debug, Clone)]
pub struct DcBlocker {
    pole: f32,
    prev_in: f32,
    prev_out: f32,
}

impl DcBlocker {
    pub fn new(pole: f32) -> Self {
        Self {
            pole,
            prev_in: 0.0,
            prev_out: 0.0,
        }
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            let out = *s - self.prev_in + self.pole * self.prev_out;
            self.prev_in = *s;
            self.prev_out = out;
            *s = out;
        }
    }
}

/// First-order pre-emphasis: `y[n] = x[n] - a * x[n-1]`
#[derive(Debug, Clone)]
pub struct PreEmphasis {
    coefficient: f32,
    prev: f32,
}

impl PreEmphasis {
    pub fn new(coefficient: f32) -> Self {
        Self {
            coefficient,
            prev: 0.0,
        }
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            let x = *s;
            *s = x - self.coefficient * self.prev;
            self.prev = x;
        }
    }
}

/// Soft noise gate with hysteresis and hold
#[derive(Debug, Clone)]
pub struct NoiseGate {
    open_rms: f32,
    close_rms: f32,
    hold_frames: u32,
    closed_gain: f32,
    open: bool,
    hold: u32,
}

impl NoiseGate {
    pub fn new(config: &IngressConfig) -> Self {
        Self {
            open_rms: config.gate_open_rms,
            close_rms: config.gate_close_rms,
            hold_frames: config.gate_hold_frames,
            closed_gain: config.gate_closed_gain,
            open: false,
            hold: 0,
        }
    }

    /// Update with the raw frame level; returns whether the gate is open
    pub fn update(&mut self, raw_rms: f32) -> bool {
        if raw_rms >= self.open_rms {
            self.open = true;
            self.hold = self.hold_frames;
        } else if self.open {
            if raw_rms >= self.close_rms {
                self.hold = self.hold_frames;
            } else if self.hold > 0 {
                self.hold -= 1;
            } else {
                self.open = false;
            }
        }
        self.open
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn closed_gain(&self) -> f32 {
        self.closed_gain
    }
}

/// Automatic gain control driven by an EMA of frame level
#[derive(Debug, Clone)]
pub struct Agc {
    target_rms: f32,
    min_gain: f32,
    max_gain: f32,
    energy_smoothing: f32,
    gain_smoothing: f32,
    level: Option<f32>,
    gain: f32,
}

impl Agc {
    pub fn new(config: &IngressConfig) -> Self {
        Self {
            target_rms: config.agc_target_rms,
            min_gain: config.agc_min_gain,
            max_gain: config.agc_max_gain,
            energy_smoothing: config.agc_energy_smoothing,
            gain_smoothing: config.agc_gain_smoothing,
            level: None,
            gain: 1.0,
        }
    }

    /// Track `frame_rms` and return the gain to apply
    pub fn update(&mut self, frame_rms: f32) -> f32 {
        let level = match self.level {
            None => frame_rms,
            Some(level) => level + self.energy_smoothing * (frame_rms - level),
        };
        self.level = Some(level);

        let desired = (self.target_rms / level.max(1.0)).clamp(self.min_gain, self.max_gain);
        self.gain += self.gain_smoothing * (desired - self.gain);
        self.gain = self.gain.clamp(self.min_gain, self.max_gain);
        self.gain
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

/// Result of conditioning one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameAnalysis {
    pub raw_rms: f32,
    pub gate_open: bool,
    pub gain: f32,
}

/// The full conditioning chain
#[derive(Debug, Clone)]
pub struct DspChain {
    dc: DcBlocker,
    emphasis: Option<PreEmphasis>,
    gate: Option<NoiseGate>,
    agc: Option<Agc>,
    scratch: Vec<f32>,
}

impl DspChain {
    pub fn new(config: &IngressConfig) -> Self {
        Self {
            dc: DcBlocker::new(config.dc_block_pole),
            emphasis: (config.pre_emphasis > 0.0).then(|| PreEmphasis::new(config.pre_emphasis)),
            gate: config.noise_gate_enabled.then(|| NoiseGate::new(config)),
            agc: config.agc_enabled.then(|| Agc::new(config)),
            scratch: Vec::new(),
        }
    }

    /// Condition one frame in place
    pub fn process(&mut self, samples: &mut [i16]) -> FrameAnalysis {
        let raw_rms = pcm::rms(samples);

        self.scratch.clear();
        self.scratch.extend(samples.iter().map(|&s| s as f32));

        self.dc.process(&mut self.scratch);
        if let Some(emphasis) = self.emphasis.as_mut() {
            emphasis.process(&mut self.scratch);
        }

        let gate_open = self.gate.as_mut().map_or(true, |gate| gate.update(raw_rms));

        let gain = if gate_open {
            match self.agc.as_mut() {
                Some(agc) => {
                    let level = rms_f32(&self.scratch);
                    agc.update(level)
                }
                None => 1.0,
            }
        } else {
            self.gate.as_ref().map_or(1.0, NoiseGate::closed_gain)
        };

        for (out, &s) in samples.iter_mut().zip(self.scratch.iter()) {
            *out = (s * gain).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }

        FrameAnalysis {
            raw_rms,
            gate_open,
            gain,
        }
    }
}

fn rms_f32(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: f32) -> Vec<i16> {
        (0..160)
            .map(|i| ((i as f32 * 0.3).sin() * amplitude) as i16)
            .collect()
    }

    #[test]
    fn test_dc_blocker_removes_offset() {
        let mut dc = DcBlocker::new(0.995);
        let mut last = Vec::new();
        for _ in 0..100 {
            let mut frame = vec![1000.0f32; 160];
            dc.process(&mut frame);
            last = frame;
        }
        assert!(last.iter().all(|s| s.abs() < 50.0));
    }

    #[test]
    fn test_gate_hysteresis_and_hold() {
        let config = IngressConfig {
            gate_hold_frames: 2,
            ..IngressConfig::default()
        };
        let mut gate = NoiseGate::new(&config);

        assert!(!gate.update(300.0)); // below open threshold
        assert!(gate.update(500.0));
        assert!(gate.update(300.0)); // between thresholds stays open
        assert!(gate.update(100.0)); // hold 2 -> 1
        assert!(gate.update(100.0)); // hold 1 -> 0
        assert!(!gate.update(100.0));
    }

    #[test]
    fn test_closed_gate_attenuates_without_muting() {
        let config = IngressConfig {
            pre_emphasis: 0.0,
            agc_enabled: false,
            ..IngressConfig::default()
        };
        let mut chain = DspChain::new(&config);
        let mut frame = tone(200.0);
        let analysis = chain.process(&mut frame);

        assert!(!analysis.gate_open);
        assert!((analysis.gain - 0.1).abs() < f32::EPSILON);
        let level = pcm::rms(&frame);
        assert!(level > 0.0 && level < 40.0, "level {}", level);
    }

    #[test]
    fn test_gate_uses_raw_level() {
        // pre-emphasis strongly attenuates a low tone; the gate must still open
        let config = IngressConfig {
            agc_enabled: false,
            ..IngressConfig::default()
        };
        let mut chain = DspChain::new(&config);
        let mut frame: Vec<i16> = (0..160)
            .map(|i| ((i as f32 * 0.02).sin() * 1500.0) as i16)
            .collect();
        assert!(chain.process(&mut frame).gate_open);
    }

    #[test]
    fn test_agc_moves_toward_target_within_bounds() {
        let config = IngressConfig::default();
        let mut agc = Agc::new(&config);
        for _ in 0..500 {
            agc.update(500.0);
        }
        assert!((agc.gain() - 4.0).abs() < 0.01);

        for _ in 0..500 {
            agc.update(12000.0);
        }
        assert!((agc.gain() - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_agc_only_applied_while_open() {
        let mut chain = DspChain::new(&IngressConfig::default());
        let mut quiet = tone(100.0);
        let analysis = chain.process(&mut quiet);
        assert!(!analysis.gate_open);
        assert!(chain.agc.as_ref().unwrap().level.is_none());
    }
}
