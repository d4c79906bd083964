//! Audio formats and frames
//!
//! Every frame that crosses a component boundary holds exactly 20ms of audio.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Frame duration in milliseconds
pub const FRAME_MS: u32 = 20;

/// Telephony sample rate
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// Sample rates accepted for linear PCM streams
const SUPPORTED_PCM_RATES: [u32; 4] = [8000, 16000, 24000, 48000];

/// G.711 companding law
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum G711Law {
    /// A-law (PCMA, Europe)
    #[serde(rename = "pcma", alias = "alaw")]
    ALaw,
    /// μ-law (PCMU, North America / Japan)
    #[serde(rename = "pcmu", alias = "ulaw")]
    MuLaw,
}

impl G711Law {
    /// Static RTP payload type
    pub fn payload_type(&self) -> u8 {
        match self {
            G711Law::ALaw => 8,
            G711Law::MuLaw => 0,
        }
    }

    /// Encoded value of a zero sample
    pub fn silence_byte(&self) -> u8 {
        match self {
            G711Law::ALaw => 0xD5,
            G711Law::MuLaw => 0xFF,
        }
    }
}

impl Default for G711Law {
    fn default() -> Self {
        Self::ALaw
    }
}

/// Wire format of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    /// G.711 at 8 kHz, one byte per sample
    G711(G711Law),
    /// Signed 16-bit little-endian PCM
    Pcm16 { sample_rate: u32 },
}

impl AudioFormat {
    /// Linear PCM at a supported rate
    pub fn pcm16(sample_rate: u32) -> Result<Self> {
        if SUPPORTED_PCM_RATES.contains(&sample_rate) {
            Ok(AudioFormat::Pcm16 { sample_rate })
        } else {
            Err(Error::UnsupportedSampleRate(sample_rate))
        }
    }

    pub fn sample_rate(&self) -> u32 {
        match self {
            AudioFormat::G711(_) => TELEPHONY_SAMPLE_RATE,
            AudioFormat::Pcm16 { sample_rate } => *sample_rate,
        }
    }

    /// Samples in one 20ms frame
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate() * FRAME_MS / 1000) as usize
    }

    /// Bytes in one 20ms frame
    pub fn frame_bytes(&self) -> usize {
        match self {
            AudioFormat::G711(_) => self.samples_per_frame(),
            AudioFormat::Pcm16 { .. } => self.samples_per_frame() * 2,
        }
    }

    /// Bytes covering `ms` milliseconds
    pub fn bytes_for_ms(&self, ms: u32) -> usize {
        self.frame_bytes() * ms as usize / FRAME_MS as usize
    }

    /// Canonical silence value for one byte of this format
    pub fn silence_byte(&self) -> u8 {
        match self {
            AudioFormat::G711(law) => law.silence_byte(),
            AudioFormat::Pcm16 { .. } => 0x00,
        }
    }
}

/// Exactly one 20ms frame of audio in a single format
///
/// Short input is padded with the format's silence value; a frame is never
/// shorter than `format.frame_bytes()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Vec<u8>,
    format: AudioFormat,
    silence: bool,
}

impl AudioFrame {
    /// Wrap a buffer as a frame, padding or truncating to the frame size
    pub fn from_bytes(mut data: Vec<u8>, format: AudioFormat) -> Self {
        data.resize(format.frame_bytes(), format.silence_byte());
        Self {
            data,
            format,
            silence: false,
        }
    }

    /// Frame of canonical silence
    pub fn silence(format: AudioFormat) -> Self {
        Self {
            data: vec![format.silence_byte(); format.frame_bytes()],
            format,
            silence: true,
        }
    }

    /// Linear PCM frame from samples, zero padded to 20ms
    pub fn from_pcm(samples: &[i16], sample_rate: u32) -> Self {
        let format = AudioFormat::Pcm16 { sample_rate };
        let mut data = Vec::with_capacity(format.frame_bytes());
        crate::pcm::extend_bytes(&mut data, samples);
        Self::from_bytes(data, format)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// True for frames synthesised as filler rather than carrying real audio
    pub fn is_silence(&self) -> bool {
        self.silence
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode a PCM16 frame into samples (empty for G.711 frames)
    pub fn samples(&self) -> Vec<i16> {
        match self.format {
            AudioFormat::Pcm16 { .. } => crate::pcm::bytes_to_samples(&self.data),
            AudioFormat::G711(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        assert_eq!(AudioFormat::G711(G711Law::ALaw).frame_bytes(), 160);
        assert_eq!(AudioFormat::pcm16(16000).unwrap().frame_bytes(), 640);
        assert_eq!(AudioFormat::pcm16(24000).unwrap().samples_per_frame(), 480);
        assert!(AudioFormat::pcm16(11025).is_err());
    }

    #[test]
    fn test_short_frame_is_padded_with_silence() {
        let format = AudioFormat::G711(G711Law::MuLaw);
        let frame = AudioFrame::from_bytes(vec![0x12; 10], format);
        assert_eq!(frame.len(), 160);
        assert_eq!(frame.as_bytes()[10], 0xFF);
        assert!(!frame.is_silence());
    }

    #[test]
    fn test_silence_bytes() {
        assert!(AudioFrame::silence(AudioFormat::G711(G711Law::ALaw))
            .as_bytes()
            .iter()
            .all(|&b| b == 0xD5));
        assert_eq!(AudioFormat::pcm16(8000).unwrap().silence_byte(), 0);
    }

    #[test]
    fn test_pcm_frame_round_trip() {
        let frame = AudioFrame::from_pcm(&[1, -2, 300], 8000);
        let samples = frame.samples();
        assert_eq!(samples.len(), 160);
        assert_eq!(&samples[..3], &[1, -2, 300]);
        assert!(samples[3..].iter().all(|&s| s == 0));
    }
}
