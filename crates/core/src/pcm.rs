//! PCM sample helpers

/// Little-endian 16-bit bytes to samples; a trailing odd byte is ignored
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Samples to little-endian bytes
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    extend_bytes(&mut out, samples);
    out
}

/// Append samples to a byte buffer as little-endian
pub fn extend_bytes(out: &mut Vec<u8>, samples: &[i16]) {
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
}

/// Root-mean-square level in sample units
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Normalise to -1.0..1.0
pub fn to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Saturating conversion back to i16
pub fn from_f32(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_round_trip() {
        let samples = vec![0, 1, -1, i16::MAX, i16::MIN];
        assert_eq!(bytes_to_samples(&samples_to_bytes(&samples)), samples);
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[1000, -1000, 1000, -1000]) - 1000.0).abs() < 0.01);
    }

    #[test]
    fn test_float_conversion_saturates() {
        assert_eq!(from_f32(&[2.0, -2.0]), vec![i16::MAX, i16::MIN]);
        assert_eq!(from_f32(&to_f32(&[1234, -4321])), vec![1234, -4321]);
    }
}
