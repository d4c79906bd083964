//! G.711 Codec
//!
//! A-law and μ-law ⟷ 16-bit linear PCM through precomputed tables: a
//! 256-entry decode table and a 65536-entry encode table (indexed by the
//! sample reinterpreted as `u16`) per law. The tables are generated once from
//! the ITU-T G.711 reference segment/mantissa algorithm, so the hot path is a
//! single lookup per sample.

use once_cell::sync::Lazy;
use voice_bridge_core::G711Law;

const SIGN_BIT: u8 = 0x80;
const QUANT_MASK: u8 = 0x0F;
const SEG_SHIFT: u8 = 4;
const SEG_MASK: u8 = 0x70;

const ALAW_SEG_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];
const ULAW_SEG_END: [i32; 8] = [0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF];
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 8159;

static ALAW_DECODE: Lazy<[i16; 256]> = Lazy::new(|| {
    let mut table = [0i16; 256];
    for (code, entry) in table.iter_mut().enumerate() {
        *entry = alaw_to_linear(code as u8);
    }
    table
});

static ULAW_DECODE: Lazy<[i16; 256]> = Lazy::new(|| {
    let mut table = [0i16; 256];
    for (code, entry) in table.iter_mut().enumerate() {
        *entry = ulaw_to_linear(code as u8);
    }
    table
});

static ALAW_ENCODE: Lazy<Box<[u8]>> = Lazy::new(|| {
    (0..=u16::MAX)
        .map(|index| linear_to_alaw(index as i16))
        .collect()
});

static ULAW_ENCODE: Lazy<Box<[u8]>> = Lazy::new(|| {
    (0..=u16::MAX)
        .map(|index| linear_to_ulaw(index as i16))
        .collect()
});

fn segment(value: i32, ends: &[i32; 8]) -> usize {
    ends.iter().position(|&end| value <= end).unwrap_or(ends.len())
}

fn linear_to_alaw(sample: i16) -> u8 {
    let mut value = (sample as i32) >> 3;
    let mask = if value >= 0 {
        0xD5
    } else {
        value = -value - 1;
        0x55
    };

    let seg = segment(value, &ALAW_SEG_END);
    if seg >= 8 {
        return 0x7F ^ mask;
    }

    let mantissa = if seg < 2 { value >> 1 } else { value >> seg };
    (((seg as u8) << SEG_SHIFT) | (mantissa as u8 & QUANT_MASK)) ^ mask
}

fn alaw_to_linear(code: u8) -> i16 {
    let code = code ^ 0x55;
    let mut t = ((code & QUANT_MASK) as i32) << 4;
    let seg = ((code & SEG_MASK) >> SEG_SHIFT) as i32;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => t = (t + 0x108) << (seg - 1),
    }
    if code & SIGN_BIT != 0 {
        t as i16
    } else {
        -t as i16
    }
}

fn linear_to_ulaw(sample: i16) -> u8 {
    let mut value = (sample as i32) >> 2;
    let mask = if value < 0 {
        value = -value;
        0x7F
    } else {
        0xFF
    };
    value = value.min(ULAW_CLIP) + (ULAW_BIAS >> 2);

    let seg = segment(value, &ULAW_SEG_END);
    if seg >= 8 {
        return 0x7F ^ mask;
    }

    (((seg as u8) << SEG_SHIFT) | ((value >> (seg + 1)) as u8 & QUANT_MASK)) ^ mask
}

fn ulaw_to_linear(code: u8) -> i16 {
    let code = !code;
    let mut t = (((code & QUANT_MASK) as i32) << 3) + ULAW_BIAS;
    t <<= (code & SEG_MASK) >> SEG_SHIFT;
    if code & SIGN_BIT != 0 {
        (ULAW_BIAS - t) as i16
    } else {
        (t - ULAW_BIAS) as i16
    }
}

/// Encode one sample to A-law
#[inline]
pub fn alaw_encode(sample: i16) -> u8 {
    ALAW_ENCODE[sample as u16 as usize]
}

/// Decode one A-law byte
#[inline]
pub fn alaw_decode(code: u8) -> i16 {
    ALAW_DECODE[code as usize]
}

/// Encode one sample to μ-law
#[inline]
pub fn ulaw_encode(sample: i16) -> u8 {
    ULAW_ENCODE[sample as u16 as usize]
}

/// Decode one μ-law byte
#[inline]
pub fn ulaw_decode(code: u8) -> i16 {
    ULAW_DECODE[code as usize]
}

/// G.711 codec for one companding law
///
/// Total over all inputs; there are no error states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct G711Codec {
    law: G711Law,
}

impl G711Codec {
    pub fn new(law: G711Law) -> Self {
        Self { law }
    }

    /// A-law (PCMA)
    pub fn pcma() -> Self {
        Self::new(G711Law::ALaw)
    }

    /// μ-law (PCMU)
    pub fn pcmu() -> Self {
        Self::new(G711Law::MuLaw)
    }

    pub fn law(&self) -> G711Law {
        self.law
    }

    /// Decode G.711 bytes to 16-bit PCM
    pub fn decode(&self, bytes: &[u8]) -> Vec<i16> {
        let mut out = Vec::with_capacity(bytes.len());
        self.decode_into(bytes, &mut out);
        out
    }

    /// Decode appending to `out`
    pub fn decode_into(&self, bytes: &[u8], out: &mut Vec<i16>) {
        let table: &[i16; 256] = match self.law {
            G711Law::ALaw => &*ALAW_DECODE,
            G711Law::MuLaw => &*ULAW_DECODE,
        };
        out.extend(bytes.iter().map(|&b| table[b as usize]));
    }

    /// Encode 16-bit PCM to G.711 bytes
    pub fn encode(&self, pcm: &[i16]) -> Vec<u8> {
        let mut out = Vec::with_capacity(pcm.len());
        self.encode_into(pcm, &mut out);
        out
    }

    /// Encode appending to `out`
    pub fn encode_into(&self, pcm: &[i16], out: &mut Vec<u8>) {
        let table: &[u8] = match self.law {
            G711Law::ALaw => &ALAW_ENCODE[..],
            G711Law::MuLaw => &ULAW_ENCODE[..],
        };
        out.extend(pcm.iter().map(|&s| table[s as u16 as usize]));
    }
}
