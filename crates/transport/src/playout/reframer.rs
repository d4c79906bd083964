//! Byte accumulator that slices arbitrary chunks into fixed-size frames

/// Accumulates bytes and yields complete frames, retaining the remainder
#[derive(Debug)]
pub struct Reframer {
    frame_bytes: usize,
    pending: Vec<u8>,
}

impl Reframer {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            frame_bytes,
            pending: Vec::with_capacity(frame_bytes * 2),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Append `bytes` and hand every completed frame to `emit`; returns the
    /// number of frames produced
    pub fn push<F: FnMut(&[u8])>(&mut self, bytes: &[u8], mut emit: F) -> usize {
        if self.frame_bytes == 0 {
            return 0;
        }
        self.pending.extend_from_slice(bytes);

        let mut offset = 0;
        while self.pending.len() - offset >= self.frame_bytes {
            emit(&self.pending[offset..offset + self.frame_bytes]);
            offset += self.frame_bytes;
        }
        self.pending.drain(..offset);
        offset / self.frame_bytes
    }

    /// Bytes retained for the next chunk
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Remainder padded to a full frame with `fill`, if any bytes are pending
    pub fn take_padded(&mut self, fill: u8) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }
        let mut frame = std::mem::take(&mut self.pending);
        frame.resize(self.frame_bytes, fill);
        Some(frame)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
