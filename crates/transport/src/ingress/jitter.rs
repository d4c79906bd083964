//! Timestamp-ordered jitter buffer
//!
//! Packets are keyed by their RTP timestamp (unwrapped to 64 bits) and
//! released strictly in timestamp order. Before the first release the buffer
//! waits for `min_fill` packets. Afterwards a packet is released as soon as
//! it is the next expected one.
//!
//! When the expected packet is missing and `min_fill` later packets are
//! already waiting, it is treated as lost: up to `max_concealed` frames are
//! reported as concealed, and if the gap is still open the read cursor jumps
//! to the earliest buffered packet once `resync_threshold` packets are held.

use std::collections::BTreeMap;

use voice_bridge_config::IngressConfig;

/// Item released by the jitter buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitterOutput {
    /// A received packet, in order
    Packet { timestamp: u32, payload: Vec<u8> },
    /// A lost frame that the caller should conceal
    Concealed { timestamp: u32, samples: u32 },
}

/// Jitter buffer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterStats {
    pub received: u64,
    pub released: u64,
    pub concealed: u64,
    pub late: u64,
    pub duplicates: u64,
    pub overflow: u64,
    pub resyncs: u64,
}

#[derive(Debug)]
pub struct JitterBuffer {
    entries: BTreeMap<u64, Vec<u8>>,
    min_fill: usize,
    max_concealed: usize,
    resync_threshold: usize,
    max_buffered: usize,
    /// Extended timestamp of the most recent packet, for unwrapping
    last_seen: Option<u64>,
    /// Next timestamp to release, once started
    next: Option<u64>,
    /// Samples per frame, learned from the last released packet
    step: u64,
    concealed_run: usize,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(config: &IngressConfig, samples_per_frame: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            min_fill: config.min_fill.max(1),
            max_concealed: config.max_concealed_frames,
            resync_threshold: config.resync_threshold.max(1),
            max_buffered: config.max_buffered.max(1),
            last_seen: None,
            next: None,
            step: samples_per_frame as u64,
            concealed_run: 0,
            stats: JitterStats::default(),
        }
    }

    /// Map a 32-bit timestamp onto a monotonic 64-bit timeline
    fn unwrap_timestamp(&mut self, timestamp: u32) -> u64 {
        let extended = match self.last_seen {
            // start one wrap in so early reordering cannot underflow
            None => (1u64 << 32) + timestamp as u64,
            Some(last) => {
                let delta = timestamp.wrapping_sub(last as u32) as i32 as i64;
                (last as i64 + delta) as u64
            }
        };
        self.last_seen = Some(self.last_seen.map_or(extended, |last| last.max(extended)));
        extended
    }

    /// Insert a packet and return everything that became releasable
    pub fn push(&mut self, timestamp: u32, payload: Vec<u8>) -> Vec<JitterOutput> {
        self.stats.received += 1;
        let key = self.unwrap_timestamp(timestamp);

        if self.next.is_some_and(|next| key < next) {
            self.stats.late += 1;
            tracing::debug!(timestamp, "Dropping late packet");
            return Vec::new();
        }
        if self.entries.contains_key(&key) {
            self.stats.duplicates += 1;
            return Vec::new();
        }

        self.entries.insert(key, payload);
        if self.entries.len() > self.max_buffered {
            if let Some((dropped, _)) = self.entries.pop_first() {
                self.stats.overflow += 1;
                tracing::warn!(timestamp = dropped as u32, "Jitter buffer full, dropping oldest");
                if self.next.is_some_and(|next| next <= dropped) {
                    self.next = Some(dropped + self.step);
                }
            }
        }

        if self.next.is_none() {
            if self.entries.len() < self.min_fill {
                return Vec::new();
            }
            self.next = self.entries.keys().next().copied();
        }

        let mut out = Vec::new();
        self.drain(&mut out);
        out
    }

    fn drain(&mut self, out: &mut Vec<JitterOutput>) {
        while let Some(next) = self.next {
            let Some(&first) = self.entries.keys().next() else {
                break;
            };

            if first == next {
                if let Some(payload) = self.entries.remove(&first) {
                    if !payload.is_empty() {
                        self.step = payload.len() as u64;
                    }
                    self.next = Some(next + self.step);
                    self.concealed_run = 0;
                    self.stats.released += 1;
                    out.push(JitterOutput::Packet {
                        timestamp: first as u32,
                        payload,
                    });
                }
                continue;
            }

            // gap: give the missing packet a chance to arrive late
            if self.entries.len() < self.min_fill {
                break;
            }

            if self.concealed_run < self.max_concealed {
                self.concealed_run += 1;
                self.stats.concealed += 1;
                self.next = Some(next + self.step);
                out.push(JitterOutput::Concealed {
                    timestamp: next as u32,
                    samples: self.step as u32,
                });
                continue;
            }

            if self.entries.len() < self.resync_threshold {
                break;
            }

            tracing::warn!(
                expected = next as u32,
                resumed_at = first as u32,
                skipped_samples = first - next,
                "Audio discontinuity, resynchronising jitter buffer"
            );
            self.stats.resyncs += 1;
            metrics::counter!("voice_bridge_ingress_resyncs_total").increment(1);
            self.next = Some(first);
            self.concealed_run = 0;
        }
    }

    /// Packets currently held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once the cold-start fill was reached
    pub fn is_started(&self) -> bool {
        self.next.is_some()
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.next = None;
        self.last_seen = None;
        self.concealed_run = 0;
    }
}
