//! Egress Playout Engine
//!
//! Absorbs bursty audio from the speech service and emits exactly one
//! telephony frame every 20ms on a dedicated pacing thread, substituting
//! silence whenever no real audio is queued.
//!
//! # Buffering
//!
//! The engine starts in [`PlayoutState::Buffering`] and begins playing once
//! `cold_start_frames` are queued. After the queue has drained to empty once,
//! the shallower `resume_frames` threshold applies.
//!
//! # Clear
//!
//! [`PlayoutEngine::clear`] and every pacing tick serialize on the same tick
//! gate. A clear that arrives mid-tick waits for that tick to finish and then
//! drains the queue and accumulator, so no frame queued before the clear can
//! be sent after it returns.

pub mod clock;
pub mod reframer;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use voice_bridge_config::PlayoutConfig;
use voice_bridge_core::{AudioFormat, FramePool, FRAME_MS};

use crate::traits::FrameSink;
use crate::TransportError;

pub use clock::{PacingClock, SystemClock, VirtualClock};
pub use reframer::Reframer;

const FRAME_PERIOD: Duration = Duration::from_millis(FRAME_MS as u64);

/// Playout buffering state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayoutState {
    /// Waiting for the active threshold to be reached
    Buffering,
    /// Draining queued frames
    Playing,
}

/// Notifications from the pacing thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayoutEvent {
    /// Playback started after buffering
    Started,
    /// Queue drained after real audio played
    QueueEmptied,
    /// Circuit breaker tripped; the pacing loop has stopped
    Fault {
        consecutive_failures: u32,
        message: String,
    },
}

/// Snapshot of playout counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayoutStats {
    pub frames_sent: u64,
    pub silence_frames: u64,
    pub send_failures: u64,
    pub dropped_frames: u64,
    pub drift_snaps: u64,
    pub breaker_trips: u64,
    pub pool_misses: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    silence_frames: AtomicU64,
    send_failures: AtomicU64,
    dropped_frames: AtomicU64,
    drift_snaps: AtomicU64,
    breaker_trips: AtomicU64,
}

#[derive(Debug, PartialEq, Eq)]
enum TickOutcome {
    Sent,
    Failed,
    Tripped,
}

/// State shared between producers and the pacing thread
struct PlayoutShared {
    config: PlayoutConfig,
    silence: Vec<u8>,
    queue: ArrayQueue<Vec<u8>>,
    pool: FramePool,
    accumulator: Mutex<Reframer>,
    tick_gate: Mutex<()>,
    playing: AtomicBool,
    drained_once: AtomicBool,
    /// Play whatever is queued on the next tick, ignoring the threshold
    force_start: AtomicBool,
    real_audio_played: AtomicBool,
    consecutive_failures: AtomicU32,
    tripped: AtomicBool,
    running: AtomicBool,
    counters: Counters,
    events: mpsc::UnboundedSender<PlayoutEvent>,
}

impl PlayoutShared {
    fn enqueue(&self, frame: &[u8]) {
        let mut buf = self.pool.checkout();
        buf.extend_from_slice(frame);
        if let Some(old) = self.queue.force_push(buf) {
            self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("voice_bridge_playout_dropped_frames_total").increment(1);
            self.pool.recycle(old);
        }
    }

    fn drain_queue(&self) -> usize {
        let mut drained = 0;
        while let Some(buf) = self.queue.pop() {
            self.pool.recycle(buf);
            drained += 1;
        }
        drained
    }

    fn active_threshold(&self) -> usize {
        if self.drained_once.load(Ordering::Acquire) {
            self.config.resume_frames
        } else {
            self.config.cold_start_frames
        }
    }

    /// Send exactly one frame
    fn tick(&self, sink: &dyn FrameSink, timestamp: u32) -> TickOutcome {
        let _gate = self.tick_gate.lock();

        if self.tripped.load(Ordering::Acquire) {
            return TickOutcome::Tripped;
        }

        let queued = self.queue.len();
        let ready = queued >= self.active_threshold()
            || (queued > 0 && self.force_start.load(Ordering::Acquire));
        if !self.playing.load(Ordering::Acquire) && ready {
            self.playing.store(true, Ordering::Release);
            self.force_start.store(false, Ordering::Release);
            let _ = self.events.send(PlayoutEvent::Started);
        }

        let frame = if self.playing.load(Ordering::Acquire) {
            self.queue.pop()
        } else {
            None
        };
        let real = frame.is_some();
        let payload = frame.as_deref().unwrap_or(&self.silence[..]);

        let outcome = match sink.send_frame(payload, timestamp) {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Release);
                self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("voice_bridge_playout_frames_sent_total").increment(1);
                if !real {
                    self.counters.silence_frames.fetch_add(1, Ordering::Relaxed);
                }
                TickOutcome::Sent
            }
            Err(e) => self.record_failure(e),
        };

        if let Some(buf) = frame {
            self.pool.recycle(buf);
            self.real_audio_played.store(true, Ordering::Release);
        }

        if real && self.queue.is_empty() {
            self.playing.store(false, Ordering::Release);
            self.drained_once.store(true, Ordering::Release);
            if self.real_audio_played.swap(false, Ordering::AcqRel) {
                let _ = self.events.send(PlayoutEvent::QueueEmptied);
            }
        }

        outcome
    }

    fn record_failure(&self, error: TransportError) -> TickOutcome {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("voice_bridge_playout_send_failures_total").increment(1);

        if failures < self.config.breaker_threshold {
            tracing::warn!(failures, "Frame send failed: {}", error);
            return TickOutcome::Failed;
        }

        if !self.tripped.swap(true, Ordering::AcqRel) {
            tracing::error!(failures, "Send circuit breaker tripped: {}", error);
            self.counters.breaker_trips.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("voice_bridge_playout_breaker_trips_total").increment(1);
            let _ = self.events.send(PlayoutEvent::Fault {
                consecutive_failures: failures,
                message: error.to_string(),
            });
        }
        TickOutcome::Tripped
    }
}

struct PacerHandle {
    thread: std::thread::JoinHandle<()>,
    done: std::sync::mpsc::Receiver<()>,
}

/// Fixed-rate playout engine for one call
pub struct PlayoutEngine {
    shared: Arc<PlayoutShared>,
    format: AudioFormat,
    pacer: Mutex<Option<PacerHandle>>,
}

impl PlayoutEngine {
    /// Create an engine emitting frames in `format`
    pub fn new(
        config: PlayoutConfig,
        format: AudioFormat,
    ) -> (Self, mpsc::UnboundedReceiver<PlayoutEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let frame_bytes = format.frame_bytes();
        let shared = PlayoutShared {
            silence: vec![format.silence_byte(); frame_bytes],
            queue: ArrayQueue::new(config.max_queue_frames.max(1)),
            pool: FramePool::new(config.pool_capacity, frame_bytes),
            accumulator: Mutex::new(Reframer::new(frame_bytes)),
            tick_gate: Mutex::new(()),
            playing: AtomicBool::new(false),
            drained_once: AtomicBool::new(false),
            force_start: AtomicBool::new(false),
            real_audio_played: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
            running: AtomicBool::new(false),
            counters: Counters::default(),
            events,
            config,
        };

        let engine = Self {
            shared: Arc::new(shared),
            format,
            pacer: Mutex::new(None),
        };
        (engine, rx)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Start pacing on the system clock
    pub fn start(&self, sink: Arc<dyn FrameSink>) -> Result<(), TransportError> {
        self.start_with_clock(sink, Arc::new(SystemClock))
    }

    /// Start pacing on a specific clock
    pub fn start_with_clock(
        &self,
        sink: Arc<dyn FrameSink>,
        clock: Arc<dyn PacingClock>,
    ) -> Result<(), TransportError> {
        let mut pacer = self.pacer.lock();
        if pacer.is_some() {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let samples_per_frame = self.format.samples_per_frame() as u32;
        let span = tracing::Span::current();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("playout-pacer".to_string())
            .spawn(move || {
                let _enter = span.enter();
                if shared.config.elevated_priority {
                    elevate_priority();
                }
                pacing_loop(&shared, sink.as_ref(), clock.as_ref(), samples_per_frame);
                let _ = done_tx.send(());
            })
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                TransportError::Io(e)
            })?;

        *pacer = Some(PacerHandle {
            thread,
            done: done_rx,
        });
        tracing::debug!(format = ?self.format, "Playout engine started");
        Ok(())
    }

    /// Append service audio; complete frames are queued, the remainder is kept
    pub fn push(&self, bytes: &[u8]) -> usize {
        let mut accumulator = self.shared.accumulator.lock();
        accumulator.push(bytes, |frame| self.shared.enqueue(frame))
    }

    /// End of a burst: queue the accumulator remainder padded with silence
    /// and start playing even if the buffering threshold was not reached
    pub fn flush(&self) {
        let mut accumulator = self.shared.accumulator.lock();
        if let Some(frame) = accumulator.take_padded(self.format.silence_byte()) {
            self.shared.enqueue(&frame);
        }
        if !self.shared.queue.is_empty() {
            self.shared.force_start.store(true, Ordering::Release);
        }
    }

    /// Drop all queued and accumulated audio
    ///
    /// Returns once the in-flight tick (if any) has finished; nothing queued
    /// before this call is sent afterwards.
    pub fn clear(&self) -> usize {
        let _gate = self.shared.tick_gate.lock();
        let mut accumulator = self.shared.accumulator.lock();
        accumulator.clear();
        let drained = self.shared.drain_queue();
        self.shared.playing.store(false, Ordering::Release);
        self.shared.force_start.store(false, Ordering::Release);
        self.shared.real_audio_played.store(false, Ordering::Release);
        tracing::debug!(drained, "Playout cleared");
        drained
    }

    pub fn state(&self) -> PlayoutState {
        if self.shared.playing.load(Ordering::Acquire) {
            PlayoutState::Playing
        } else {
            PlayoutState::Buffering
        }
    }

    pub fn queued_frames(&self) -> usize {
        self.shared.queue.len()
    }

    /// Nothing queued or accumulated
    pub fn is_idle(&self) -> bool {
        self.shared.queue.is_empty() && self.shared.accumulator.lock().pending_len() == 0
    }

    /// Bytes retained in the accumulator
    pub fn pending_bytes(&self) -> usize {
        self.shared.accumulator.lock().pending_len()
    }

    pub fn is_tripped(&self) -> bool {
        self.shared.tripped.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PlayoutStats {
        let c = &self.shared.counters;
        PlayoutStats {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            silence_frames: c.silence_frames.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            dropped_frames: c.dropped_frames.load(Ordering::Relaxed),
            drift_snaps: c.drift_snaps.load(Ordering::Relaxed),
            breaker_trips: c.breaker_trips.load(Ordering::Relaxed),
            pool_misses: self.shared.pool.misses(),
        }
    }

    /// Stop the pacing thread, waiting at most `join_timeout_ms`
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let Some(pacer) = self.pacer.lock().take() else {
            return;
        };

        let timeout = Duration::from_millis(self.shared.config.join_timeout_ms);
        match pacer.done.recv_timeout(timeout) {
            Ok(()) | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                let _ = pacer.thread.join();
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(?timeout, "Pacing thread did not stop in time, detaching");
            }
        }

        self.shared.drain_queue();
        self.shared.accumulator.lock().clear();
    }
}

impl Drop for PlayoutEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pacing_loop(
    shared: &PlayoutShared,
    sink: &dyn FrameSink,
    clock: &dyn PacingClock,
    samples_per_frame: u32,
) {
    let snap_after = Duration::from_millis(shared.config.drift_snap_ms);
    let mut timestamp: u32 = rand::random();
    let mut deadline = clock.now();

    while shared.running.load(Ordering::Acquire) {
        let now = clock.now();
        if now < deadline {
            clock.sleep_until(deadline);
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
        } else if now.duration_since(deadline) > snap_after {
            tracing::debug!(
                behind_ms = now.duration_since(deadline).as_millis() as u64,
                "Pacing baseline snapped forward"
            );
            shared.counters.drift_snaps.fetch_add(1, Ordering::Relaxed);
            deadline = now;
        }

        if shared.tick(sink, timestamp) == TickOutcome::Tripped {
            break;
        }
        timestamp = timestamp.wrapping_add(samples_per_frame);
        deadline += FRAME_PERIOD;
    }

    shared.running.store(false, Ordering::Release);
    tracing::debug!("Pacing loop exited");
}

#[cfg(target_os = "linux")]
fn elevate_priority() {
    // On Linux the nice value is per thread
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -10) };
    if rc != 0 {
        tracing::debug!(
            "Could not raise pacing thread priority: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn elevate_priority() {}
