//! Silence watchdog
//!
//! Each arming bumps an epoch; a timer only reports if its epoch is still
//! current when it expires, so re-arming invalidates every earlier timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Epoch-guarded one-shot timer
pub struct SilenceWatchdog {
    epoch: Arc<AtomicU64>,
    fired: mpsc::UnboundedSender<u64>,
    timer: Option<JoinHandle<()>>,
}

impl SilenceWatchdog {
    /// Create a watchdog; expirations arrive on the returned receiver as epochs
    pub fn new() -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let watchdog = Self {
            epoch: Arc::new(AtomicU64::new(0)),
            fired,
            timer: None,
        };
        (watchdog, rx)
    }

    /// Start a new timer, invalidating any previous one
    pub fn arm(&mut self, timeout: Duration) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }

        let current = self.epoch.clone();
        let fired = self.fired.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if current.load(Ordering::Acquire) == epoch {
                let _ = fired.send(epoch);
            }
        }));
        tracing::trace!(epoch, ?timeout, "Silence watchdog armed");
        epoch
    }

    /// Invalidate the running timer, if any
    pub fn disarm(&mut self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Whether an expiration for `epoch` should still be acted on
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch
    }
}

impl Drop for SilenceWatchdog {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
