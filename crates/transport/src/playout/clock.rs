//! Monotonic clocks for the pacing loop

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Below this the wait spins instead of sleeping
const SPIN_THRESHOLD: Duration = Duration::from_micros(200);

/// Sleep margin left for the final fine-grained wait
const SLEEP_MARGIN: Duration = Duration::from_millis(1);

/// Time source and wait primitive used by the pacing loop
pub trait PacingClock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Block the calling thread until `deadline`
    fn sleep_until(&self, deadline: Instant);
}

/// Wall clock with a hybrid sleep/yield/spin wait
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl PacingClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let remaining = deadline - now;
            if remaining > SLEEP_MARGIN * 2 {
                std::thread::sleep(remaining - SLEEP_MARGIN);
            } else if remaining > SPIN_THRESHOLD {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// Manually driven clock for deterministic tests
///
/// `sleep_until` jumps straight to the deadline plus a configurable
/// oversleep, so a pacing loop runs as fast as the CPU allows.
#[derive(Debug)]
pub struct VirtualClock {
    origin: Instant,
    offset_nanos: AtomicU64,
    oversleep_nanos: u64,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::with_oversleep(Duration::ZERO)
    }

    /// Every wait overshoots its deadline by `oversleep`
    pub fn with_oversleep(oversleep: Duration) -> Self {
        Self {
            origin: Instant::now(),
            offset_nanos: AtomicU64::new(0),
            oversleep_nanos: oversleep.as_nanos() as u64,
        }
    }

    /// Time elapsed since the clock was created
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::Acquire))
    }

    /// Jump forward, simulating a stall
    pub fn advance(&self, by: Duration) {
        self.offset_nanos
            .fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PacingClock for VirtualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep_until(&self, deadline: Instant) {
        let target = deadline.saturating_duration_since(self.origin).as_nanos() as u64
            + self.oversleep_nanos;
        self.offset_nanos.fetch_max(target, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_waits_until_deadline() {
        let clock = SystemClock;
        let deadline = clock.now() + Duration::from_millis(5);
        clock.sleep_until(deadline);
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_virtual_clock_jumps_to_deadline() {
        let clock = VirtualClock::with_oversleep(Duration::from_millis(1));
        let deadline = clock.now() + Duration::from_millis(20);
        clock.sleep_until(deadline);
        assert_eq!(clock.elapsed(), Duration::from_millis(21));

        // never moves backwards
        clock.sleep_until(deadline - Duration::from_millis(10));
        assert_eq!(clock.elapsed(), Duration::from_millis(21));

        clock.advance(Duration::from_millis(100));
        assert_eq!(clock.elapsed(), Duration::from_millis(121));
    }
}
