//! Time source for bounded waits and elapsed-time checks.
//!
//! Hardware sessions use [`SystemClock`]. Simulated sessions share a
//! [`ManualClock`] between the bench and the simulated driver, so that
//! a ten-second collection window runs as fast as the host can compute it.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source with a blocking sleep.
pub trait Clock: Send + Sync {
    /// Time elapsed since this clock's epoch
    fn now(&self) -> Duration;

    /// Block for `dt`
    fn sleep(&self, dt: Duration);

    /// Time elapsed since an earlier reading of `now()`
    fn since(&self, start: Duration) -> Duration {
        self.now().saturating_sub(start)
    }
}

/// Wall clock based on `Instant`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, dt: Duration) {
        std::thread::sleep(dt);
    }
}

/// Clock that only moves when slept on.
///
/// Clones share the same time, which is how a simulated driver and
/// the session driving it stay in step.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    ns: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward without sleeping.
    pub fn advance(&self, dt: Duration) {
        let ns = u64::try_from(dt.as_nanos()).unwrap_or(u64::MAX);
        self.ns.fetch_add(ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.ns.load(Ordering::SeqCst))
    }

    fn sleep(&self, dt: Duration) {
        self.advance(dt);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn manual_clock_is_shared() {
        let a = ManualClock::new();
        let b = a.clone();
        a.sleep(Duration::from_millis(3));
        b.advance(Duration::from_micros(500));
        assert_eq!(a.now(), Duration::from_micros(3500));
        assert_eq!(b.since(Duration::from_millis(1)), Duration::from_micros(2500));
    }

    #[test]
    fn system_clock_moves_forward() {
        let c = SystemClock::new();
        let t0 = c.now();
        c.sleep(Duration::from_millis(1));
        assert!(c.since(t0) >= Duration::from_millis(1));
    }
}
