//! # Time Sources
//!
//! All waiting in the core goes through a [`Clock`]. Production code uses
//! [`SystemClock`], which is backed by the monotonic `Instant` and blocks the calling
//! thread. Tests use [`ManualClock`], where `sleep` simply advances simulated time,
//! so a 120 second boot-KPI wait runs instantly and deterministically.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source with a blocking sleep
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time elapsed since the clock's origin; never decreases
    fn now(&self) -> Duration;

    /// Block (or, for simulated clocks, advance) for `duration`
    fn sleep(&self, duration: Duration);
}

/// Shared handle to a clock, passed explicitly to every waiting component
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time source backed by `std::time::Instant`
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Convenience constructor returning a shared handle
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Simulated clock: time only moves when someone sleeps or advances it
///
/// Clones share the same underlying time, so a probe closure holding one clone can
/// simulate request latency that the poller holding another clone observes.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock whose current time is already `start`
    pub fn starting_at(start: Duration) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move simulated time forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Shared handle to this clock
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
