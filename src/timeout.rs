//! Restartable countdown used as the loop guard of every wait in the core.

use crate::clock::SharedClock;
use std::fmt;
use std::time::Duration;

/// A countdown over a fixed budget, read through an explicit clock
///
/// `TimeoutCondition` is the Rust counterpart of the `while condition:` loop guard:
/// callers check [`is_active`](Self::is_active) once per iteration and use
/// [`time_elapsed`](Self::time_elapsed) as the timestamp source for KPI values.
#[derive(Clone)]
pub struct TimeoutCondition {
    total: Duration,
    start: Duration,
    clock: SharedClock,
}

impl TimeoutCondition {
    /// Start a countdown of `total` on `clock`
    ///
    /// A zero budget is expired immediately.
    pub fn new(total: Duration, clock: SharedClock) -> Self {
        let start = clock.now();
        Self {
            total,
            start,
            clock,
        }
    }

    /// The budget this condition was created with
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Time elapsed since construction (or the last reset)
    ///
    /// Monotonically non-decreasing and never negative.
    pub fn time_elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.start)
    }

    /// Elapsed time in seconds, the unit KPI values are reported in
    pub fn elapsed_secs(&self) -> f64 {
        self.time_elapsed().as_secs_f64()
    }

    /// Budget left before expiry (zero once expired)
    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.time_elapsed())
    }

    pub fn expired(&self) -> bool {
        self.time_elapsed() >= self.total
    }

    /// `true` while budget remains; the loop-guard form of `!expired()`
    pub fn is_active(&self) -> bool {
        !self.expired()
    }

    /// Restart the countdown from the clock's current time
    pub fn reset(&mut self) {
        self.start = self.clock.now();
    }

    /// The clock this condition reads from
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

impl fmt::Debug for TimeoutCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutCondition")
            .field("total", &self.total)
            .field("time_elapsed", &self.time_elapsed())
            .field("expired", &self.expired())
            .finish()
    }
}
