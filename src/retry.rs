//! Explicit retry policy value.
//!
//! Instead of decorating functions with a retry annotation, callers hold a
//! [`RetryPolicy`] and pass it to the operation, so the policy is visible at the call
//! site and can be tested on its own.

use crate::clock::SharedClock;
use crate::error::{KpiError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Maximum attempts and fixed backoff between them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::defaults::RETRY_COUNT,
            backoff: crate::defaults::RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Result<Self> {
        let policy = Self {
            max_attempts,
            backoff,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// A policy that runs the operation exactly once
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(KpiError::config("retry policy needs at least one attempt"));
        }
        Ok(())
    }

    /// Run `op`, retrying while `is_retryable` accepts the error and attempts remain
    ///
    /// The backoff is slept on `clock` between attempts. When attempts run out the last
    /// error is returned unchanged; non-retryable errors are returned immediately.
    pub fn run<T, E, F, P>(&self, clock: &SharedClock, mut op: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && is_retryable(&err) => {
                    debug!(
                        "Attempt {}/{} failed, retrying in {:?}: {}",
                        attempt, attempts, self.backoff, err
                    );
                    clock.sleep(self.backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
