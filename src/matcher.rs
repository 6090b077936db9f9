//! # Single-Filter Trace Matcher
//!
//! Pulls records from a [`TraceStream`] until a [`FilterSpec`] is satisfied or its
//! timeout elapses. An empty stream and a stream with only non-matching records resolve
//! through the same path: "no matches before timeout".

use crate::clock::SharedClock;
use crate::error::{KpiError, Result};
use crate::filter::FilterSpec;
use crate::timeout::TimeoutCondition;
use crate::trace::{LogRecord, TraceBroker, TraceStream};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Records collected by one wait
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchOutcome {
    /// Matching records in stream order
    pub matches: Vec<LogRecord>,
    /// Non-matching records, kept only when the filter does not drop them
    pub retained: Vec<LogRecord>,
    pub elapsed: Duration,
    /// Records pulled from the stream
    pub scanned: usize,
    /// The wait ended before the required count was reached
    pub timed_out: bool,
}

impl MatchOutcome {
    pub fn first(&self) -> Option<&LogRecord> {
        self.matches.first()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Blocking matcher bound to an explicit clock
#[derive(Debug, Clone)]
pub struct TraceMatcher {
    clock: SharedClock,
}

impl TraceMatcher {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    /// Subscribe for `spec` alone, wait, and release the subscription
    pub fn subscribe_and_wait<B: TraceBroker>(&self, broker: &B, spec: &FilterSpec) -> Result<MatchOutcome> {
        let criteria: Vec<_> = spec.channel_filter().into_iter().collect();
        let mut stream = broker.subscribe(&criteria)?;
        self.wait_for(&mut stream, spec)
    }

    /// Wait on `stream` according to `spec`
    pub fn wait_for<S: TraceStream>(&self, stream: &mut S, spec: &FilterSpec) -> Result<MatchOutcome> {
        let condition = TimeoutCondition::new(spec.timeout(), self.clock.clone());
        let required = spec.count();
        let mut outcome = MatchOutcome::default();

        while condition.is_active() {
            if required > 0 && outcome.matches.len() >= required {
                break;
            }
            match stream.next_available(condition.remaining()) {
                Some(record) => {
                    outcome.scanned += 1;
                    if spec.matches(&record) {
                        debug!("Matched {} at {:.6}: {}", spec, record.timestamp, record.payload);
                        outcome.matches.push(record);
                    } else if !spec.drops_non_matching() {
                        outcome.retained.push(record);
                    }
                }
                None if stream.is_exhausted() => {
                    debug!("Trace stream exhausted while waiting for {}", spec);
                    break;
                }
                None => {}
            }
        }
        outcome.elapsed = condition.time_elapsed();

        if required == 0 {
            debug!(
                "Collected {} match(es) for {} in {:.3}s",
                outcome.matches.len(),
                spec,
                outcome.elapsed.as_secs_f64()
            );
            if outcome.matches.is_empty() && spec.raises_on_empty() {
                warn!("No record matched {} within {:.3}s", spec, outcome.elapsed.as_secs_f64());
                return Err(timeout_error(spec, &outcome, 1));
            }
            return Ok(outcome);
        }

        if outcome.matches.len() < required {
            outcome.timed_out = true;
            warn!(
                "Found {} of {} match(es) for {} within {:.3}s",
                outcome.matches.len(),
                required,
                spec,
                outcome.elapsed.as_secs_f64()
            );
            if spec.raises_on_timeout() {
                return Err(timeout_error(spec, &outcome, required));
            }
        }
        Ok(outcome)
    }
}

fn timeout_error(spec: &FilterSpec, outcome: &MatchOutcome, required: usize) -> KpiError {
    KpiError::TimeoutExceeded {
        patterns: vec![spec.to_string()],
        elapsed: outcome.elapsed,
        found: outcome.matches.len(),
        required,
        observed: outcome.retained.iter().map(|r| r.to_string()).collect(),
    }
}
