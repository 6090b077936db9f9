//! # KPI Response Log
//!
//! Append-only ledger of every probe attempt made by a [`Poller`](crate::poller::Poller)
//! run. Insertion order is chronological order and is part of the contract: the rendered
//! narrative is the audit trail quoted verbatim in assertion messages, so it is never
//! reordered or deduplicated.

use crate::error::{KpiError, Result};
use serde::Serialize;
use std::fmt::{self, Debug, Write as _};
use std::time::Duration;

/// Prefix of the first narrative line, followed by the attempt count
pub const NARRATIVE_HEADER: &str = "Probe attempts: ";

/// One probe invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollAttempt<P> {
    /// Probe result, `None` when the probe failed or answered with nothing
    pub payload: Option<P>,
    /// Elapsed time since the polling countdown started
    pub timestamp: Duration,
    /// Formatted transport fault, `None` on success
    pub error: Option<String>,
}

impl<P> PollAttempt<P> {
    pub fn response(payload: Option<P>, timestamp: Duration) -> Self {
        Self {
            payload,
            timestamp,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>, timestamp: Duration) -> Self {
        Self {
            payload: None,
            timestamp,
            error: Some(error.into()),
        }
    }

    /// A response with a payload
    pub fn is_valid(&self) -> bool {
        self.payload.is_some()
    }
}

/// Chronological list of [`PollAttempt`]s
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KpiResponseLog<P> {
    attempts: Vec<PollAttempt<P>>,
}

impl<P> Default for KpiResponseLog<P> {
    fn default() -> Self {
        Self {
            attempts: Vec::new(),
        }
    }
}

impl<P: Debug> KpiResponseLog<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, attempt: PollAttempt<P>) {
        self.attempts.push(attempt);
    }

    pub fn attempts(&self) -> &[PollAttempt<P>] {
        &self.attempts
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn last(&self) -> Option<&PollAttempt<P>> {
        self.attempts.last()
    }

    /// Most recent attempt carrying a payload
    pub fn last_valid_response(&self) -> Option<&PollAttempt<P>> {
        self.attempts.iter().rev().find(|attempt| attempt.is_valid())
    }

    /// Timestamp of the first attempt carrying a payload
    pub fn first_valid_response_timestamp(&self) -> Result<Duration> {
        self.attempts
            .iter()
            .find(|attempt| attempt.is_valid())
            .map(|attempt| attempt.timestamp)
            .ok_or_else(|| KpiError::NoQualifyingResponse {
                timeout: self.last().map(|a| a.timestamp).unwrap_or_default(),
                narrative: self.render_failure_narrative(),
            })
    }

    /// Deterministic description of every attempt, in insertion order
    pub fn render_failure_narrative(&self) -> String {
        let mut text = format!("{}{}", NARRATIVE_HEADER, self.attempts.len());
        if self.attempts.is_empty() {
            text.push_str("\n  (the probe was never invoked before the deadline)");
            return text;
        }
        for (index, attempt) in self.attempts.iter().enumerate() {
            let _ = write!(
                text,
                "\n  #{} at {:.3}s: ",
                index + 1,
                attempt.timestamp.as_secs_f64()
            );
            match (&attempt.payload, &attempt.error) {
                (Some(payload), _) => {
                    let _ = write!(text, "valid response {:?}", payload);
                }
                (None, Some(error)) => {
                    let _ = write!(text, "failed: {}", error);
                }
                (None, None) => text.push_str("empty response"),
            }
        }
        text
    }

    /// Require the last valid response to lie within `[min, max]`
    ///
    /// Returns its timestamp. Without any valid response the whole narrative is
    /// reported as [`KpiError::NoQualifyingResponse`] with `max` as the timeout.
    pub fn check_window(&self, min: Duration, max: Duration) -> Result<Duration> {
        match self.last_valid_response() {
            Some(attempt) if attempt.timestamp >= min && attempt.timestamp <= max => {
                Ok(attempt.timestamp)
            }
            Some(attempt) => Err(KpiError::OutsideWindow {
                value: attempt.timestamp,
                min,
                max,
                narrative: self.render_failure_narrative(),
            }),
            None => Err(KpiError::NoQualifyingResponse {
                timeout: max,
                narrative: self.render_failure_narrative(),
            }),
        }
    }
}

impl<P: Debug> fmt::Display for KpiResponseLog<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_failure_narrative())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_attempt_count(narrative: &str) -> usize {
        narrative
            .lines()
            .next()
            .and_then(|line| line.strip_prefix(NARRATIVE_HEADER))
            .and_then(|count| count.trim().parse().ok())
            .expect("narrative header")
    }

    fn sample_log() -> KpiResponseLog<u32> {
        let mut log = KpiResponseLog::new();
        log.push(PollAttempt::failure("connection reset: peer", Duration::from_secs(2)));
        log.push(PollAttempt::response(Some(7), Duration::from_secs(3)));
        log.push(PollAttempt::response(None, Duration::from_secs(4)));
        log.push(PollAttempt::response(Some(9), Duration::from_secs(5)));
        log
    }

    #[test]
    fn test_last_and_first_valid_response() {
        let log = sample_log();
        assert_eq!(log.last_valid_response().unwrap().payload, Some(9));
        assert_eq!(
            log.first_valid_response_timestamp().unwrap(),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_first_valid_response_fails_without_payloads() {
        let mut log: KpiResponseLog<u32> = KpiResponseLog::new();
        log.push(PollAttempt::failure("unexpected end of file", Duration::from_secs(2)));
        assert!(matches!(
            log.first_valid_response_timestamp(),
            Err(KpiError::NoQualifyingResponse { .. })
        ));
    }

    #[test]
    fn test_narrative_preserves_order_and_duplicates() {
        let mut log: KpiResponseLog<u32> = KpiResponseLog::new();
        log.push(PollAttempt::failure("same", Duration::from_secs(3)));
        log.push(PollAttempt::failure("same", Duration::from_secs(2)));
        let narrative = log.render_failure_narrative();
        let lines: Vec<&str> = narrative.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("#1 at 3.000s: failed: same"));
        assert!(lines[2].contains("#2 at 2.000s: failed: same"));
    }

    #[test]
    fn test_narrative_attempt_count_round_trips() {
        for count in [0usize, 1, 2, 17] {
            let mut log: KpiResponseLog<String> = KpiResponseLog::new();
            for i in 0..count {
                log.push(PollAttempt::failure(
                    format!("fault {}", i),
                    Duration::from_secs(i as u64),
                ));
            }
            assert_eq!(parse_attempt_count(&log.render_failure_narrative()), count);
        }
    }

    #[test]
    fn test_empty_narrative_is_distinct() {
        let log: KpiResponseLog<u8> = KpiResponseLog::new();
        let narrative = log.render_failure_narrative();
        assert!(narrative.contains("never invoked"));
        assert_eq!(narrative, log.to_string());
    }

    #[test]
    fn test_check_window() {
        let log = sample_log();
        assert_eq!(
            log.check_window(Duration::from_secs(2), Duration::from_secs(10))
                .unwrap(),
            Duration::from_secs(5)
        );

        let err = log
            .check_window(Duration::from_secs(2), Duration::from_secs(4))
            .unwrap_err();
        assert!(matches!(err, KpiError::OutsideWindow { .. }));
        assert!(err.to_string().contains("#4 at 5.000s"));

        let empty: KpiResponseLog<u8> = KpiResponseLog::new();
        assert!(matches!(
            empty.check_window(Duration::ZERO, Duration::from_secs(5)),
            Err(KpiError::NoQualifyingResponse { .. })
        ));
    }
}
