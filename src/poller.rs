//! # Probe Poller
//!
//! Repeatedly invokes a probe (e.g. "read the ping-session-state DID") until the first
//! qualifying response arrives or the timeout expires.
//!
//! ## Polling Rules
//!
//! - Iterations inside the minimum settle window are skipped without calling the probe;
//!   a response that early could be a stale answer from before the reset.
//! - A probe returning `Ok(Some(_))` after the settle window is a qualifying response and
//!   ends polling immediately: the first success wins.
//! - `Ok(None)` is recorded as an empty response and polling continues.
//! - `Err(KpiError::Transport(_))` is recorded and retried. Any other error is fatal and
//!   propagated unchanged.
//! - The poll interval is slept between iterations regardless of the branch taken.

use crate::clock::SharedClock;
use crate::error::{KpiError, Result};
use crate::response_log::{KpiResponseLog, PollAttempt};
use crate::thresholds::TargetKind;
use crate::timeout::TimeoutCondition;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timing parameters of a polling run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub minimum_settle_time: Duration,
    pub timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: crate::defaults::POLL_INTERVAL,
            minimum_settle_time: crate::defaults::MINIMUM_SETTLE_TIME,
            timeout: crate::defaults::DLT_WAIT_TIMEOUT,
        }
    }
}

impl PollerConfig {
    pub fn new(
        poll_interval: Duration,
        minimum_settle_time: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let config = Self {
            poll_interval,
            minimum_settle_time,
            timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Default interval and settle time with the UDS timeout of `target`
    pub fn for_target(target: TargetKind) -> Self {
        Self {
            timeout: target.thresholds().uds_request_timeout,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(KpiError::config("poll_interval must be greater than zero"));
        }
        if self.timeout.is_zero() {
            return Err(KpiError::config("timeout must be greater than zero"));
        }
        if self.minimum_settle_time >= self.timeout {
            return Err(KpiError::config(format!(
                "minimum_settle_time ({:?}) must be shorter than timeout ({:?})",
                self.minimum_settle_time, self.timeout
            )));
        }
        Ok(())
    }
}

/// Outcome of a polling run: the full attempt log plus the qualifying response, if any
#[derive(Debug, Clone)]
pub struct PollReport<P> {
    pub log: KpiResponseLog<P>,
    /// Elapsed time of the qualifying response
    pub qualified_at: Option<Duration>,
    /// Budget of the countdown the run was measured against
    pub timeout: Duration,
}

impl<P: Debug> PollReport<P> {
    pub fn is_success(&self) -> bool {
        self.qualified_at.is_some()
    }

    /// Payload of the qualifying response
    pub fn payload(&self) -> Option<&P> {
        self.qualified_at
            .and_then(|_| self.log.last())
            .and_then(|attempt| attempt.payload.as_ref())
    }

    /// Elapsed time of the qualifying response, or the narrative as a hard failure
    pub fn into_result(self) -> Result<(Duration, KpiResponseLog<P>)> {
        match self.qualified_at {
            Some(elapsed) => Ok((elapsed, self.log)),
            None => Err(KpiError::NoQualifyingResponse {
                timeout: self.timeout,
                narrative: self.log.render_failure_narrative(),
            }),
        }
    }
}

/// Fixed-interval poller bound to an explicit clock
#[derive(Debug, Clone)]
pub struct Poller {
    config: PollerConfig,
    clock: SharedClock,
}

impl Poller {
    pub fn new(config: PollerConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, clock })
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Poll `probe` against a fresh countdown of the configured timeout
    pub fn poll<P, F>(&self, probe: F) -> Result<PollReport<P>>
    where
        P: Debug,
        F: FnMut() -> Result<Option<P>>,
    {
        let condition = TimeoutCondition::new(self.config.timeout, self.clock.clone());
        self.poll_within(&condition, probe)
    }

    /// Poll `probe` against an existing countdown
    ///
    /// Used when several measurements share one start instant, e.g. UDS availability
    /// and network reachability both timed from the same ECU reset.
    pub fn poll_within<P, F>(&self, condition: &TimeoutCondition, mut probe: F) -> Result<PollReport<P>>
    where
        P: Debug,
        F: FnMut() -> Result<Option<P>>,
    {
        let mut log = KpiResponseLog::new();

        while condition.is_active() {
            let elapsed = condition.time_elapsed();
            if elapsed < self.config.minimum_settle_time {
                debug!(
                    "Skipping probe at {:.3}s, inside minimum settle time of {:.3}s",
                    elapsed.as_secs_f64(),
                    self.config.minimum_settle_time.as_secs_f64()
                );
                self.clock.sleep(self.config.poll_interval);
                continue;
            }

            match probe() {
                Ok(payload) => {
                    let timestamp = condition.time_elapsed();
                    let qualifying = payload.is_some();
                    log.push(PollAttempt::response(payload, timestamp));
                    if qualifying {
                        info!("Qualifying response after {:.3}s", timestamp.as_secs_f64());
                        return Ok(PollReport {
                            log,
                            qualified_at: Some(timestamp),
                            timeout: condition.total(),
                        });
                    }
                    debug!("Empty response at {:.3}s", timestamp.as_secs_f64());
                }
                Err(KpiError::Transport(fault)) => {
                    let timestamp = condition.time_elapsed();
                    debug!(
                        "No response at {:.3}s: {}",
                        timestamp.as_secs_f64(),
                        fault
                    );
                    log.push(PollAttempt::failure(fault.to_string(), timestamp));
                }
                Err(other) => return Err(other),
            }

            self.clock.sleep(self.config.poll_interval);
        }

        warn!(
            "No qualifying response within {:.3}s ({} attempts)",
            condition.total().as_secs_f64(),
            log.len()
        );
        Ok(PollReport {
            log,
            qualified_at: None,
            timeout: condition.total(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::error::TransportFault;

    fn poller(clock: &ManualClock, interval: u64, settle: u64, timeout: u64) -> Poller {
        let config = PollerConfig::new(
            Duration::from_secs(interval),
            Duration::from_secs(settle),
            Duration::from_secs(timeout),
        )
        .unwrap();
        Poller::new(config, clock.shared()).unwrap()
    }

    #[test]
    fn test_first_success_wins() {
        let clock = ManualClock::new();
        let poller = poller(&clock, 1, 0, 30);
        let mut script: std::vec::IntoIter<Result<Option<&str>>> = vec![
            Err(TransportFault::ConnectionReset("peer".into()).into()),
            Err(TransportFault::EndOfFile.into()),
            Ok(Some("X")),
            Ok(Some("Y")),
        ]
        .into_iter();
        let mut calls = 0;

        let report = poller
            .poll(|| {
                calls += 1;
                script.next().expect("probe called too often")
            })
            .unwrap();

        assert_eq!(calls, 3);
        assert_eq!(report.payload(), Some(&"X"));
        assert_eq!(report.log.len(), 3);
        assert_eq!(report.qualified_at, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_settle_time_suppresses_early_success() {
        let clock = ManualClock::new();
        let poller = poller(&clock, 1, 5, 30);
        let probe_clock = clock.clone();
        let mut first_call_at = None;

        let report = poller
            .poll(|| {
                first_call_at.get_or_insert(probe_clock.now());
                Ok(Some(()))
            })
            .unwrap();

        assert_eq!(first_call_at, Some(Duration::from_secs(5)));
        assert!(report.qualified_at.unwrap() >= Duration::from_secs(5));
        assert_eq!(report.log.len(), 1);
    }

    #[test]
    fn test_transport_faults_until_timeout() {
        let clock = ManualClock::new();
        let poller = poller(&clock, 1, 2, 5);

        let report = poller
            .poll(|| -> Result<Option<u8>> {
                Err(TransportFault::ConnectionReset("Connection reset by peer".into()).into())
            })
            .unwrap();

        assert!(!report.is_success());
        let stamps: Vec<u64> = report
            .log
            .attempts()
            .iter()
            .map(|a| a.timestamp.as_secs())
            .collect();
        assert_eq!(stamps, vec![2, 3, 4]);
        assert!(report
            .log
            .attempts()
            .iter()
            .all(|a| a.payload.is_none() && a.error.is_some()));

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, KpiError::NoQualifyingResponse { .. }));
        assert!(err.to_string().contains("Probe attempts: 3"));
    }

    #[test]
    fn test_empty_responses_keep_polling() {
        let clock = ManualClock::new();
        let poller = poller(&clock, 1, 0, 10);
        let mut answers = vec![None, None, Some(42u16)].into_iter();

        let report = poller.poll(|| Ok(answers.next().flatten())).unwrap();

        assert_eq!(report.payload(), Some(&42));
        assert_eq!(report.log.len(), 3);
        assert!(report.log.attempts()[0].error.is_none());
    }

    #[test]
    fn test_non_transport_error_is_fatal() {
        let clock = ManualClock::new();
        let poller = poller(&clock, 1, 0, 10);
        let mut calls = 0;

        let result = poller.poll(|| -> Result<Option<u8>> {
            calls += 1;
            Err(KpiError::config("probe misconfigured"))
        });

        assert!(matches!(result, Err(KpiError::Configuration(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_shared_countdown() {
        let clock = ManualClock::new();
        let poller = poller(&clock, 1, 0, 10);
        let condition = TimeoutCondition::new(Duration::from_secs(4), clock.shared());
        clock.advance(Duration::from_secs(3));

        let report = poller.poll_within(&condition, || Ok(Some(true))).unwrap();
        assert_eq!(report.qualified_at, Some(Duration::from_secs(3)));
        assert_eq!(report.timeout, Duration::from_secs(4));
    }

    #[test]
    fn test_config_validation() {
        assert!(PollerConfig::new(Duration::ZERO, Duration::ZERO, Duration::from_secs(1)).is_err());
        assert!(PollerConfig::new(Duration::from_secs(1), Duration::ZERO, Duration::ZERO).is_err());
        assert!(PollerConfig::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(5)
        )
        .is_err());
        assert_eq!(
            PollerConfig::for_target(TargetKind::Bmt).timeout,
            Duration::from_secs(10)
        );
    }
}
