//! Start/end event pair detection.
//!
//! The end marker often depends on the start marker, e.g. "process `<pid>` exited" after
//! "process started with pid `<pid>`". The end pattern is therefore a template whose
//! `{name}` placeholders are filled from the named captures of the start record. Both
//! markers are searched on one subscription, so the end marker can only match after the
//! start marker.

use crate::clock::SharedClock;
use crate::duration::DurationMetric;
use crate::error::{KpiError, Result};
use crate::filter::FilterSpec;
use crate::matcher::TraceMatcher;
use crate::retry::RetryPolicy;
use crate::trace::{ChannelFilter, TraceBroker};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info};

/// Replace every `{name}` in `template` with the escaped capture of that name
pub fn fill_template(template: &str, captures: &HashMap<String, String>) -> Result<String> {
    let placeholder = Regex::new(r"\{(\w+)\}")
        .map_err(|e| KpiError::config(format!("placeholder pattern: {}", e)))?;

    let missing: BTreeSet<&str> = placeholder
        .captures_iter(template)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|name| !captures.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        return Err(KpiError::config(format!(
            "end pattern '{}' refers to capture(s) {:?} not present in the start pattern",
            template, missing
        )));
    }

    Ok(placeholder
        .replace_all(template, |c: &regex::Captures| {
            captures
                .get(&c[1])
                .map(|value| regex::escape(value))
                .unwrap_or_default()
        })
        .into_owned())
}

/// Detects a start marker, then the end marker derived from it
#[derive(Debug, Clone)]
pub struct EventPairDetector {
    name: String,
    start: FilterSpec,
    end_template: String,
    end_timeout: Duration,
    retry: RetryPolicy,
    clock: SharedClock,
}

impl EventPairDetector {
    pub fn new(
        name: impl Into<String>,
        start: FilterSpec,
        end_template: impl Into<String>,
        clock: SharedClock,
    ) -> Self {
        let end_timeout = start.timeout();
        Self {
            name: name.into(),
            start,
            end_template: end_template.into(),
            end_timeout,
            retry: RetryPolicy::default(),
            clock,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_end_timeout(mut self, timeout: Duration) -> Self {
        self.end_timeout = timeout;
        self
    }

    /// Wait for both markers, retrying the whole detection on timeouts
    pub fn detect<B: TraceBroker>(&self, broker: &B) -> Result<DurationMetric> {
        self.retry.validate()?;
        self.retry
            .run(&self.clock, |attempt| self.detect_once(broker, attempt), KpiError::is_timeout)
    }

    fn detect_once<B: TraceBroker>(&self, broker: &B, attempt: u32) -> Result<DurationMetric> {
        debug!("{}: detection attempt {}", self.name, attempt);
        let criteria: Vec<ChannelFilter> = self.start.channel_filter().into_iter().collect();
        let mut stream = broker.subscribe(&criteria)?;
        let matcher = TraceMatcher::new(self.clock.clone());

        let outcome = matcher.wait_for(&mut stream, &self.start)?;
        let start_record = outcome
            .matches
            .iter()
            .min_by(|a, b| a.timestamp.total_cmp(&b.timestamp))
            .ok_or_else(|| KpiError::TimeoutExceeded {
                patterns: vec![self.start.to_string()],
                elapsed: outcome.elapsed,
                found: 0,
                required: self.start.count().max(1),
                observed: Vec::new(),
            })?;

        let end_pattern = fill_template(&self.end_template, &self.start.named_captures(start_record))?;
        debug!("{}: waiting for end marker '{}'", self.name, end_pattern);
        let mut end = FilterSpec::new(&end_pattern)?.with_timeout(self.end_timeout);
        if let Some(app_id) = self.start.app_id() {
            end = end.with_app_id(app_id);
        }
        if let Some(context_id) = self.start.context_id() {
            end = end.with_context_id(context_id);
        }
        let end_outcome = matcher.wait_for(&mut stream, &end)?;

        let mut metric = DurationMetric::new(&self.name, self.start.name(), end.name());
        metric.set_start(start_record.timestamp);
        if let Some(record) = end_outcome.first() {
            metric.set_end(record.timestamp);
        }
        if let Ok(duration) = metric.duration() {
            info!("{}: {:.6}s between start and end markers", self.name, duration);
        }
        Ok(metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::trace::{LogRecord, ReplayBroker};

    fn broker(clock: &ManualClock, lines: &[(u64, &str)]) -> ReplayBroker {
        let mut broker = ReplayBroker::new(clock.shared());
        for (at, payload) in lines {
            broker.push_at(
                Duration::from_secs(*at),
                LogRecord::new(*at as f64, "SYS", "PROC", *payload),
            );
        }
        broker
    }

    #[test]
    fn test_fill_template_escapes_values() {
        let mut captures = HashMap::new();
        captures.insert("proc".to_string(), "a.b".to_string());
        assert_eq!(
            fill_template("{proc} exited", &captures).unwrap(),
            r"a\.b exited"
        );
        assert!(matches!(
            fill_template("{pid} exited", &captures),
            Err(KpiError::Configuration(_))
        ));
    }

    #[test]
    fn test_end_pattern_follows_start_captures() {
        let clock = ManualClock::new();
        let broker = broker(
            &clock,
            &[
                (1, "pid 7 started"),
                (2, "pid 9 started"),
                (3, "pid 9 exited"),
                (5, "pid 7 exited"),
            ],
        );
        let start = FilterSpec::new(r"pid (?P<pid>\d+) started")
            .unwrap()
            .with_timeout(Duration::from_secs(10));
        let detector = EventPairDetector::new("lifetime", start, r"pid {pid} exited", clock.shared())
            .with_retry(RetryPolicy::once());

        let metric = detector.detect(&broker).unwrap();
        assert_eq!(metric.start_timestamp, Some(1.0));
        assert_eq!(metric.end_timestamp, Some(5.0));
        assert_eq!(metric.duration().unwrap(), 4.0);
    }

    #[test]
    fn test_timeouts_are_retried() {
        let clock = ManualClock::new();
        let broker = broker(&clock, &[(1, "noise")]);
        let start = FilterSpec::new("never")
            .unwrap()
            .with_timeout(Duration::from_secs(2));
        let detector = EventPairDetector::new("m", start, "end", clock.shared())
            .with_retry(RetryPolicy::new(3, Duration::from_secs(1)).unwrap());

        let err = detector.detect(&broker).unwrap_err();
        assert!(err.is_timeout());
        // Three attempts of one second each, two backoffs in between
        assert_eq!(clock.now(), Duration::from_secs(5));
    }
}
