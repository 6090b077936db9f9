//! # Multi-Filter Correlator
//!
//! Extracts a set of expected milestones from one continuous pass over a trace stream.
//!
//! ## Ordered Mode
//!
//! A single cursor walks the filter list. Each incoming record is tested against the
//! current filter only; it is never matched against earlier or later filters. Once the
//! current filter has its `count` matches the cursor advances. A milestone that shows up
//! before its predecessor is therefore reported missing rather than silently reordered.
//! `count == 0` (collect until the timeout) is only valid on the last filter.
//!
//! ## Unordered Mode
//!
//! Every record is tested against every filter that still needs matches and is assigned
//! to each one it satisfies. Used to collect all KPI markers emitted during one boot.
//!
//! The overall timeout passed to [`MultiFilterCorrelator::correlate`] bounds the pass;
//! per-filter timeouts are not consulted here.

use crate::clock::SharedClock;
use crate::error::{KpiError, Result};
use crate::filter::FilterSpec;
use crate::timeout::TimeoutCondition;
use crate::trace::{ChannelFilter, LogRecord, TraceBroker, TraceStream};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationMode {
    /// Filters must be satisfied in declaration order
    #[default]
    Ordered,
    /// Filters are satisfied independently of each other
    Unordered,
}

impl std::fmt::Display for CorrelationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrelationMode::Ordered => write!(f, "ordered"),
            CorrelationMode::Unordered => write!(f, "unordered"),
        }
    }
}

/// Records assigned to one filter
#[derive(Debug, Clone, Serialize)]
pub struct FilterMatch {
    pub name: String,
    pub pattern: String,
    pub required: usize,
    pub records: Vec<LogRecord>,
    /// Non-matching records seen while this filter was active (only when not dropped)
    pub retained: Vec<LogRecord>,
}

impl FilterMatch {
    fn new(spec: &FilterSpec) -> Self {
        Self {
            name: spec.name().to_string(),
            pattern: spec.to_string(),
            required: spec.count(),
            records: Vec::new(),
            retained: Vec::new(),
        }
    }

    /// Counted filters need their full count; collect-all filters need one record
    pub fn is_satisfied(&self) -> bool {
        self.records.len() >= self.required.max(1)
    }

    fn needs_more(&self) -> bool {
        self.required == 0 || self.records.len() < self.required
    }

    pub fn first(&self) -> Option<&LogRecord> {
        self.records.first()
    }
}

/// Per-filter buckets in the original filter order
#[derive(Debug, Clone, Serialize)]
pub struct CorrelationResult {
    pub mode: CorrelationMode,
    pub entries: Vec<FilterMatch>,
    pub elapsed: Duration,
    pub scanned: usize,
}

impl CorrelationResult {
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(FilterMatch::is_satisfied)
    }

    pub fn unmatched(&self) -> Vec<&FilterMatch> {
        self.entries.iter().filter(|e| !e.is_satisfied()).collect()
    }

    pub fn get(&self, index: usize) -> Option<&FilterMatch> {
        self.entries.get(index)
    }

    /// Entry whose label (or pattern) is `name`
    pub fn by_name(&self, name: &str) -> Option<&FilterMatch> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Every assigned record, in filter order
    pub fn all_records(&self) -> impl Iterator<Item = &LogRecord> {
        self.entries.iter().flat_map(|e| e.records.iter())
    }

    /// Turn any unsatisfied filter into a timeout naming the unmatched patterns
    pub fn require_complete(self) -> Result<Self> {
        if self.is_complete() {
            return Ok(self);
        }
        let unmatched = self.unmatched();
        let observed = unmatched
            .iter()
            .flat_map(|e| e.retained.iter())
            .map(|r| r.to_string())
            .collect();
        Err(KpiError::TimeoutExceeded {
            patterns: unmatched.iter().map(|e| e.pattern.clone()).collect(),
            elapsed: self.elapsed,
            found: self.entries.len() - unmatched.len(),
            required: self.entries.len(),
            observed,
        })
    }
}

/// Union of broker-level criteria for `filters`; empty (everything) if any filter is
/// unconstrained
pub fn subscription_criteria(filters: &[FilterSpec]) -> Vec<ChannelFilter> {
    let mut criteria = BTreeSet::new();
    for filter in filters {
        match filter.channel_filter() {
            Some(channel) => {
                criteria.insert(channel);
            }
            None => return Vec::new(),
        }
    }
    criteria.into_iter().collect()
}

/// Correlates an ordered or unordered list of filters against one stream
#[derive(Debug, Clone)]
pub struct MultiFilterCorrelator {
    clock: SharedClock,
    mode: CorrelationMode,
    raise_on_incomplete: bool,
}

impl MultiFilterCorrelator {
    pub fn new(clock: SharedClock, mode: CorrelationMode) -> Self {
        Self {
            clock,
            mode,
            raise_on_incomplete: false,
        }
    }

    /// Fail with [`KpiError::TimeoutExceeded`] instead of returning a partial result
    pub fn raise_on_incomplete(mut self, raise: bool) -> Self {
        self.raise_on_incomplete = raise;
        self
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    pub fn validate(&self, filters: &[FilterSpec]) -> Result<()> {
        if filters.is_empty() {
            return Err(KpiError::config("correlation needs at least one filter"));
        }
        if self.mode == CorrelationMode::Ordered {
            let last = filters.len() - 1;
            if let Some((index, spec)) = filters
                .iter()
                .enumerate()
                .find(|(i, f)| *i < last && f.collects_all())
            {
                return Err(KpiError::config(format!(
                    "filter #{} ({}) collects until the timeout, which would block every later filter",
                    index + 1,
                    spec
                )));
            }
        }
        Ok(())
    }

    /// Subscribe with the union of the filters' channels, correlate, and release the stream
    pub fn subscribe_and_correlate<B: TraceBroker>(
        &self,
        broker: &B,
        filters: &[FilterSpec],
        timeout: Duration,
    ) -> Result<CorrelationResult> {
        self.validate(filters)?;
        let mut stream = broker.subscribe(&subscription_criteria(filters))?;
        self.correlate(&mut stream, filters, timeout)
    }

    pub fn correlate<S: TraceStream>(
        &self,
        stream: &mut S,
        filters: &[FilterSpec],
        timeout: Duration,
    ) -> Result<CorrelationResult> {
        self.validate(filters)?;
        let condition = TimeoutCondition::new(timeout, self.clock.clone());
        let mut result = CorrelationResult {
            mode: self.mode,
            entries: filters.iter().map(FilterMatch::new).collect(),
            elapsed: Duration::ZERO,
            scanned: 0,
        };

        match self.mode {
            CorrelationMode::Ordered => self.run_ordered(stream, filters, &condition, &mut result),
            CorrelationMode::Unordered => self.run_unordered(stream, filters, &condition, &mut result),
        }
        result.elapsed = condition.time_elapsed();

        if result.is_complete() {
            info!(
                "All {} filter(s) matched after {:.3}s ({} records scanned)",
                filters.len(),
                result.elapsed.as_secs_f64(),
                result.scanned
            );
        } else {
            for entry in result.unmatched() {
                warn!(
                    "Missing expected log line {} ({} of {} match(es))",
                    entry.pattern,
                    entry.records.len(),
                    entry.required.max(1)
                );
            }
            if self.raise_on_incomplete {
                return result.require_complete();
            }
        }
        Ok(result)
    }

    fn run_ordered<S: TraceStream>(
        &self,
        stream: &mut S,
        filters: &[FilterSpec],
        condition: &TimeoutCondition,
        result: &mut CorrelationResult,
    ) {
        let mut cursor = 0;
        let mut last_timestamp = f64::NEG_INFINITY;

        while cursor < filters.len() && condition.is_active() {
            let Some(record) = stream.next_available(condition.remaining()) else {
                if stream.is_exhausted() {
                    break;
                }
                continue;
            };
            result.scanned += 1;

            let filter = &filters[cursor];
            let entry = &mut result.entries[cursor];
            if !filter.matches(&record) {
                if !filter.drops_non_matching() {
                    entry.retained.push(record);
                }
                continue;
            }

            if record.timestamp < last_timestamp {
                warn!(
                    "Record for {} at {:.6} precedes the previous milestone at {:.6}",
                    filter, record.timestamp, last_timestamp
                );
            }
            last_timestamp = record.timestamp;
            entry.records.push(record);

            if !entry.needs_more() {
                debug!(
                    "Filter #{} {} satisfied after {:.3}s",
                    cursor + 1,
                    filter,
                    condition.elapsed_secs()
                );
                cursor += 1;
            }
        }
    }

    fn run_unordered<S: TraceStream>(
        &self,
        stream: &mut S,
        filters: &[FilterSpec],
        condition: &TimeoutCondition,
        result: &mut CorrelationResult,
    ) {
        let collects_all = filters.iter().any(FilterSpec::collects_all);

        while condition.is_active() {
            if !collects_all && result.entries.iter().all(|e| !e.needs_more()) {
                break;
            }
            let Some(record) = stream.next_available(condition.remaining()) else {
                if stream.is_exhausted() {
                    break;
                }
                continue;
            };
            result.scanned += 1;

            for (index, (filter, entry)) in filters.iter().zip(result.entries.iter_mut()).enumerate() {
                if !entry.needs_more() {
                    continue;
                }
                if filter.matches(&record) {
                    debug!(
                        "Filter #{} {} matched at {:.6}",
                        index + 1,
                        filter,
                        record.timestamp
                    );
                    entry.records.push(record.clone());
                } else if !filter.drops_non_matching() {
                    entry.retained.push(record.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::trace::{Pacing, ReplayBroker};

    fn replay(clock: &ManualClock, payloads: &[&str]) -> ReplayBroker {
        let records = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| LogRecord::new(i as f64 + 1.0, "SYS", "BOOT", *p))
            .collect();
        ReplayBroker::from_records(records, Pacing::Realtime, clock.shared())
    }

    fn filter(pattern: &str) -> FilterSpec {
        FilterSpec::new(pattern).unwrap()
    }

    #[test]
    fn test_ordered_sequence_succeeds() {
        let clock = ManualClock::new();
        let broker = replay(&clock, &["noise", "STEP1 done", "STEP2 done"]);
        let correlator = MultiFilterCorrelator::new(clock.shared(), CorrelationMode::Ordered);

        let result = correlator
            .subscribe_and_correlate(
                &broker,
                &[filter("STEP1"), filter("STEP2")],
                Duration::from_secs(10),
            )
            .unwrap();

        assert!(result.is_complete());
        assert_eq!(result.entries[0].records[0].payload, "STEP1 done");
        assert_eq!(result.entries[1].records[0].payload, "STEP2 done");
        assert_eq!(result.scanned, 3);
    }

    #[test]
    fn test_out_of_order_lines_leave_first_filter_unmatched() {
        let clock = ManualClock::new();
        let broker = replay(&clock, &["B happened", "A happened"]);
        let correlator = MultiFilterCorrelator::new(clock.shared(), CorrelationMode::Ordered);
        let filters = [filter("^A"), filter("^B").with_drop(false)];

        let result = correlator
            .subscribe_and_correlate(&broker, &filters, Duration::from_secs(5))
            .unwrap();

        assert!(!result.is_complete());
        assert_eq!(result.entries[0].records[0].payload, "A happened");
        assert!(result.entries[1].records.is_empty());

        let err = result.require_complete().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("'^B'"));
        assert!(!text.contains("'^A'"));
    }

    #[test]
    fn test_first_filter_reported_missing_when_its_line_comes_late() {
        let clock = ManualClock::new();
        let broker = replay(&clock, &["B happened"]);
        let correlator = MultiFilterCorrelator::new(clock.shared(), CorrelationMode::Ordered)
            .raise_on_incomplete(true);
        let filters = [filter("^A").with_drop(false), filter("^B")];

        let err = correlator
            .subscribe_and_correlate(&broker, &filters, Duration::from_secs(5))
            .unwrap_err();
        match err {
            KpiError::TimeoutExceeded {
                patterns, observed, ..
            } => {
                assert_eq!(patterns, vec!["'^A'".to_string(), "'^B'".to_string()]);
                assert_eq!(observed.len(), 1);
                assert!(observed[0].ends_with("B happened"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_single_cursor_does_not_look_ahead() {
        let clock = ManualClock::new();
        let broker = replay(&clock, &["STEP start", "STEP start"]);
        let correlator = MultiFilterCorrelator::new(clock.shared(), CorrelationMode::Ordered);

        let result = correlator
            .subscribe_and_correlate(
                &broker,
                &[filter("STEP"), filter("start")],
                Duration::from_secs(5),
            )
            .unwrap();
        assert_eq!(result.entries[0].records[0].timestamp, 1.0);
        assert_eq!(result.entries[1].records[0].timestamp, 2.0);
    }

    #[test]
    fn test_counted_filter_collects_before_advancing() {
        let clock = ManualClock::new();
        let broker = replay(&clock, &["tick", "tock", "tick", "done"]);
        let correlator = MultiFilterCorrelator::new(clock.shared(), CorrelationMode::Ordered);

        let result = correlator
            .subscribe_and_correlate(
                &broker,
                &[filter("tick").with_count(2), filter("done")],
                Duration::from_secs(10),
            )
            .unwrap();
        assert!(result.is_complete());
        assert_eq!(result.entries[0].records.len(), 2);
    }

    #[test]
    fn test_collect_all_only_last_in_ordered_mode() {
        let clock = ManualClock::new();
        let correlator = MultiFilterCorrelator::new(clock.shared(), CorrelationMode::Ordered);
        let invalid = [filter("a").with_count(0), filter("b")];
        assert!(matches!(
            correlator.validate(&invalid),
            Err(KpiError::Configuration(_))
        ));
        assert!(correlator.validate(&[filter("a"), filter("b").with_count(0)]).is_ok());
        assert!(correlator.validate(&[]).is_err());
    }

    #[test]
    fn test_unordered_assigns_each_filter_independently() {
        let clock = ManualClock::new();
        let broker = replay(&clock, &["B ready", "noise", "A ready", "A again"]);
        let correlator = MultiFilterCorrelator::new(clock.shared(), CorrelationMode::Unordered);

        let result = correlator
            .subscribe_and_correlate(
                &broker,
                &[filter("^A").with_label("a"), filter("^B").with_label("b")],
                Duration::from_secs(10),
            )
            .unwrap();

        assert!(result.is_complete());
        assert_eq!(result.by_name("a").unwrap().records[0].payload, "A ready");
        assert_eq!(result.by_name("b").unwrap().records[0].payload, "B ready");
        assert_eq!(result.scanned, 3);
    }

    #[test]
    fn test_unordered_record_can_satisfy_several_filters() {
        let clock = ManualClock::new();
        let broker = replay(&clock, &["kernel and userspace up"]);
        let correlator = MultiFilterCorrelator::new(clock.shared(), CorrelationMode::Unordered);

        let result = correlator
            .subscribe_and_correlate(
                &broker,
                &[filter("kernel"), filter("userspace")],
                Duration::from_secs(10),
            )
            .unwrap();
        assert!(result.is_complete());
        assert_eq!(result.all_records().count(), 2);
    }

    #[test]
    fn test_subscription_criteria_union() {
        let filters = [
            filter("a").with_channel("SYS", "BOOT"),
            filter("b").with_channel("NSM", "LCM"),
            filter("c").with_channel("SYS", "BOOT"),
        ];
        assert_eq!(subscription_criteria(&filters).len(), 2);

        let mixed = [filter("a").with_channel("SYS", "BOOT"), filter("b")];
        assert!(subscription_criteria(&mixed).is_empty());
    }
}
