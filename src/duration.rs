//! # Duration Metrics
//!
//! A [`DurationMetric`] pairs two named milestones and reports `end - start` in seconds.
//! It never falls back to a default timestamp: asking for the duration before both
//! events were captured is a [`KpiError::MissingEvent`].

use crate::correlator::CorrelationResult;
use crate::error::{KpiError, Result};
use crate::filter::FilterSpec;
use crate::metrics::{MetricRecord, MetricsSink};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Captured timestamps keyed by event name (seconds)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTimestamps {
    events: BTreeMap<String, f64>,
}

impl EventTimestamps {
    pub fn new() -> Self {
        Self::default()
    }

    /// First matching record of every filter, keyed by the filter name
    ///
    /// The value is the pattern's numeric capture when it has one, otherwise the
    /// record's own timestamp. Filters without matches are left out.
    pub fn from_correlation(result: &CorrelationResult, filters: &[FilterSpec]) -> Self {
        let mut events = Self::new();
        for (entry, filter) in result.entries.iter().zip(filters) {
            if let Some(record) = entry.first() {
                let value = filter.captured_value(record).unwrap_or(record.timestamp);
                events.insert(&entry.name, value);
            }
        }
        events
    }

    pub fn insert(&mut self, name: &str, timestamp: f64) {
        self.events.insert(name.to_string(), timestamp);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.events.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.events.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.events.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Elapsed time between two named events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationMetric {
    pub name: String,
    pub start_event_name: String,
    pub end_event_name: String,
    pub start_timestamp: Option<f64>,
    pub end_timestamp: Option<f64>,
}

impl DurationMetric {
    pub fn new(
        name: impl Into<String>,
        start_event_name: impl Into<String>,
        end_event_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            start_event_name: start_event_name.into(),
            end_event_name: end_event_name.into(),
            start_timestamp: None,
            end_timestamp: None,
        }
    }

    pub fn set_start(&mut self, timestamp: f64) {
        self.start_timestamp = Some(timestamp);
    }

    pub fn set_end(&mut self, timestamp: f64) {
        self.end_timestamp = Some(timestamp);
    }

    /// Fill whichever of the two events `events` knows about
    pub fn observe(&mut self, events: &EventTimestamps) -> &mut Self {
        if let Some(ts) = events.get(&self.start_event_name) {
            self.start_timestamp = Some(ts);
        }
        if let Some(ts) = events.get(&self.end_event_name) {
            self.end_timestamp = Some(ts);
        }
        self
    }

    pub fn is_complete(&self) -> bool {
        self.start_timestamp.is_some() && self.end_timestamp.is_some()
    }

    /// `end - start` in seconds
    ///
    /// A negative duration (end observed before start) is returned as-is.
    pub fn duration(&self) -> Result<f64> {
        let start = self.start_timestamp.ok_or_else(|| self.missing(&self.start_event_name))?;
        let end = self.end_timestamp.ok_or_else(|| self.missing(&self.end_event_name))?;
        let duration = end - start;
        if duration < 0.0 {
            warn!(
                "{}: '{}' at {:.6} precedes '{}' at {:.6}",
                self.name, self.end_event_name, end, self.start_event_name, start
            );
        }
        Ok(duration)
    }

    /// Compute the duration and publish it under the metric name
    pub fn publish(&self, sink: &dyn MetricsSink) -> Result<f64> {
        let duration = self.duration()?;
        debug!("{} = {:.6}s", self.name, duration);
        sink.publish_record(&MetricRecord::plain(&self.name, duration));
        Ok(duration)
    }

    fn missing(&self, event: &str) -> KpiError {
        KpiError::MissingEvent {
            name: event.to_string(),
            metric: self.name.clone(),
        }
    }
}
