//! # KPI Catalog
//!
//! A catalog lists the log markers to collect during one boot and the durations derived
//! from pairs of them:
//!
//! ```json
//! {
//!   "collection_timeout_secs": 120,
//!   "kpis": [
//!     { "name": "kernel", "pattern": "Kernel started", "app_id": "SYS", "context_id": "BOOT" },
//!     { "name": "ui_ready", "metric": "UI ready", "pattern": "ready after ([0-9.]+)",
//!       "app_id": "HMI", "context_id": "MAIN", "capture": "regex_group" }
//!   ],
//!   "multi_markers": [
//!     { "name": "Kernel to UI", "start": "kernel", "end": "ui_ready" }
//!   ]
//! }
//! ```
//!
//! Only the first occurrence of a marker is used. Values are published with the
//! threshold of the active branch; markers that were never seen are reported missing.

use crate::correlator::CorrelationResult;
use crate::duration::{DurationMetric, EventTimestamps};
use crate::error::{KpiError, Result};
use crate::filter::FilterSpec;
use crate::metrics::{MetricRecord, MetricsSink};
use crate::thresholds::ThresholdTable;
use crate::trace::ChannelFilter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a marker's value comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// The record timestamp
    #[default]
    MsgTmsp,
    /// The first numeric capture group of the pattern
    RegexGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiDefinition {
    pub name: String,
    /// Published metric name, defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    pub pattern: String,
    pub app_id: String,
    pub context_id: String,
    #[serde(default)]
    pub capture: CaptureKind,
}

impl KpiDefinition {
    pub fn metric_name(&self) -> &str {
        self.metric.as_deref().unwrap_or(&self.name)
    }
}

/// Duration between two markers of the same catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiMarkerDefinition {
    pub name: String,
    pub start: String,
    pub end: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
}

impl MultiMarkerDefinition {
    pub fn metric_name(&self) -> &str {
        self.metric.as_deref().unwrap_or(&self.name)
    }
}

fn default_collection_timeout() -> f64 {
    crate::defaults::KPI_COLLECTION_TIMEOUT.as_secs_f64()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiCatalog {
    #[serde(default = "default_collection_timeout")]
    pub collection_timeout_secs: f64,
    #[serde(default)]
    pub kpis: Vec<KpiDefinition>,
    #[serde(default)]
    pub multi_markers: Vec<MultiMarkerDefinition>,
}

/// Outcome of processing one boot's correlation result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KpiCollection {
    /// Published values by metric name
    pub processed: BTreeMap<String, f64>,
    /// Metric names that could not be computed
    pub missing: Vec<String>,
}

impl KpiCollection {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

impl KpiCatalog {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let catalog: Self = serde_json::from_str(json)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kpis.is_empty() {
            return Err(KpiError::config("catalog defines no KPIs"));
        }
        if !self.collection_timeout_secs.is_finite() || self.collection_timeout_secs <= 0.0 {
            return Err(KpiError::config(format!(
                "collection_timeout_secs must be positive, got {}",
                self.collection_timeout_secs
            )));
        }
        Duration::try_from_secs_f64(self.collection_timeout_secs).map_err(|e| {
            KpiError::config(format!(
                "collection_timeout_secs is out of range, got {}: {}",
                self.collection_timeout_secs, e
            ))
        })?;

        let mut names = BTreeSet::new();
        for kpi in &self.kpis {
            if !names.insert(kpi.name.as_str()) {
                return Err(KpiError::config(format!("duplicate KPI name '{}'", kpi.name)));
            }
        }
        for marker in &self.multi_markers {
            for event in [&marker.start, &marker.end] {
                if !names.contains(event.as_str()) {
                    return Err(KpiError::config(format!(
                        "multi marker '{}' refers to unknown KPI '{}'",
                        marker.name, event
                    )));
                }
            }
        }
        self.filters().map(|_| ())
    }

    /// Saturates for values [`validate`](Self::validate) rejects
    pub fn collection_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.collection_timeout_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// One filter per KPI, labelled with the KPI name, in catalog order
    pub fn filters(&self) -> Result<Vec<FilterSpec>> {
        self.kpis
            .iter()
            .map(|kpi| {
                Ok(FilterSpec::new(&kpi.pattern)?
                    .with_channel(&kpi.app_id, &kpi.context_id)
                    .with_label(&kpi.name)
                    .with_count(1)
                    .with_raise_on_timeout(false)
                    .with_timeout(self.collection_timeout()))
            })
            .collect()
    }

    /// Deduplicated broker subscription criteria
    pub fn channel_filters(&self) -> Vec<ChannelFilter> {
        self.kpis
            .iter()
            .map(|kpi| ChannelFilter::new(&kpi.app_id, &kpi.context_id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Publish every captured KPI and derived duration of one boot
    ///
    /// `filters` must be the result of [`KpiCatalog::filters`] that produced `result`.
    pub fn process(
        &self,
        result: &CorrelationResult,
        filters: &[FilterSpec],
        thresholds: &ThresholdTable,
        branch: &str,
        sink: &dyn MetricsSink,
    ) -> KpiCollection {
        let mut collection = KpiCollection::default();
        let mut events = EventTimestamps::new();

        for ((kpi, filter), entry) in self.kpis.iter().zip(filters).zip(&result.entries) {
            let Some(record) = entry.first() else {
                warn!("KPI '{}' was not found in the trace", kpi.name);
                collection.missing.push(kpi.metric_name().to_string());
                continue;
            };
            let value = match kpi.capture {
                CaptureKind::MsgTmsp => Some(record.timestamp),
                CaptureKind::RegexGroup => filter.captured_value(record),
            };
            let Some(value) = value else {
                warn!(
                    "KPI '{}' matched '{}' but captured no numeric value",
                    kpi.name, record.payload
                );
                collection.missing.push(kpi.metric_name().to_string());
                continue;
            };
            events.insert(&kpi.name, value);
            publish_kpi(sink, thresholds, branch, kpi.metric_name(), value);
            collection.processed.insert(kpi.metric_name().to_string(), value);
        }

        for marker in &self.multi_markers {
            let mut metric = DurationMetric::new(marker.metric_name(), &marker.start, &marker.end);
            match metric.observe(&events).duration() {
                Ok(duration) => {
                    publish_kpi(sink, thresholds, branch, marker.metric_name(), duration);
                    collection
                        .processed
                        .insert(marker.metric_name().to_string(), duration);
                }
                Err(e) => {
                    warn!("{}", e);
                    collection.missing.push(marker.metric_name().to_string());
                }
            }
        }

        debug!(
            "Processed {} KPI value(s), {} missing",
            collection.processed.len(),
            collection.missing.len()
        );
        collection
    }
}

/// Publish `value` with the threshold of `branch` and every branch's threshold attached
pub fn publish_kpi(
    sink: &dyn MetricsSink,
    thresholds: &ThresholdTable,
    branch: &str,
    metric: &str,
    value: f64,
) -> MetricRecord {
    let record = MetricRecord::plain(metric, value)
        .with_threshold(thresholds.threshold(metric, branch))
        .with_branch_thresholds(thresholds.branches_for(metric));
    sink.publish_record(&record);
    record
}
