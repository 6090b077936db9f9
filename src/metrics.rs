use crate::error::{KpiError, Result};
use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Highest KPI value the statistics histogram tracks (one hour, in microseconds)
const MAX_TRACKED_MICROS: u64 = 3_600_000_000;

/// One published KPI value with its threshold context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    /// Value in seconds
    pub value: f64,
    /// Threshold resolved for the active branch; `None` when no threshold applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Thresholds of every branch that defines one for this metric
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub branch_thresholds: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within_threshold: Option<bool>,
    pub recorded_at: DateTime<Utc>,
}

impl MetricRecord {
    /// Record without threshold information
    pub fn plain(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            threshold: None,
            branch_thresholds: BTreeMap::new(),
            within_threshold: None,
            recorded_at: Utc::now(),
        }
    }

    /// Attach a threshold; `0.0` means "no threshold defined" and is ignored
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        if threshold > 0.0 {
            self.threshold = Some(threshold);
            self.within_threshold = Some(self.value <= threshold);
        }
        self
    }

    pub fn with_branch_thresholds(mut self, thresholds: BTreeMap<String, f64>) -> Self {
        self.branch_thresholds = thresholds;
        self
    }
}

/// Append-only destination for KPI values
///
/// Publishing is fire-and-forget from the caller's point of view.
pub trait MetricsSink: Send + Sync {
    fn publish(&self, name: &str, value: f64) {
        self.publish_record(&MetricRecord::plain(name, value));
    }

    fn publish_record(&self, record: &MetricRecord);
}

impl<T: MetricsSink + ?Sized> MetricsSink for Arc<T> {
    fn publish_record(&self, record: &MetricRecord) {
        (**self).publish_record(record)
    }
}

/// Keeps every published record in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<MetricRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().clone()
    }

    /// Most recent value published under `name`
    pub fn value_of(&self, name: &str) -> Option<f64> {
        self.records
            .lock()
            .iter()
            .rev()
            .find(|r| r.name == name)
            .map(|r| r.value)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl MetricsSink for MemorySink {
    fn publish_record(&self, record: &MetricRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Writes every record to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn publish_record(&self, record: &MetricRecord) {
        match (record.threshold, record.within_threshold) {
            (Some(threshold), Some(false)) => warn!(
                "KPI {} = {:.6}s exceeds threshold {:.6}s",
                record.name, record.value, threshold
            ),
            (Some(threshold), _) => info!(
                "KPI {} = {:.6}s (threshold {:.6}s)",
                record.name, record.value, threshold
            ),
            _ => info!("KPI {} = {:.6}s", record.name, record.value),
        }
    }
}

/// Forwards every record to several sinks in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl MetricsSink for FanoutSink {
    fn publish_record(&self, record: &MetricRecord) {
        for sink in &self.sinks {
            sink.publish_record(record);
        }
    }
}

/// Percentile value pair, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_secs: f64,
}

/// Distribution of one KPI over repeated cycles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSummary {
    pub name: String,
    pub samples: u64,
    pub min_secs: f64,
    pub max_secs: f64,
    pub mean_secs: f64,
    pub std_dev_secs: f64,
    pub percentiles: Vec<PercentileValue>,
}

/// HDR histogram of one KPI with microsecond resolution
pub struct KpiStatistics {
    name: String,
    histogram: Histogram<u64>,
}

impl std::fmt::Debug for KpiStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KpiStatistics")
            .field("name", &self.name)
            .field("samples", &self.histogram.len())
            .finish()
    }
}

fn to_secs(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}

impl KpiStatistics {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        // 3 significant figures
        let histogram = Histogram::<u64>::new_with_bounds(1, MAX_TRACKED_MICROS, 3)
            .map_err(|e| KpiError::config(format!("cannot create histogram: {}", e)))?;
        Ok(Self {
            name: name.into(),
            histogram,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a value in seconds; negative or non-finite values are skipped
    pub fn record(&mut self, seconds: f64) {
        if !seconds.is_finite() || seconds < 0.0 {
            warn!("Not recording {} = {} in statistics", self.name, seconds);
            return;
        }
        let micros = ((seconds * 1_000_000.0).round() as u64).clamp(1, MAX_TRACKED_MICROS);
        self.histogram.saturating_record(micros);
    }

    pub fn samples(&self) -> u64 {
        self.histogram.len()
    }

    pub fn summary(&self, percentiles: &[f64]) -> KpiSummary {
        KpiSummary {
            name: self.name.clone(),
            samples: self.histogram.len(),
            min_secs: to_secs(self.histogram.min()),
            max_secs: to_secs(self.histogram.max()),
            mean_secs: self.histogram.mean() / 1_000_000.0,
            std_dev_secs: self.histogram.stdev() / 1_000_000.0,
            percentiles: percentiles
                .iter()
                .map(|&p| PercentileValue {
                    percentile: p,
                    value_secs: to_secs(self.histogram.value_at_percentile(p)),
                })
                .collect(),
        }
    }
}

/// Statistics of every KPI seen across cycles, keyed by name
#[derive(Debug, Default)]
pub struct StatisticsBook {
    entries: BTreeMap<String, KpiStatistics>,
}

impl StatisticsBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, seconds: f64) -> Result<()> {
        if !self.entries.contains_key(name) {
            self.entries
                .insert(name.to_string(), KpiStatistics::new(name)?);
        }
        if let Some(stats) = self.entries.get_mut(name) {
            stats.record(seconds);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&KpiStatistics> {
        self.entries.get(name)
    }

    pub fn summaries(&self, percentiles: &[f64]) -> Vec<KpiSummary> {
        self.entries
            .values()
            .filter(|s| s.samples() > 0)
            .map(|s| s.summary(percentiles))
            .collect()
    }
}
