//! # Per-Target Thresholds
//!
//! Two kinds of limits drive pass/fail decisions:
//!
//! - [`TargetKind`] selects the fixed timing row of a target family (UDS request and
//!   network reachability timeouts). The lookup is an exhaustive `match`, resolved once
//!   when configuration is loaded.
//! - [`ThresholdTable`] holds per-branch KPI thresholds (`branch -> metric -> seconds`)
//!   loaded from JSON, with a default-branch fallback.

use crate::error::{KpiError, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Branch consulted when the requested branch or metric is not configured
pub const DEFAULT_BRANCH: &str = "default_branch";

/// Metric key inside [`DEFAULT_BRANCH`] holding the fallback threshold
pub const DEFAULT_KPI_THRESHOLD: &str = "default_kpi_threshold";

/// Target families with their own timing requirements
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// Basic media target
    #[clap(name = "bmt")]
    Bmt,

    /// MGU22 head unit
    #[clap(name = "mgu22")]
    Mgu22,

    /// IDC23 head unit
    #[clap(name = "idc23")]
    Idc23,

    /// Rear-seat entertainment 22
    #[clap(name = "rse22")]
    Rse22,

    /// MARS target
    #[clap(name = "mars")]
    Mars,
}

/// Timing limits of one target family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetThresholds {
    /// Latest acceptable UDS answer after an ECU reset
    pub uds_request_timeout: Duration,
    /// Latest acceptable network reachability after an ECU reset
    pub target_connected_timeout: Duration,
}

impl TargetKind {
    pub fn thresholds(&self) -> TargetThresholds {
        let (uds, connected) = match self {
            TargetKind::Bmt => (10, 30),
            TargetKind::Mgu22 => (35, 40),
            TargetKind::Idc23 => (35, 40),
            TargetKind::Rse22 => (35, 40),
            TargetKind::Mars => (20, 30),
        };
        TargetThresholds {
            uds_request_timeout: Duration::from_secs(uds),
            target_connected_timeout: Duration::from_secs(connected),
        }
    }

    pub fn all() -> [TargetKind; 5] {
        [
            TargetKind::Bmt,
            TargetKind::Mgu22,
            TargetKind::Idc23,
            TargetKind::Rse22,
            TargetKind::Mars,
        ]
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Bmt => write!(f, "BMT"),
            TargetKind::Mgu22 => write!(f, "MGU22"),
            TargetKind::Idc23 => write!(f, "IDC23"),
            TargetKind::Rse22 => write!(f, "RSE22"),
            TargetKind::Mars => write!(f, "MARS"),
        }
    }
}

/// KPI thresholds keyed by branch, then metric name (seconds)
///
/// A threshold of `0.0` means "no threshold defined".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdTable {
    branches: BTreeMap<String, BTreeMap<String, f64>>,
}

impl ThresholdTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let table: Self = serde_json::from_str(json)?;
        table.validate()?;
        Ok(table)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn insert(&mut self, branch: &str, metric: &str, seconds: f64) {
        self.branches
            .entry(branch.to_string())
            .or_default()
            .insert(metric.to_string(), seconds);
    }

    fn validate(&self) -> Result<()> {
        for (branch, metrics) in &self.branches {
            if let Some((metric, value)) = metrics.iter().find(|(_, v)| !v.is_finite() || **v < 0.0) {
                return Err(KpiError::config(format!(
                    "threshold {}.{} must be a non-negative number, got {}",
                    branch, metric, value
                )));
            }
        }
        Ok(())
    }

    /// Threshold of `metric` on `branch`, falling back to the default branch
    ///
    /// Returns `0.0` when neither the branch nor a default is configured.
    pub fn threshold(&self, metric: &str, branch: &str) -> f64 {
        if let Some(value) = self.branches.get(branch).and_then(|m| m.get(metric)) {
            return *value;
        }
        debug!("{}.{} is not present in the threshold table", branch, metric);
        let fallback = self
            .branches
            .get(DEFAULT_BRANCH)
            .and_then(|m| m.get(DEFAULT_KPI_THRESHOLD))
            .copied()
            .unwrap_or(0.0);
        debug!("Using the default threshold: {}", fallback);
        fallback
    }

    /// Every branch that defines a threshold for `metric`
    pub fn branches_for(&self, metric: &str) -> BTreeMap<String, f64> {
        self.branches
            .iter()
            .filter_map(|(branch, metrics)| metrics.get(metric).map(|v| (branch.clone(), *v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"{
        "master": { "UDS availability": 5.0, "Kernel boot": 0.45 },
        "i350_stable": { "UDS availability": 12.5 },
        "default_branch": { "default_kpi_threshold": 0.0 }
    }"#;

    #[test]
    fn test_target_rows() {
        let mgu = TargetKind::Mgu22.thresholds();
        assert_eq!(mgu.uds_request_timeout, Duration::from_secs(35));
        assert_eq!(mgu.target_connected_timeout, Duration::from_secs(40));
        let mars = TargetKind::Mars.thresholds();
        assert_eq!(mars.uds_request_timeout, Duration::from_secs(20));
        for kind in TargetKind::all() {
            let row = kind.thresholds();
            assert!(row.uds_request_timeout <= row.target_connected_timeout);
        }
    }

    #[test]
    fn test_target_kind_display_and_serde() {
        assert_eq!(TargetKind::Idc23.to_string(), "IDC23");
        let kind: TargetKind = serde_json::from_str("\"rse22\"").unwrap();
        assert_eq!(kind, TargetKind::Rse22);
    }

    #[test]
    fn test_threshold_lookup_with_fallback() {
        let table = ThresholdTable::from_json_str(TABLE).unwrap();
        assert_eq!(table.threshold("UDS availability", "master"), 5.0);
        assert_eq!(table.threshold("UDS availability", "i350_stable"), 12.5);
        assert_eq!(table.threshold("Kernel boot", "i350_stable"), 0.0);
        assert_eq!(table.threshold("UDS availability", "unknown"), 0.0);
    }

    #[test]
    fn test_branches_for_metric() {
        let table = ThresholdTable::from_json_str(TABLE).unwrap();
        let branches = table.branches_for("UDS availability");
        assert_eq!(branches.len(), 2);
        assert_eq!(branches["i350_stable"], 12.5);
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let result = ThresholdTable::from_json_str(r#"{"master": {"x": -1.0}}"#);
        assert!(matches!(result, Err(KpiError::Configuration(_))));
    }

    #[test]
    fn test_empty_table_has_no_thresholds() {
        let table = ThresholdTable::new();
        assert_eq!(table.threshold("anything", "master"), 0.0);
    }
}
