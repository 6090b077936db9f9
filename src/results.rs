use crate::correlator::CorrelationMode;
use crate::kpi::KpiCollection;
use crate::metrics::{KpiSummary, MetricRecord, MetricsSink};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// KPIs collected in one boot cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle: usize,
    pub collection: KpiCollection,
    pub elapsed: Duration,
    pub records_scanned: usize,
}

/// Found/missing status of one KPI across cycles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KpiCycleStatus {
    pub found_in: Vec<usize>,
    pub missing_in: Vec<usize>,
}

/// Per-cycle Found/Missing bookkeeping of every KPI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycles: usize,
    pub kpis: BTreeMap<String, KpiCycleStatus>,
}

impl CycleReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, cycle: usize, collection: &KpiCollection) {
        self.cycles += 1;
        for name in collection.processed.keys() {
            self.kpis.entry(name.clone()).or_default().found_in.push(cycle);
        }
        for name in &collection.missing {
            self.kpis.entry(name.clone()).or_default().missing_in.push(cycle);
        }
    }

    /// Values collected over all cycles
    pub fn total_collected(&self) -> usize {
        self.kpis.values().map(|s| s.found_in.len()).sum()
    }

    pub fn total_not_collected(&self) -> usize {
        self.kpis.values().map(|s| s.missing_in.len()).sum()
    }

    /// KPIs missing in at least one cycle, with the cycles they were missing in
    pub fn missing(&self) -> BTreeMap<&str, &[usize]> {
        self.kpis
            .iter()
            .filter(|(_, s)| !s.missing_in.is_empty())
            .map(|(name, s)| (name.as_str(), s.missing_in.as_slice()))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.total_not_collected() == 0
    }
}

/// Describes the run that produced the results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub branch: String,
    pub mode: CorrelationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_source: Option<String>,
}

impl RunMetadata {
    pub fn new(branch: impl Into<String>, mode: CorrelationMode) -> Self {
        Self {
            version: crate::VERSION.to_string(),
            run_id: crate::utils::generate_run_id(),
            timestamp: chrono::Utc::now(),
            branch: branch.into(),
            mode,
            trace_source: None,
        }
    }
}

/// Consolidated output document
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalResults {
    pub metadata: RunMetadata,
    pub cycles: Vec<CycleResult>,
    pub report: CycleReport,
    pub statistics: Vec<KpiSummary>,
}

/// Appends every published metric to a file as one JSON object per line
pub struct StreamingSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl StreamingSink {
    /// Create or truncate `path`
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open streaming output {:?}", path))?;
        debug!("Streaming metrics to: {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for StreamingSink {
    fn publish_record(&self, record: &MetricRecord) {
        let mut writer = self.writer.lock();
        let written = (|| -> std::io::Result<()> {
            let json = serde_json::to_string(record)?;
            writeln!(writer, "{}", json)?;
            writer.flush()
        })();
        if let Err(e) = written {
            warn!("Failed to stream metric {} to {:?}: {}", record.name, self.path, e);
        }
    }
}

/// Collects per-cycle results and writes the final JSON document
pub struct ResultsManager {
    output_file: PathBuf,
    metadata: RunMetadata,
    cycles: Vec<CycleResult>,
    report: CycleReport,
    statistics: Vec<KpiSummary>,
}

impl ResultsManager {
    pub fn new(output_file: &Path, metadata: RunMetadata) -> Self {
        Self {
            output_file: output_file.to_path_buf(),
            metadata,
            cycles: Vec::new(),
            report: CycleReport::new(),
            statistics: Vec::new(),
        }
    }

    pub fn add_cycle(&mut self, result: CycleResult) {
        info!(
            "Cycle {}: {} KPI(s) collected, {} missing",
            result.cycle,
            result.collection.processed.len(),
            result.collection.missing.len()
        );
        self.report.record(result.cycle, &result.collection);
        self.cycles.push(result);
    }

    pub fn set_statistics(&mut self, statistics: Vec<KpiSummary>) {
        self.statistics = statistics;
    }

    pub fn report(&self) -> &CycleReport {
        &self.report
    }

    pub fn cycles(&self) -> &[CycleResult] {
        &self.cycles
    }

    /// Write the consolidated results to the output file
    pub fn finalize(&self) -> Result<()> {
        let final_results = FinalResults {
            metadata: self.metadata.clone(),
            cycles: self.cycles.clone(),
            report: self.report.clone(),
            statistics: self.statistics.clone(),
        };
        let json = serde_json::to_string_pretty(&final_results)?;
        std::fs::write(&self.output_file, json)
            .with_context(|| format!("Failed to write results to {:?}", self.output_file))?;
        info!("Results written to: {:?}", self.output_file);
        Ok(())
    }
}
