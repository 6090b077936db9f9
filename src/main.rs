//! # KPI Trace - Main Entry Point
//!
//! Collects boot KPIs from a DLT text trace and checks them against per-branch
//! thresholds:
//!
//! 1. **Initialize logging**: colourised console output, optional log file
//! 2. **Load configuration**: KPI catalog and threshold table
//! 3. **Open the trace**: replay a recorded file or follow a live feed on stdin
//! 4. **Collect cycles**: one correlation pass per boot cycle on the same stream
//! 5. **Report**: Found/Missing summary, statistics and the JSON results file
//!
//! The process exits with an error when any KPI could not be collected.

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::*;
use kpi_trace::{
    cli::{Args, RunConfiguration, TraceSource},
    clock::{SharedClock, SystemClock},
    correlator::MultiFilterCorrelator,
    filter::FilterSpec,
    kpi::KpiCatalog,
    logging,
    metrics::{FanoutSink, KpiSummary, MetricsSink, StatisticsBook, TracingSink},
    results::{CycleReport, CycleResult, ResultsManager, RunMetadata, StreamingSink},
    thresholds::ThresholdTable,
    trace::{ChannelBroker, Pacing, ReplayBroker, TraceBroker, TraceStream},
    utils,
};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn main() -> Result<()> {
    let args = Args::parse();
    // The guard flushes the log file on exit
    let _log_guard = logging::init_logging(args.verbose, args.log_file.as_deref())?;

    let config = RunConfiguration::from(&args);
    info!("Starting KPI Trace {}", kpi_trace::VERSION);
    debug!("Configuration: {:?}", config);

    let catalog = KpiCatalog::from_json_file(&args.catalog)
        .with_context(|| format!("Failed to load KPI catalog {:?}", args.catalog))?;
    let thresholds = match &args.thresholds {
        Some(path) => ThresholdTable::from_json_file(path)
            .with_context(|| format!("Failed to load thresholds {:?}", path))?,
        None => ThresholdTable::new(),
    };
    if let Some(target) = config.target {
        let row = target.thresholds();
        info!(
            "Target {}: UDS within {}, reachable within {}",
            target,
            utils::format_duration(row.uds_request_timeout),
            utils::format_duration(row.target_connected_timeout)
        );
    }

    let mut metadata = RunMetadata::new(&config.branch, config.mode);
    metadata.trace_source = Some(config.source.to_string());
    let mut results = ResultsManager::new(&args.output_file, metadata);

    let mut sink = FanoutSink::new().with(Arc::new(TracingSink));
    if let Some(path) = &args.streaming_output {
        info!("Streaming metrics to: {:?}", path);
        sink = sink.with(Arc::new(StreamingSink::create(path)?));
    }

    let clock = SystemClock::shared();
    let filters = catalog.filters()?;
    let criteria = catalog.channel_filters();
    let run = CollectionRun {
        catalog: &catalog,
        filters: &filters,
        thresholds: &thresholds,
        config: &config,
        sink: &sink,
        clock,
    };

    let statistics = match &config.source {
        TraceSource::File(path) => {
            let file = File::open(path).with_context(|| format!("Failed to open trace {:?}", path))?;
            let pacing = if config.realtime {
                Pacing::Realtime
            } else {
                Pacing::Immediate
            };
            let broker = ReplayBroker::from_reader(BufReader::new(file), pacing, run.clock.clone())?;
            info!("Replaying {} trace records from {}", broker.len(), path.display());
            let mut stream = broker.subscribe(&criteria)?;
            run.collect(&mut stream, &mut results)?
        }
        TraceSource::Stdin => {
            let broker = ChannelBroker::new();
            let mut stream = broker.subscribe(&criteria)?;
            let _feed = broker.spawn_line_feed(BufReader::new(std::io::stdin()));
            info!("Following live trace on stdin");
            run.collect(&mut stream, &mut results)?
        }
    };

    let summaries = statistics.summaries(&config.percentiles);
    print_summary(results.report(), &summaries);
    results.set_statistics(summaries);
    results.finalize()?;

    let report = results.report();
    if !report.is_complete() {
        bail!(
            "{} KPI value(s) were not collected over {} cycle(s)",
            report.total_not_collected(),
            report.cycles
        );
    }
    info!("KPI Trace completed successfully");
    Ok(())
}

/// Everything one collection run needs besides the stream
struct CollectionRun<'a> {
    catalog: &'a KpiCatalog,
    filters: &'a [FilterSpec],
    thresholds: &'a ThresholdTable,
    config: &'a RunConfiguration,
    sink: &'a dyn MetricsSink,
    clock: SharedClock,
}

impl CollectionRun<'_> {
    /// Run one correlation pass per cycle on `stream`, consuming it left to right
    fn collect<S: TraceStream>(&self, stream: &mut S, results: &mut ResultsManager) -> Result<StatisticsBook> {
        let correlator = MultiFilterCorrelator::new(self.clock.clone(), self.config.mode);
        let timeout = self
            .config
            .timeout
            .unwrap_or_else(|| self.catalog.collection_timeout());
        let mut statistics = StatisticsBook::new();

        for cycle in 1..=self.config.cycles {
            if cycle > 1 && stream.is_exhausted() {
                warn!("Trace ended after {} cycle(s)", cycle - 1);
                break;
            }
            info!("Collecting KPIs for cycle {}/{}", cycle, self.config.cycles);
            let correlation = correlator.correlate(stream, self.filters, timeout)?;
            let collection = self.catalog.process(
                &correlation,
                self.filters,
                self.thresholds,
                &self.config.branch,
                self.sink,
            );
            for (name, value) in &collection.processed {
                statistics.record(name, *value)?;
            }
            results.add_cycle(CycleResult {
                cycle,
                collection,
                elapsed: correlation.elapsed,
                records_scanned: correlation.scanned,
            });
        }
        Ok(statistics)
    }
}

fn print_summary(report: &CycleReport, summaries: &[KpiSummary]) {
    let header = ["KPI", "Found", "Missing in cycles", "Min", "Mean", "Max"];
    let rows: Vec<Vec<String>> = report
        .kpis
        .iter()
        .map(|(name, status)| {
            let summary = summaries.iter().find(|s| &s.name == name);
            let stat = |value: Option<f64>| value.map(utils::format_seconds).unwrap_or_else(|| "-".to_string());
            vec![
                name.clone(),
                format!("{}/{}", status.found_in.len(), report.cycles),
                if status.missing_in.is_empty() {
                    "-".to_string()
                } else {
                    status
                        .missing_in
                        .iter()
                        .map(|c| c.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                },
                stat(summary.map(|s| s.min_secs)),
                stat(summary.map(|s| s.mean_secs)),
                stat(summary.map(|s| s.max_secs)),
            ]
        })
        .collect();
    let widths = utils::column_widths(&header, &rows);

    println!();
    println!("{}", "KPI Summary".bold());
    utils::print_table_separator(&widths);
    utils::print_table_row(&header, &widths);
    utils::print_table_separator(&widths);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        utils::print_table_row(&cells, &widths);
    }
    utils::print_table_separator(&widths);

    let collected = format!("Collected: {}", report.total_collected());
    let missing = format!("Not collected: {}", report.total_not_collected());
    if report.is_complete() {
        println!("{}  {}", collected.green(), missing);
    } else {
        println!("{}  {}", collected, missing.red());
    }
}
