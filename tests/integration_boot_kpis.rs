use anyhow::Result;
use kpi_trace::clock::ManualClock;
use kpi_trace::correlator::{CorrelationMode, MultiFilterCorrelator};
use kpi_trace::kpi::KpiCatalog;
use kpi_trace::metrics::{MemorySink, StatisticsBook};
use kpi_trace::results::{CycleResult, ResultsManager, RunMetadata};
use kpi_trace::thresholds::ThresholdTable;
use kpi_trace::trace::{Pacing, ReplayBroker, TraceBroker, TraceStream};
use std::io::{BufReader, Write};
use std::time::Duration;
use tempfile::NamedTempFile;

const CATALOG: &str = r#"{
    "collection_timeout_secs": 60,
    "kpis": [
        { "name": "kernel", "pattern": "Kernel started", "app_id": "SYS", "context_id": "BOOT" },
        { "name": "ui_ready", "metric": "UI ready", "pattern": "ready after ([0-9.]+)",
          "app_id": "HMI", "context_id": "MAIN", "capture": "regex_group" },
        { "name": "map", "pattern": "Map loaded", "app_id": "NAV", "context_id": "MAIN" }
    ],
    "multi_markers": [
        { "name": "Kernel to map", "start": "kernel", "end": "map" }
    ]
}"#;

const TRACE: &str = "\
# first boot
0.100000 SYS BOOT Kernel started
0.900000 SYS BOOT init noise
1.200000 AUD MAIN Map loaded on the wrong channel
2.500000 HMI MAIN UI ready after 6.25 s
3.000000 NAV MAIN Map loaded

# second boot, the HMI never comes up
0.120000 SYS BOOT Kernel started
this line is not a trace record
2.600000 NAV MAIN Map loaded
";

fn write_temp(contents: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[test]
fn two_boots_from_one_trace_file() -> Result<()> {
    let catalog_file = write_temp(CATALOG)?;
    let trace_file = write_temp(TRACE)?;
    let output = NamedTempFile::new()?;

    let catalog = KpiCatalog::from_json_file(catalog_file.path())?;
    let filters = catalog.filters()?;
    let mut thresholds = ThresholdTable::new();
    thresholds.insert("master", "kernel", 0.11);

    let clock = ManualClock::new();
    let broker = ReplayBroker::from_reader(
        BufReader::new(std::fs::File::open(trace_file.path())?),
        Pacing::Immediate,
        clock.shared(),
    )?;
    assert_eq!(broker.len(), 7);
    let mut stream = broker.subscribe(&catalog.channel_filters())?;
    // The AUD record is filtered out by the broker
    assert_eq!(stream.pending(), 6);

    let correlator = MultiFilterCorrelator::new(clock.shared(), CorrelationMode::Unordered);
    let sink = MemorySink::new();
    let mut statistics = StatisticsBook::new();
    let mut results = ResultsManager::new(
        output.path(),
        RunMetadata::new("master", CorrelationMode::Unordered),
    );

    for cycle in 1..=2 {
        let correlation = correlator.correlate(&mut stream, &filters, catalog.collection_timeout())?;
        let collection = catalog.process(&correlation, &filters, &thresholds, "master", &sink);
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
    assert!(stream.is_exhausted());
    // Immediate pacing never waits
    assert_eq!(results.cycles()[0].elapsed, Duration::ZERO);

    let first = &results.cycles()[0].collection;
    assert!(first.is_complete());
    assert_eq!(first.processed["kernel"], 0.1);
    assert_eq!(first.processed["UI ready"], 6.25);
    assert!((first.processed["Kernel to map"] - 2.9).abs() < 1e-9);

    let second = &results.cycles()[1].collection;
    assert_eq!(second.missing, vec!["UI ready".to_string()]);
    assert!((second.processed["Kernel to map"] - 2.48).abs() < 1e-9);

    let report = results.report();
    assert_eq!(report.cycles, 2);
    assert_eq!(report.total_collected(), 7);
    assert_eq!(report.total_not_collected(), 1);
    assert_eq!(report.missing()["UI ready"], &[2]);
    assert!(!report.is_complete());

    let kernel_records: Vec<_> = sink
        .records()
        .into_iter()
        .filter(|r| r.name == "kernel")
        .collect();
    assert_eq!(kernel_records.len(), 2);
    assert_eq!(kernel_records[0].within_threshold, Some(true));
    assert_eq!(kernel_records[1].within_threshold, Some(false));

    assert_eq!(statistics.get("kernel").map(|s| s.samples()), Some(2));
    assert_eq!(statistics.get("UI ready").map(|s| s.samples()), Some(1));

    results.set_statistics(statistics.summaries(&[50.0, 99.0]));
    results.finalize()?;

    let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(output.path())?)?;
    assert_eq!(written["metadata"]["branch"], "master");
    assert_eq!(written["report"]["kpis"]["UI ready"]["missing_in"], serde_json::json!([2]));
    assert_eq!(written["cycles"].as_array().map(Vec::len), Some(2));
    assert_eq!(written["statistics"].as_array().map(Vec::len), Some(4));
    Ok(())
}

#[test]
fn two_boots_replay_in_file_order_with_realtime_pacing() -> Result<()> {
    let catalog = KpiCatalog::from_json_str(CATALOG)?;
    let filters = catalog.filters()?;
    let clock = ManualClock::new();
    let broker = ReplayBroker::from_reader(TRACE.as_bytes(), Pacing::Realtime, clock.shared())?;
    let mut stream = broker.subscribe(&catalog.channel_filters())?;

    let correlator = MultiFilterCorrelator::new(clock.shared(), CorrelationMode::Unordered);
    let sink = MemorySink::new();
    let mut cycles = Vec::new();
    for _ in 1..=2 {
        let correlation = correlator.correlate(&mut stream, &filters, catalog.collection_timeout())?;
        let collection = catalog.process(&correlation, &filters, &ThresholdTable::new(), "master", &sink);
        cycles.push((correlation.elapsed, correlation.scanned, collection));
    }
    assert!(stream.is_exhausted());

    // The first boot ends on its own map marker, never on the second boot's
    let (elapsed, scanned, first) = &cycles[0];
    assert!(first.is_complete());
    assert_eq!(*scanned, 4);
    assert_eq!(first.processed["kernel"], 0.1);
    assert_eq!(first.processed["map"], 3.0);
    assert!((first.processed["Kernel to map"] - 2.9).abs() < 1e-9);
    assert!((elapsed.as_secs_f64() - 2.9).abs() < 1e-6);

    // The timestamp reset adds no delay before the second boot
    let (elapsed, scanned, second) = &cycles[1];
    assert_eq!(*scanned, 2);
    assert_eq!(second.processed["kernel"], 0.12);
    assert_eq!(second.processed["map"], 2.6);
    assert!((second.processed["Kernel to map"] - 2.48).abs() < 1e-9);
    assert_eq!(second.missing, vec!["UI ready".to_string()]);
    assert!((elapsed.as_secs_f64() - 2.48).abs() < 1e-6);
    Ok(())
}

#[test]
fn ordered_catalog_reports_out_of_order_marker_missing() -> Result<()> {
    let catalog = KpiCatalog::from_json_str(CATALOG)?;
    let filters = catalog.filters()?;
    let clock = ManualClock::new();

    // The map marker arrives before the UI marker, so the single cursor passes it by
    let trace = "\
0.100000 SYS BOOT Kernel started
1.000000 NAV MAIN Map loaded
2.500000 HMI MAIN UI ready after 6.25 s
";
    let broker = ReplayBroker::from_reader(trace.as_bytes(), Pacing::Realtime, clock.shared())?;
    let result = MultiFilterCorrelator::new(clock.shared(), CorrelationMode::Ordered)
        .subscribe_and_correlate(&broker, &filters, catalog.collection_timeout())?;

    assert!(!result.is_complete());
    let unmatched: Vec<&str> = result.unmatched().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(unmatched, vec!["map"]);

    let sink = MemorySink::new();
    let collection = catalog.process(&result, &filters, &ThresholdTable::new(), "master", &sink);
    assert_eq!(collection.missing, vec!["map".to_string(), "Kernel to map".to_string()]);
    assert_eq!(sink.value_of("UI ready"), Some(6.25));
    Ok(())
}
