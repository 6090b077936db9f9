use crate::correlator::CorrelationMode;
use crate::thresholds::TargetKind;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// KPI Trace - collect boot KPIs from DLT traces and check them against thresholds
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// KPI catalog (JSON) listing the markers and durations to collect
    #[clap(short = 'k', long, help_heading = "Core Options")]
    pub catalog: PathBuf,

    /// Text trace to replay, or `-` to read a live feed from stdin
    #[clap(short = 't', long, default_value = "-", help_heading = "Core Options")]
    pub trace: String,

    /// How catalog markers are correlated
    #[clap(short = 'm', long, value_enum, default_value_t = CorrelationMode::Unordered, help_heading = "Core Options")]
    pub mode: CorrelationMode,

    /// Number of boot cycles to collect from the trace
    #[clap(short = 'n', long, default_value_t = 1)]
    pub cycles: usize,

    /// Collection timeout per cycle (overrides the catalog), e.g. `90s` or `2m`
    #[clap(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Replay records spaced like their timestamps instead of all at once
    #[clap(long, default_value_t = false)]
    pub realtime: bool,

    /// Per-branch KPI thresholds (JSON)
    #[clap(long)]
    pub thresholds: Option<PathBuf>,

    /// Branch whose thresholds apply
    #[clap(short = 'b', long, default_value = crate::defaults::BRANCH)]
    pub branch: String,

    /// Target family, recorded with the results
    #[clap(long, value_enum)]
    pub target: Option<TargetKind>,

    /// Output file for results (JSON format)
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_FILE)]
    pub output_file: PathBuf,

    /// JSON lines file receiving every metric as it is published
    #[clap(long)]
    pub streaming_output: Option<PathBuf>,

    /// Also write plain log output to this file
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Percentiles reported for KPIs collected over several cycles
    #[clap(long, default_values_t = vec![50.0, 95.0, 99.0])]
    pub percentiles: Vec<f64>,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,
}

/// Where trace records come from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceSource {
    Stdin,
    File(PathBuf),
}

impl std::fmt::Display for TraceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceSource::Stdin => write!(f, "stdin"),
            TraceSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Configuration of one collection run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub source: TraceSource,
    pub mode: CorrelationMode,
    pub cycles: usize,
    pub timeout: Option<Duration>,
    pub realtime: bool,
    pub branch: String,
    pub target: Option<TargetKind>,
    pub percentiles: Vec<f64>,
}

impl From<&Args> for RunConfiguration {
    fn from(args: &Args) -> Self {
        Self {
            source: if args.trace == "-" {
                TraceSource::Stdin
            } else {
                TraceSource::File(PathBuf::from(&args.trace))
            },
            mode: args.mode,
            cycles: args.cycles.max(1),
            timeout: args.timeout,
            realtime: args.realtime,
            branch: args.branch.clone(),
            target: args.target,
            percentiles: args.percentiles.clone(),
        }
    }
}

/// Parse duration from string (e.g., "500ms", "10s", "5m", "1h")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let seconds = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(seconds)
        .map_err(|e| format!("Duration out of range: {} ({})", s, e))
}
