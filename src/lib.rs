//! # KPI Trace Library
//!
//! Timing, polling and DLT multi-pattern correlation for hardware-in-the-loop tests of
//! automotive ECUs. The library measures how long a target takes to reach expected
//! states, either by polling it or by waiting for log milestones in its trace stream.
//!
//! ## Components
//!
//! - `timeout`: restartable countdown read through an explicit clock
//! - `poller`: fixed-interval probing with a minimum settle time and narrow retry
//! - `response_log`: chronological ledger of probe attempts and its failure narrative
//! - `matcher`: waits for one filter on a trace stream
//! - `correlator`: ordered or unordered multi-filter correlation in one pass
//! - `duration`: elapsed time between two captured milestones
//! - `kpi`: catalog of boot markers, publishing values with per-branch thresholds
//! - `target`: reset-and-measure availability scenario
//!
//! Collaborators are injected: the trace broker ([`trace::TraceBroker`]), the device
//! under test ([`target::TargetControl`]), the metrics sink ([`metrics::MetricsSink`]) and
//! the clock ([`clock::Clock`]).
//!
//! ## Usage Example
//!
//! ```rust
//! use kpi_trace::clock::ManualClock;
//! use kpi_trace::correlator::{CorrelationMode, MultiFilterCorrelator};
//! use kpi_trace::filter::FilterSpec;
//! use kpi_trace::trace::{LogRecord, Pacing, ReplayBroker};
//! use std::time::Duration;
//!
//! # fn main() -> kpi_trace::Result<()> {
//! let clock = ManualClock::new();
//! let records = vec![
//!     LogRecord::new(0.5, "SYS", "BOOT", "noise"),
//!     LogRecord::new(1.0, "SYS", "BOOT", "STEP1 done"),
//!     LogRecord::new(2.0, "SYS", "BOOT", "STEP2 done"),
//! ];
//! let broker = ReplayBroker::from_records(records, Pacing::Realtime, clock.shared());
//!
//! let filters = [FilterSpec::new("STEP1")?, FilterSpec::new("STEP2")?];
//! let result = MultiFilterCorrelator::new(clock.shared(), CorrelationMode::Ordered)
//!     .subscribe_and_correlate(&broker, &filters, Duration::from_secs(10))?
//!     .require_complete()?;
//!
//! assert_eq!(result.entries[1].records[0].payload, "STEP2 done");
//! # Ok(())
//! # }
//! ```

/// Simulated and monotonic time sources
pub mod clock;

/// Command-line interface and run configuration
///
/// Argument parsing using clap, converted into a [`cli::RunConfiguration`].
pub mod cli;

/// Multi-filter correlation over one stream pass
pub mod correlator;

/// Start/end marker pair detection with derived end patterns
pub mod detector;

pub mod duration;

/// Closed error taxonomy of the library
pub mod error;

pub mod filter;

/// KPI catalog loading and per-boot processing
pub mod kpi;

pub mod logging;

pub mod matcher;

/// Metric sinks and KPI statistics
///
/// Published values flow through the [`metrics::MetricsSink`] trait. Repeated values of
/// one KPI across cycles are aggregated in HDR histograms.
pub mod metrics;

pub mod poller;

pub mod response_log;

/// Result collection and output
///
/// - consolidated JSON document with run metadata
/// - optional JSON lines stream of every published metric
/// - per-cycle Found/Missing report
pub mod results;

pub mod retry;

pub mod target;

/// Per-target timing rows and per-branch KPI thresholds
pub mod thresholds;

pub mod timeout;

/// Trace broker abstraction with replay and live implementations
pub mod trace;

pub mod utils;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use correlator::{CorrelationMode, CorrelationResult, MultiFilterCorrelator};
pub use duration::{DurationMetric, EventTimestamps};
pub use error::{KpiError, Result, TransportFault};
pub use filter::{FilterConfig, FilterSpec};
pub use matcher::{MatchOutcome, TraceMatcher};
pub use poller::{PollReport, Poller, PollerConfig};
pub use response_log::{KpiResponseLog, PollAttempt};
pub use timeout::TimeoutCondition;
pub use trace::{ChannelFilter, LogRecord, TraceBroker, TraceStream};

/// The current version of the crate, recorded in result metadata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Interval between two probe invocations
    pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Window after a reset during which probe responses cannot qualify
    pub const MINIMUM_SETTLE_TIME: Duration = Duration::from_secs(2);

    /// Wait for a single DLT milestone
    pub const DLT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Collection window for all KPI markers of one boot
    pub const KPI_COLLECTION_TIMEOUT: Duration = Duration::from_secs(120);

    /// Attempts made by the default retry policy
    pub const RETRY_COUNT: u32 = 10;

    /// Pause between two attempts of the default retry policy
    pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);

    /// Branch whose thresholds apply when none is selected
    pub const BRANCH: &str = "master";

    /// Default output file name
    pub const OUTPUT_FILE: &str = "kpi_results.json";
}
