//! # Error Taxonomy
//!
//! Every failure the KPI core can report is a variant of [`KpiError`]. The poller
//! retries exactly the [`KpiError::Transport`] variant and propagates everything else.
//!
//! All messages are written to be self-sufficient. A reader holding only the assertion
//! text must be able to see which pattern or timing bound was expected, what was
//! actually observed, and how long the core waited.

use std::time::Duration;
use thiserror::Error;

/// Maximum number of retained, non-matching records quoted in a timeout message
pub const MAX_OBSERVED_IN_MESSAGE: usize = 10;

/// Transient target-communication faults raised by a probe
///
/// These are the only faults the poller treats as retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFault {
    /// The peer reset the connection (typically while the ECU is rebooting)
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// The diagnostic channel closed before a full response arrived
    #[error("unexpected end of file")]
    EndOfFile,

    /// Generic runtime fault inside the diagnostic client
    #[error("runtime fault: {0}")]
    Runtime(String),

    /// Protocol-level fault (e.g. HSFZ/DoIP framing error)
    #[error("protocol fault: {0}")]
    Protocol(String),
}

/// Errors produced by the KPI timing, polling and correlation core
#[derive(Debug, Error)]
pub enum KpiError {
    /// A transient transport fault (retried by the poller)
    #[error("transport fault: {0}")]
    Transport(#[from] TransportFault),

    /// The required matches or sequence were not observed in time
    #[error(
        "timed out after {:.3}s waiting for [{}]: found {found} of {required} required match(es){}",
        .elapsed.as_secs_f64(),
        .patterns.join(", "),
        render_observed(.observed)
    )]
    TimeoutExceeded {
        patterns: Vec<String>,
        elapsed: Duration,
        found: usize,
        required: usize,
        observed: Vec<String>,
    },

    /// A duration was requested from an event that was never captured
    #[error("event '{name}' was never captured, cannot compute '{metric}'")]
    MissingEvent { name: String, metric: String },

    /// The poller exhausted its timeout without a qualifying response
    #[error(
        "no qualifying response within {:.3}s\n{narrative}",
        .timeout.as_secs_f64()
    )]
    NoQualifyingResponse { timeout: Duration, narrative: String },

    /// A qualifying response exists, but outside the permitted time window
    #[error(
        "expected a valid response between {:.3}s and {:.3}s, last valid response was at {:.3}s\n{narrative}",
        .min.as_secs_f64(),
        .max.as_secs_f64(),
        .value.as_secs_f64()
    )]
    OutsideWindow {
        value: Duration,
        min: Duration,
        max: Duration,
        narrative: String,
    },

    /// Invalid configuration, detected at construction time
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A trace line could not be parsed into a log record
    #[error("cannot parse trace line '{line}': {reason}")]
    Parse { line: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl KpiError {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        KpiError::Configuration(message.into())
    }

    /// Whether this error is a retryable transport fault
    pub fn is_transport(&self) -> bool {
        matches!(self, KpiError::Transport(_))
    }

    /// Whether this error is a correlation/matching timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, KpiError::TimeoutExceeded { .. })
    }
}

fn render_observed(observed: &[String]) -> String {
    if observed.is_empty() {
        return String::new();
    }
    let mut text = String::from("; observed instead:");
    for line in observed.iter().take(MAX_OBSERVED_IN_MESSAGE) {
        text.push_str("\n    ");
        text.push_str(line);
    }
    if observed.len() > MAX_OBSERVED_IN_MESSAGE {
        text.push_str(&format!(
            "\n    ... and {} more",
            observed.len() - MAX_OBSERVED_IN_MESSAGE
        ));
    }
    text
}

pub type Result<T, E = KpiError> = std::result::Result<T, E>;
