//! # Trace Broker Abstraction
//!
//! The core consumes DLT traffic through two narrow traits:
//!
//! - [`TraceBroker::subscribe`] narrows traffic at the broker level by
//!   `(app_id, context_id)` and hands back a scoped stream.
//! - [`TraceStream::next_available`] pulls the next record, blocking up to a timeout.
//!
//! Streams are pull-based and not restartable: once a record is consumed it is gone.
//! A stream is released when dropped, on every exit path of the operation that owns it.
//!
//! Two brokers are provided:
//!
//! - [`ReplayBroker`]: records scheduled on a [`Clock`](crate::clock::Clock), used for
//!   offline replay of recorded traces and for simulated-time tests
//! - [`ChannelBroker`]: live fan-out of records published by a producer thread

use crate::error::{KpiError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod channel;
pub mod replay;

pub use channel::{ChannelBroker, ChannelStream};
pub use replay::{Pacing, ReplayBroker, ReplayStream};

/// One decoded DLT message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub app_id: String,
    pub context_id: String,
    pub payload: String,
    /// Broker-assigned monotonic timestamp in seconds
    pub timestamp: f64,
}

impl LogRecord {
    pub fn new(
        timestamp: f64,
        app_id: impl Into<String>,
        context_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            context_id: context_id.into(),
            payload: payload.into(),
            timestamp,
        }
    }

    /// Parse one line of the text trace format `<timestamp> <APID> <CTID> <payload...>`
    ///
    /// The payload is the remainder of the line after the context id and may be empty.
    pub fn parse_line(line: &str) -> Result<Self> {
        let parse_error = |reason: &str| KpiError::Parse {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = line.trim();
        let mut parts = trimmed.splitn(4, char::is_whitespace);
        let timestamp = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| parse_error("missing timestamp"))?
            .parse::<f64>()
            .map_err(|_| parse_error("timestamp is not a number"))?;
        if !timestamp.is_finite() {
            return Err(parse_error("timestamp is not finite"));
        }
        let app_id = parts.next().ok_or_else(|| parse_error("missing app id"))?;
        let context_id = parts
            .next()
            .ok_or_else(|| parse_error("missing context id"))?;
        let payload = parts.next().unwrap_or("").trim_start();

        Ok(Self::new(timestamp, app_id, context_id, payload))
    }

    /// Whether a line carries no record (blank or `#` comment)
    pub fn is_skippable_line(line: &str) -> bool {
        let trimmed = line.trim();
        trimmed.is_empty() || trimmed.starts_with('#')
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.6} {} {} {}",
            self.timestamp, self.app_id, self.context_id, self.payload
        )
    }
}

/// Broker-level subscription criterion
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelFilter {
    pub app_id: String,
    pub context_id: String,
}

impl ChannelFilter {
    pub fn new(app_id: impl Into<String>, context_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            context_id: context_id.into(),
        }
    }

    pub fn accepts(&self, record: &LogRecord) -> bool {
        self.app_id == record.app_id && self.context_id == record.context_id
    }
}

/// Whether `record` passes a subscription's criteria (empty criteria accept everything)
pub fn criteria_accept(criteria: &[ChannelFilter], record: &LogRecord) -> bool {
    criteria.is_empty() || criteria.iter().any(|c| c.accepts(record))
}

/// Scoped, pull-based sequence of log records
pub trait TraceStream {
    /// Next record, waiting at most `timeout`; `None` when nothing arrived in time
    fn next_available(&mut self, timeout: Duration) -> Option<LogRecord>;

    /// `true` once the stream can never yield another record
    fn is_exhausted(&self) -> bool {
        false
    }
}

impl<S: TraceStream + ?Sized> TraceStream for &mut S {
    fn next_available(&mut self, timeout: Duration) -> Option<LogRecord> {
        (**self).next_available(timeout)
    }

    fn is_exhausted(&self) -> bool {
        (**self).is_exhausted()
    }
}

impl<S: TraceStream + ?Sized> TraceStream for Box<S> {
    fn next_available(&mut self, timeout: Duration) -> Option<LogRecord> {
        (**self).next_available(timeout)
    }

    fn is_exhausted(&self) -> bool {
        (**self).is_exhausted()
    }
}

/// Source of scoped trace subscriptions
pub trait TraceBroker {
    type Stream: TraceStream;

    /// Subscribe to records matching any of `criteria` (all records when empty)
    fn subscribe(&self, criteria: &[ChannelFilter]) -> Result<Self::Stream>;
}
