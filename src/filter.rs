//! # Filter Specifications
//!
//! A [`FilterSpec`] describes one expected log milestone: a regular expression over the
//! payload, optional `(app_id, context_id)` constraints, and the waiting semantics used
//! by [`TraceMatcher`](crate::matcher::TraceMatcher):
//!
//! - `count > 0`: stop as soon as `count` matches were seen
//! - `count == 0`: collect every match until the timeout elapses
//! - `drop`: discard non-matching records instead of retaining them for diagnostics
//!
//! Specs are validated when they are built. An invalid regex or a negative count in a
//! [`FilterConfig`] is a [`KpiError::Configuration`], never a failure mid-wait.

use crate::error::{KpiError, Result};
use crate::trace::{ChannelFilter, LogRecord};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;
use std::time::Duration;

/// Default number of matches required
pub const DEFAULT_COUNT: usize = 1;

/// Validated filter over log records
#[derive(Debug, Clone)]
pub struct FilterSpec {
    pattern: Regex,
    app_id: Option<String>,
    context_id: Option<String>,
    count: usize,
    drop: bool,
    timeout: Duration,
    raise_on_timeout: bool,
    raise_on_empty: bool,
    label: Option<String>,
}

impl FilterSpec {
    /// Filter with default semantics: one match, drop non-matching, raise on timeout
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| KpiError::config(format!("invalid pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            pattern,
            app_id: None,
            context_id: None,
            count: DEFAULT_COUNT,
            drop: true,
            timeout: crate::defaults::DLT_WAIT_TIMEOUT,
            raise_on_timeout: true,
            raise_on_empty: false,
            label: None,
        })
    }

    pub fn with_channel(mut self, app_id: impl Into<String>, context_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self.context_id = Some(context_id.into());
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Number of matches required; `0` collects everything until the timeout
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_drop(mut self, drop: bool) -> Self {
        self.drop = drop;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_raise_on_timeout(mut self, raise: bool) -> Self {
        self.raise_on_timeout = raise;
        self
    }

    /// In collect-all mode, fail when nothing matched before the timeout
    pub fn with_raise_on_empty(mut self, raise: bool) -> Self {
        self.raise_on_empty = raise;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn regex(&self) -> &Regex {
        &self.pattern
    }

    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    pub fn context_id(&self) -> Option<&str> {
        self.context_id.as_deref()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn collects_all(&self) -> bool {
        self.count == 0
    }

    pub fn drops_non_matching(&self) -> bool {
        self.drop
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn raises_on_timeout(&self) -> bool {
        self.raise_on_timeout
    }

    pub fn raises_on_empty(&self) -> bool {
        self.raise_on_empty
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Label when set, otherwise the pattern
    pub fn name(&self) -> &str {
        self.label.as_deref().unwrap_or_else(|| self.pattern.as_str())
    }

    /// Broker-level criterion, available when both ids are constrained
    pub fn channel_filter(&self) -> Option<ChannelFilter> {
        match (&self.app_id, &self.context_id) {
            (Some(app_id), Some(context_id)) => Some(ChannelFilter::new(app_id, context_id)),
            _ => None,
        }
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(app_id) = &self.app_id {
            if *app_id != record.app_id {
                return false;
            }
        }
        if let Some(context_id) = &self.context_id {
            if *context_id != record.context_id {
                return false;
            }
        }
        self.pattern.is_match(&record.payload)
    }

    /// First capture group of the pattern, parsed as a number
    pub fn captured_value(&self, record: &LogRecord) -> Option<f64> {
        self.pattern
            .captures(&record.payload)?
            .iter()
            .skip(1)
            .flatten()
            .next()?
            .as_str()
            .trim()
            .parse()
            .ok()
    }

    /// Named capture groups of the pattern that participated in the match
    pub fn named_captures(&self, record: &LogRecord) -> HashMap<String, String> {
        let mut named = HashMap::new();
        if let Some(captures) = self.pattern.captures(&record.payload) {
            for name in self.pattern.capture_names().flatten() {
                if let Some(value) = captures.name(name) {
                    named.insert(name.to_string(), value.as_str().to_string());
                }
            }
        }
        named
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.pattern.as_str())?;
        if let (Some(app_id), Some(context_id)) = (&self.app_id, &self.context_id) {
            write!(f, " on {}/{}", app_id, context_id)?;
        }
        Ok(())
    }
}

fn default_count() -> i64 {
    DEFAULT_COUNT as i64
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> f64 {
    crate::defaults::DLT_WAIT_TIMEOUT.as_secs_f64()
}

/// Serialized form of a [`FilterSpec`], as found in catalogs and test fixtures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default = "default_count")]
    pub count: i64,
    #[serde(default = "default_true")]
    pub drop: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default = "default_true")]
    pub raise_on_timeout: bool,
    #[serde(default)]
    pub raise_on_empty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl FilterConfig {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            app_id: None,
            context_id: None,
            count: default_count(),
            drop: true,
            timeout_secs: default_timeout_secs(),
            raise_on_timeout: true,
            raise_on_empty: false,
            label: None,
        }
    }
}

impl TryFrom<FilterConfig> for FilterSpec {
    type Error = KpiError;

    fn try_from(config: FilterConfig) -> Result<Self> {
        if config.count < 0 {
            return Err(KpiError::config(format!(
                "count for '{}' must be >= 0, got {}",
                config.pattern, config.count
            )));
        }
        if !config.timeout_secs.is_finite() || config.timeout_secs < 0.0 {
            return Err(KpiError::config(format!(
                "timeout for '{}' must be a non-negative number of seconds, got {}",
                config.pattern, config.timeout_secs
            )));
        }
        let timeout = Duration::try_from_secs_f64(config.timeout_secs).map_err(|e| {
            KpiError::config(format!(
                "timeout for '{}' is out of range, got {}: {}",
                config.pattern, config.timeout_secs, e
            ))
        })?;

        let mut spec = FilterSpec::new(&config.pattern)?
            .with_count(config.count as usize)
            .with_drop(config.drop)
            .with_timeout(timeout)
            .with_raise_on_timeout(config.raise_on_timeout)
            .with_raise_on_empty(config.raise_on_empty);
        if let Some(app_id) = config.app_id {
            spec = spec.with_app_id(app_id);
        }
        if let Some(context_id) = config.context_id {
            spec = spec.with_context_id(context_id);
        }
        if let Some(label) = config.label {
            spec = spec.with_label(label);
        }
        Ok(spec)
    }
}
