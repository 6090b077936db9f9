//! # Target Availability
//!
//! Measures how long a target takes to answer diagnostics and to become reachable on the
//! network after an ECU reset. Both countdowns start together right after the reset; the
//! UDS probe is polled first, then reachability against what is left of the network
//! countdown.

use crate::clock::SharedClock;
use crate::error::Result;
use crate::kpi::publish_kpi;
use crate::metrics::MetricsSink;
use crate::poller::{Poller, PollerConfig};
use crate::response_log::KpiResponseLog;
use crate::thresholds::{TargetKind, TargetThresholds, ThresholdTable};
use crate::timeout::TimeoutCondition;
use std::fmt::Debug;
use std::time::Duration;
use tracing::info;

pub const UDS_STARTUP_METRIC: &str = "uds_startup";
pub const TARGET_REACHABLE_METRIC: &str = "target_reachable";

/// Control surface of the device under test
///
/// Transient communication problems are reported as
/// [`KpiError::Transport`](crate::error::KpiError::Transport) so the poller retries them.
pub trait TargetControl {
    type Payload: Debug;

    /// Diagnostic probe; `Ok(None)` when the target answered with nothing usable
    fn probe(&mut self) -> Result<Option<Self::Payload>>;

    fn reset(&mut self) -> Result<()>;

    fn is_reachable(&mut self) -> Result<bool>;
}

/// Metric name for `base`, suffixed with the reset cycle when there is one
pub fn cycle_metric_name(base: &str, cycle: Option<usize>) -> String {
    match cycle {
        Some(n) => format!("{}_consecutive_reset{}", base, n),
        None => base.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct AvailabilityReport<P> {
    pub uds_startup: Duration,
    pub target_reachable: Duration,
    pub uds_log: KpiResponseLog<P>,
    pub reachability_log: KpiResponseLog<()>,
}

/// Reset-and-measure scenario for one target family
#[derive(Debug, Clone)]
pub struct AvailabilityCheck {
    kind: TargetKind,
    limits: TargetThresholds,
    poller_config: PollerConfig,
    thresholds: ThresholdTable,
    branch: String,
    clock: SharedClock,
}

impl AvailabilityCheck {
    pub fn new(kind: TargetKind, clock: SharedClock) -> Self {
        Self {
            kind,
            limits: kind.thresholds(),
            poller_config: PollerConfig::for_target(kind),
            thresholds: ThresholdTable::new(),
            branch: crate::defaults::BRANCH.to_string(),
            clock,
        }
    }

    pub fn with_poller_config(mut self, config: PollerConfig) -> Self {
        self.poller_config = config;
        self
    }

    pub fn with_thresholds(mut self, thresholds: ThresholdTable, branch: impl Into<String>) -> Self {
        self.thresholds = thresholds;
        self.branch = branch.into();
        self
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// Reset `target`, measure both startup times, publish them, then check the limits
    pub fn run<T: TargetControl>(
        &self,
        target: &mut T,
        cycle: Option<usize>,
        sink: &dyn MetricsSink,
    ) -> Result<AvailabilityReport<T::Payload>> {
        let uds_poller = Poller::new(
            PollerConfig {
                timeout: self.limits.uds_request_timeout,
                ..self.poller_config
            },
            self.clock.clone(),
        )?;
        let network_poller = Poller::new(
            PollerConfig {
                minimum_settle_time: Duration::ZERO,
                timeout: self.limits.target_connected_timeout,
                ..self.poller_config
            },
            self.clock.clone(),
        )?;

        info!("Resetting {} target", self.kind);
        target.reset()?;
        let uds_condition = TimeoutCondition::new(self.limits.uds_request_timeout, self.clock.clone());
        let network_condition =
            TimeoutCondition::new(self.limits.target_connected_timeout, self.clock.clone());

        let uds = uds_poller.poll_within(&uds_condition, || target.probe())?;
        let uds_metric = cycle_metric_name(UDS_STARTUP_METRIC, cycle);
        if let Some(elapsed) = uds.qualified_at {
            publish_kpi(sink, &self.thresholds, &self.branch, &uds_metric, elapsed.as_secs_f64());
        }

        let reachability = network_poller.poll_within(&network_condition, || {
            target.is_reachable().map(|reachable| if reachable { Some(()) } else { None })
        })?;
        let reachable_metric = cycle_metric_name(TARGET_REACHABLE_METRIC, cycle);
        if let Some(elapsed) = reachability.qualified_at {
            publish_kpi(
                sink,
                &self.thresholds,
                &self.branch,
                &reachable_metric,
                elapsed.as_secs_f64(),
            );
        }

        let uds_startup = uds
            .log
            .check_window(self.poller_config.minimum_settle_time, self.limits.uds_request_timeout)?;
        let (target_reachable, reachability_log) = reachability.into_result()?;

        info!(
            "{} available after {:.3}s, reachable after {:.3}s",
            self.kind,
            uds_startup.as_secs_f64(),
            target_reachable.as_secs_f64()
        );
        Ok(AvailabilityReport {
            uds_startup,
            target_reachable,
            uds_log: uds.log,
            reachability_log,
        })
    }
}
