//! Prometheus metrics for the control plane.
//!
//! Metrics cover:
//! - Reconfigurations (in progress, finished by outcome)
//! - Reconciliation operations (dispatched, retried, failed per kind)
//! - Planner passes and allocation failures
//! - Leadership transfers issued by the leader balancer
//! - Node lifecycle (decommissions and maintenance in progress)
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the `shardctl` prefix to
//! avoid collisions with the default Prometheus registry. If registration fails
//! the metric still works, it is just missing from the registry.

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder, opts,
};
use tracing::warn;

use crate::constants::METRICS_PREFIX;

/// Custom Prometheus registry for control-plane metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some(METRICS_PREFIX.to_string()), None).unwrap_or_else(|_| Registry::new())
});

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register($metric_name, IntGauge::new($metric_name, $help)));
    };
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register($metric_name, IntCounter::new($metric_name, $help)));
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register(
                $metric_name,
                IntCounterVec::new(opts!($metric_name, $help), &[$($label),+]),
            )
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register(
                $metric_name,
                HistogramVec::new(
                    HistogramOpts::new($metric_name, $help).buckets(vec![$($bucket),+]),
                    &[$($label),+],
                ),
            )
        });
    };
}

// =============================================================================
// Reconfiguration metrics
// =============================================================================

define_gauge!(
    RECONFIGURATIONS_IN_PROGRESS,
    "reconfigurations_in_progress",
    "Number of partitions with an active reconfiguration"
);
define_counter_vec!(
    RECONFIGURATIONS_FINISHED,
    "reconfigurations_finished_total",
    "Reconfigurations that reached a terminal state",
    ["outcome"]
);
define_histogram_vec!(
    RECONFIGURATION_DURATION,
    "reconfiguration_duration_seconds",
    "Time from reconfiguration start to terminal state",
    ["outcome"],
    [0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]
);

// =============================================================================
// Operation metrics
// =============================================================================

define_counter_vec!(
    OPERATIONS_DISPATCHED,
    "operations_dispatched_total",
    "Reconciliation operations sent to nodes",
    ["kind", "status"]
);
define_counter_vec!(
    OPERATION_RETRIES,
    "operation_retries_total",
    "Scheduled retries of reconciliation operations",
    ["kind", "status"]
);
define_counter!(
    STALE_REPORTS_DROPPED,
    "stale_reports_dropped_total",
    "Operation reports discarded because of a revision mismatch"
);

// =============================================================================
// Planner metrics
// =============================================================================

define_counter_vec!(
    PLANNER_PASSES,
    "planner_passes_total",
    "Balancer planner passes by resulting status",
    ["status"]
);
define_counter!(
    ALLOCATION_FAILURES,
    "allocation_failures_total",
    "Partitions for which no valid placement was found"
);
define_counter!(
    RACK_VIOLATIONS,
    "rack_constraint_violations_total",
    "Placements that had to put two replicas in one rack"
);

// =============================================================================
// Leadership and lifecycle metrics
// =============================================================================

define_counter_vec!(
    LEADERSHIP_TRANSFERS,
    "leadership_transfers_total",
    "Leadership transfers requested",
    ["source"]
);
define_gauge!(
    DECOMMISSIONS_IN_PROGRESS,
    "decommissions_in_progress",
    "Nodes currently being decommissioned"
);
define_gauge!(
    NODES_IN_MAINTENANCE,
    "nodes_in_maintenance",
    "Nodes currently in maintenance mode"
);
define_gauge!(IS_CONTROLLER_LEADER, "is_leader", "1 when this instance drives the cluster");

/// Register `metric` on [`REGISTRY`].
///
/// A registration conflict is logged and the metric is returned unregistered,
/// so recording through it still works.
fn register<M>(name: &str, metric: prometheus::Result<M>) -> M
where
    M: Collector + Clone + 'static,
{
    let metric = metric.expect("static metric definitions are valid");
    if let Err(e) = REGISTRY.register(Box::new(metric.clone())) {
        warn!(name, error = %e, "Metric registration failed, recording unregistered");
    }
    metric
}

/// Force registration of every metric so they show up before first use.
pub fn init_metrics() {
    let _ = &*RECONFIGURATIONS_IN_PROGRESS;
    let _ = &*RECONFIGURATIONS_FINISHED;
    let _ = &*RECONFIGURATION_DURATION;
    let _ = &*OPERATIONS_DISPATCHED;
    let _ = &*OPERATION_RETRIES;
    let _ = &*STALE_REPORTS_DROPPED;
    let _ = &*PLANNER_PASSES;
    let _ = &*ALLOCATION_FAILURES;
    let _ = &*RACK_VIOLATIONS;
    let _ = &*LEADERSHIP_TRANSFERS;
    let _ = &*DECOMMISSIONS_IN_PROGRESS;
    let _ = &*NODES_IN_MAINTENANCE;
    let _ = &*IS_CONTROLLER_LEADER;
}

/// Render the registry in the Prometheus text exposition format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let mut text = Vec::new();
    TextEncoder::new().encode(&gather_metrics(), &mut text)?;
    Ok(String::from_utf8(text)?)
}

pub fn gather_metrics() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

pub fn record_operation_dispatched(kind: &str, accepted: bool) {
    let status = if accepted { "accepted" } else { "error" };
    OPERATIONS_DISPATCHED.with_label_values(&[kind, status]).inc();
}

pub fn record_reconfiguration_finished(outcome: &str, duration_secs: f64) {
    RECONFIGURATIONS_FINISHED.with_label_values(&[outcome]).inc();
    RECONFIGURATION_DURATION
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

pub fn set_reconfigurations_in_progress(count: usize) {
    RECONFIGURATIONS_IN_PROGRESS.set(count as i64);
}

pub fn record_stale_report() {
    STALE_REPORTS_DROPPED.inc();
}

pub fn record_planner_pass(status: &str, allocation_failures: usize) {
    PLANNER_PASSES.with_label_values(&[status]).inc();
    ALLOCATION_FAILURES.inc_by(allocation_failures as u64);
}

pub fn record_rack_violation() {
    RACK_VIOLATIONS.inc();
}

pub fn record_leadership_transfer(source: &str) {
    LEADERSHIP_TRANSFERS.with_label_values(&[source]).inc();
}

pub fn set_lifecycle_gauges(decommissioning: usize, maintenance: usize) {
    DECOMMISSIONS_IN_PROGRESS.set(decommissioning as i64);
    NODES_IN_MAINTENANCE.set(maintenance as i64);
}

pub fn set_controller_leader(is_leader: bool) {
    IS_CONTROLLER_LEADER.set(i64::from(is_leader));
}
