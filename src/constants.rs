//! Centralized control-plane constants.
//!
//! Defaults for the tunables live here so configuration profiles, the
//! environment loader and tests agree on them.
//!
//! # Categories
//!
//! - **Naming**: namespaces and metric prefixes
//! - **Planner**: disk thresholds and concurrency caps
//! - **Reconciler**: retry and timeout defaults
//! - **Leader balancer**: tolerance and lag limits

// =============================================================================
// Naming
// =============================================================================

/// Namespace used for user topics when none is given.
pub const DEFAULT_NAMESPACE: &str = "kafka";

/// Prefix for every exported metric.
pub const METRICS_PREFIX: &str = "shardctl";

// =============================================================================
// Planner
// =============================================================================

/// Disk usage ratio above which a node takes part in disk balancing.
pub const DEFAULT_DISK_SOFT_THRESHOLD: f64 = 0.80;

/// Disk usage ratio above which a node is evacuated.
pub const DEFAULT_DISK_HARD_THRESHOLD: f64 = 0.95;

/// Maximum number of reconfigurations the planner keeps in flight.
pub const DEFAULT_MAX_CONCURRENT_RECONFIGURATIONS: usize = 50;

/// How often the planner runs when nothing triggers it (seconds).
pub const DEFAULT_PLANNER_INTERVAL_SECS: u64 = 30;

/// How long a node must be unreachable before its replicas are moved (seconds).
pub const DEFAULT_NODE_AVAILABILITY_TIMEOUT_SECS: u64 = 900;

/// Heartbeat silence after which a node is considered dead (milliseconds).
pub const DEFAULT_NODE_LIVENESS_TIMEOUT_MS: u64 = 10_000;

// =============================================================================
// Reconciler
// =============================================================================

/// Retries allowed per operation before it is marked failed.
pub const DEFAULT_RETRY_CEILING: usize = 8;

/// First retry delay (milliseconds).
pub const DEFAULT_RETRY_MIN_DELAY_MS: u64 = 100;

/// Largest retry delay (milliseconds).
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Timeout for a single dispatch request to a node (milliseconds).
pub const DEFAULT_DISPATCH_TIMEOUT_MS: u64 = 5_000;

/// Time an accepted operation may stay unreported before it is retried
/// (milliseconds).
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 60_000;

/// Dispatch requests sent concurrently per reconciliation tick.
pub const DEFAULT_MAX_CONCURRENT_DISPATCHES: usize = 64;

/// Interval of the reconciliation driver (milliseconds).
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 250;

// =============================================================================
// Leader balancer
// =============================================================================

/// Leader count difference between two cores that is tolerated.
pub const DEFAULT_LEADER_TOLERANCE: f64 = 1.0;

/// Leadership transfers issued per leader balancer pass.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 64;

/// Largest offset lag a follower may have and still receive leadership.
pub const DEFAULT_MAX_FOLLOWER_LAG: i64 = 1_000;

/// How often the leader balancer runs (seconds).
pub const DEFAULT_LEADER_BALANCER_INTERVAL_SECS: u64 = 60;

/// Minimum time between two balancer-driven transfers of the same partition
/// (seconds).
pub const DEFAULT_TRANSFER_COOLDOWN_SECS: u64 = 300;
