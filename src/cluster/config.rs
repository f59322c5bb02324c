//! Configuration for the cluster control plane.
//!
//! # Configuration Profiles
//!
//! Instead of tuning every planner and reconciler knob, start from a profile:
//!
//! ```rust,no_run
//! use shardctl::cluster::{ControllerConfig, ControllerProfile};
//!
//! // Development profile - short intervals, deterministic retries
//! let dev_config = ControllerConfig::from_profile(ControllerProfile::Development);
//!
//! // Production profile - conservative concurrency and long availability timeout
//! let prod_config = ControllerConfig::from_profile(ControllerProfile::Production);
//!
//! // Large-cluster profile - more concurrent moves and transfers per pass
//! let large_config = ControllerConfig::from_profile(ControllerProfile::LargeCluster);
//! ```

use std::time::Duration;

use crate::cluster::error::{ControllerError, ControllerResult};
use crate::constants::{
    DEFAULT_DISK_HARD_THRESHOLD, DEFAULT_DISK_SOFT_THRESHOLD, DEFAULT_DISPATCH_TIMEOUT_MS,
    DEFAULT_LEADER_BALANCER_INTERVAL_SECS, DEFAULT_LEADER_TOLERANCE,
    DEFAULT_MAX_CONCURRENT_DISPATCHES, DEFAULT_MAX_CONCURRENT_RECONFIGURATIONS,
    DEFAULT_MAX_CONCURRENT_TRANSFERS, DEFAULT_MAX_FOLLOWER_LAG,
    DEFAULT_NODE_AVAILABILITY_TIMEOUT_SECS, DEFAULT_NODE_LIVENESS_TIMEOUT_MS,
    DEFAULT_OPERATION_TIMEOUT_MS, DEFAULT_PLANNER_INTERVAL_SECS, DEFAULT_RETRY_CEILING,
    DEFAULT_RETRY_MAX_DELAY_MS, DEFAULT_RETRY_MIN_DELAY_MS, DEFAULT_TICK_INTERVAL_MS,
    DEFAULT_TRANSFER_COOLDOWN_SECS,
};
use crate::types::NodeId;

/// Validated configuration profiles.
///
/// | Profile | Use Case | Concurrency | Evacuation delay |
/// |---------|----------|-------------|------------------|
/// | Development | Local testing | Low | Seconds |
/// | Production | General clusters | Standard | 15 minutes |
/// | LargeCluster | Hundreds of nodes | High | 15 minutes |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerProfile {
    /// Short intervals and no retry jitter, so tests and local runs are
    /// reproducible.
    ///
    /// **Not suitable for production use.**
    Development,

    /// Recommended for most deployments.
    Production,

    /// Raises the reconfiguration and transfer caps for clusters with many
    /// partitions. Needs a consensus layer that can absorb the extra churn.
    LargeCluster,
}

impl ControllerProfile {
    pub fn description(&self) -> &'static str {
        match self {
            ControllerProfile::Development => "Local development and testing",
            ControllerProfile::Production => "Balanced production clusters",
            ControllerProfile::LargeCluster => "Large clusters with many partitions",
        }
    }

    pub fn all() -> &'static [ControllerProfile] {
        &[
            ControllerProfile::Development,
            ControllerProfile::Production,
            ControllerProfile::LargeCluster,
        ]
    }
}

impl std::fmt::Display for ControllerProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerProfile::Development => write!(f, "development"),
            ControllerProfile::Production => write!(f, "production"),
            ControllerProfile::LargeCluster => write!(f, "large-cluster"),
        }
    }
}

impl std::str::FromStr for ControllerProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(ControllerProfile::Development),
            "production" | "prod" => Ok(ControllerProfile::Production),
            "large-cluster" | "large" => Ok(ControllerProfile::LargeCluster),
            _ => Err(format!(
                "Unknown profile '{}'. Valid profiles: development, production, large-cluster",
                s
            )),
        }
    }
}

/// Placement scoring knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorConfig {
    /// Spread replicas of a partition across racks when possible.
    pub rack_awareness: bool,

    /// Weight of disk usage in the node score, in [0, 1]. The remainder goes
    /// to partitions-per-core.
    pub disk_weight: f64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            rack_awareness: true,
            disk_weight: 0.5,
        }
    }
}

/// Balancer planner knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerConfig {
    /// When false the planner reports `Off` and proposes nothing.
    pub enabled: bool,

    /// Interval between periodic passes.
    pub interval: Duration,

    /// Upper bound on reconfigurations in flight at once.
    pub max_concurrent_reconfigurations: usize,

    /// Disk usage above which a node takes part in disk balancing.
    pub disk_soft_threshold: f64,

    /// Disk usage above which a node is evacuated.
    pub disk_hard_threshold: f64,

    /// Smallest drop in disk-usage variance a balancing move must achieve.
    pub min_variance_improvement: f64,

    /// How long a dead node is tolerated before its replicas are moved away.
    pub node_availability_timeout: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(DEFAULT_PLANNER_INTERVAL_SECS),
            max_concurrent_reconfigurations: DEFAULT_MAX_CONCURRENT_RECONFIGURATIONS,
            disk_soft_threshold: DEFAULT_DISK_SOFT_THRESHOLD,
            disk_hard_threshold: DEFAULT_DISK_HARD_THRESHOLD,
            min_variance_improvement: 0.0,
            node_availability_timeout: Duration::from_secs(DEFAULT_NODE_AVAILABILITY_TIMEOUT_SECS),
        }
    }
}

/// Scheduled-retry knobs for reconciliation operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Retries allowed before an operation is marked failed.
    pub retry_ceiling: usize,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(DEFAULT_RETRY_MIN_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            retry_ceiling: DEFAULT_RETRY_CEILING,
            jitter: true,
        }
    }
}

/// Reconciler knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    pub retry: RetryConfig,

    /// Timeout of one dispatch request to a node.
    pub dispatch_timeout: Duration,

    /// Time an accepted operation may stay unreported before it is retried.
    pub operation_timeout: Duration,

    /// Dispatch requests in flight per tick.
    pub max_concurrent_dispatches: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            dispatch_timeout: Duration::from_millis(DEFAULT_DISPATCH_TIMEOUT_MS),
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            max_concurrent_dispatches: DEFAULT_MAX_CONCURRENT_DISPATCHES,
        }
    }
}

/// Leader balancer knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderBalancerConfig {
    pub enabled: bool,
    pub interval: Duration,

    /// Leader count difference between two cores that is tolerated.
    pub tolerance: f64,

    /// Transfers issued per pass.
    pub max_concurrent_transfers: usize,

    /// Largest offset lag a follower may have and still receive leadership.
    pub max_follower_lag: i64,

    /// Minimum time between two balancer transfers of the same partition.
    pub transfer_cooldown: Duration,
}

impl Default for LeaderBalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(DEFAULT_LEADER_BALANCER_INTERVAL_SECS),
            tolerance: DEFAULT_LEADER_TOLERANCE,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            max_follower_lag: DEFAULT_MAX_FOLLOWER_LAG,
            transfer_cooldown: Duration::from_secs(DEFAULT_TRANSFER_COOLDOWN_SECS),
        }
    }
}

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Id of the node this controller instance runs on.
    pub node_id: NodeId,

    pub allocator: AllocatorConfig,
    pub planner: PlannerConfig,
    pub reconciler: ReconcilerConfig,
    pub leader_balancer: LeaderBalancerConfig,

    /// Heartbeat silence after which a node is marked dead.
    pub node_liveness_timeout: Duration,

    /// Interval of the reconciliation driver.
    pub tick_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(0),
            allocator: AllocatorConfig::default(),
            planner: PlannerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            leader_balancer: LeaderBalancerConfig::default(),
            node_liveness_timeout: Duration::from_millis(DEFAULT_NODE_LIVENESS_TIMEOUT_MS),
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
        }
    }
}

impl ControllerConfig {
    /// Create a configuration from a validated profile.
    pub fn from_profile(profile: ControllerProfile) -> Self {
        let defaults = Self::default();
        match profile {
            ControllerProfile::Development => Self {
                planner: PlannerConfig {
                    interval: Duration::from_secs(5),
                    max_concurrent_reconfigurations: 8,
                    node_availability_timeout: Duration::from_secs(30),
                    ..defaults.planner
                },
                reconciler: ReconcilerConfig {
                    retry: RetryConfig {
                        min_delay: Duration::from_millis(10),
                        max_delay: Duration::from_millis(500),
                        retry_ceiling: 5,
                        jitter: false,
                    },
                    dispatch_timeout: Duration::from_secs(1),
                    operation_timeout: Duration::from_secs(10),
                    max_concurrent_dispatches: 8,
                },
                leader_balancer: LeaderBalancerConfig {
                    interval: Duration::from_secs(10),
                    transfer_cooldown: Duration::from_secs(10),
                    ..defaults.leader_balancer
                },
                node_liveness_timeout: Duration::from_secs(3),
                tick_interval: Duration::from_millis(50),
                ..defaults
            },
            ControllerProfile::Production => defaults,
            ControllerProfile::LargeCluster => Self {
                planner: PlannerConfig {
                    max_concurrent_reconfigurations: 200,
                    min_variance_improvement: 1e-4,
                    ..defaults.planner
                },
                reconciler: ReconcilerConfig {
                    max_concurrent_dispatches: 256,
                    ..defaults.reconciler
                },
                leader_balancer: LeaderBalancerConfig {
                    max_concurrent_transfers: 256,
                    ..defaults.leader_balancer
                },
                ..defaults
            },
        }
    }

    /// Reads `CONTROLLER_PROFILE` and falls back to Production when unset or
    /// invalid.
    pub fn from_profile_env() -> Self {
        let profile = std::env::var("CONTROLLER_PROFILE")
            .ok()
            .and_then(|s| s.parse::<ControllerProfile>().ok())
            .unwrap_or(ControllerProfile::Production);

        tracing::info!(
            profile = %profile,
            description = profile.description(),
            "Using controller profile"
        );
        Self::from_profile(profile)
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.node_id.is_valid() {
            errors.push(format!("node_id ({}) must be non-negative", self.node_id));
        }

        let planner = &self.planner;
        for (name, value) in [
            ("disk_soft_threshold", planner.disk_soft_threshold),
            ("disk_hard_threshold", planner.disk_hard_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                errors.push(format!("{} ({}) must be in (0, 1]", name, value));
            }
        }
        if planner.disk_soft_threshold >= planner.disk_hard_threshold {
            errors.push(format!(
                "disk_soft_threshold ({}) must be less than disk_hard_threshold ({})",
                planner.disk_soft_threshold, planner.disk_hard_threshold
            ));
        }
        if planner.max_concurrent_reconfigurations == 0 {
            errors.push("max_concurrent_reconfigurations must be at least 1".to_string());
        }
        if planner.min_variance_improvement < 0.0 {
            errors.push(format!(
                "min_variance_improvement ({}) must not be negative",
                planner.min_variance_improvement
            ));
        }
        if planner.interval.is_zero() {
            errors.push("planner interval must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.allocator.disk_weight) {
            errors.push(format!(
                "disk_weight ({}) must be in [0, 1]",
                self.allocator.disk_weight
            ));
        }

        let retry = &self.reconciler.retry;
        if retry.retry_ceiling == 0 {
            errors.push("retry_ceiling must be at least 1".to_string());
        }
        if retry.min_delay > retry.max_delay {
            errors.push(format!(
                "retry min_delay ({:?}) must not exceed max_delay ({:?})",
                retry.min_delay, retry.max_delay
            ));
        }
        if self.reconciler.max_concurrent_dispatches == 0 {
            errors.push("max_concurrent_dispatches must be at least 1".to_string());
        }
        if self.reconciler.dispatch_timeout.is_zero() {
            errors.push("dispatch_timeout must be greater than 0".to_string());
        }
        if self.reconciler.operation_timeout < self.reconciler.dispatch_timeout {
            errors.push(format!(
                "operation_timeout ({:?}) must not be shorter than dispatch_timeout ({:?})",
                self.reconciler.operation_timeout, self.reconciler.dispatch_timeout
            ));
        }

        let leaders = &self.leader_balancer;
        if leaders.tolerance < 0.0 {
            errors.push(format!(
                "leader balancer tolerance ({}) must not be negative",
                leaders.tolerance
            ));
        }
        if leaders.max_concurrent_transfers == 0 {
            errors.push("max_concurrent_transfers must be at least 1".to_string());
        }
        if leaders.max_follower_lag < 0 {
            errors.push(format!(
                "max_follower_lag ({}) must not be negative",
                leaders.max_follower_lag
            ));
        }

        if self.node_liveness_timeout.is_zero() {
            errors.push("node_liveness_timeout must be greater than 0".to_string());
        }
        if self.tick_interval.is_zero() {
            errors.push("tick_interval must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Create configuration from environment variables on top of the profile
    /// named by `CONTROLLER_PROFILE`.
    ///
    /// Environment variables:
    /// - `CONTROLLER_NODE_ID`: Node id of this instance (default: 0)
    /// - `CONTROLLER_PROFILE`: development, production or large-cluster
    /// - `MAX_CONCURRENT_RECONFIGURATIONS`: Planner concurrency cap
    /// - `DISK_SOFT_THRESHOLD` / `DISK_HARD_THRESHOLD`: Usage ratios in (0, 1]
    /// - `RACK_AWARENESS`: "true" or "false"
    /// - `RETRY_CEILING`: Retries per operation before it is marked failed
    /// - `LEADER_BALANCER_TOLERANCE`: Tolerated leader count difference
    /// - `MAX_FOLLOWER_LAG`: Lag limit for leadership targets
    /// - `PLANNER_INTERVAL_MS`: Interval between planner passes
    /// - `NODE_LIVENESS_TIMEOUT_MS`: Heartbeat silence before a node is dead
    pub fn from_env() -> ControllerResult<Self> {
        let mut config = match std::env::var("CONTROLLER_PROFILE") {
            Ok(raw) => Self::from_profile(raw.parse().map_err(ControllerError::Config)?),
            Err(_) => Self::default(),
        };

        if let Some(node_id) = env_parse::<i32>("CONTROLLER_NODE_ID")? {
            if node_id < 0 {
                return Err(ControllerError::Config(
                    "CONTROLLER_NODE_ID must be non-negative".to_string(),
                ));
            }
            config.node_id = NodeId(node_id);
        }
        if let Some(v) = env_parse("MAX_CONCURRENT_RECONFIGURATIONS")? {
            config.planner.max_concurrent_reconfigurations = v;
        }
        if let Some(v) = env_parse("DISK_SOFT_THRESHOLD")? {
            config.planner.disk_soft_threshold = v;
        }
        if let Some(v) = env_parse("DISK_HARD_THRESHOLD")? {
            config.planner.disk_hard_threshold = v;
        }
        if let Some(v) = env_parse("RACK_AWARENESS")? {
            config.allocator.rack_awareness = v;
        }
        if let Some(v) = env_parse("RETRY_CEILING")? {
            config.reconciler.retry.retry_ceiling = v;
        }
        if let Some(v) = env_parse("LEADER_BALANCER_TOLERANCE")? {
            config.leader_balancer.tolerance = v;
        }
        if let Some(v) = env_parse("MAX_FOLLOWER_LAG")? {
            config.leader_balancer.max_follower_lag = v;
        }
        if let Some(ms) = env_parse("PLANNER_INTERVAL_MS")? {
            config.planner.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("NODE_LIVENESS_TIMEOUT_MS")? {
            config.node_liveness_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

/// Parse an optional environment variable, naming it in the error.
fn env_parse<T>(name: &str) -> ControllerResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ControllerError::Config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_all_profiles_are_valid() {
        for profile in ControllerProfile::all() {
            let config = ControllerConfig::from_profile(*profile);
            assert!(
                config.validate().is_ok(),
                "profile {} should be valid: {:?}",
                profile,
                config.validate()
            );
        }
    }

    #[test]
    fn test_profile_parse_and_display() {
        for profile in ControllerProfile::all() {
            let parsed: ControllerProfile = profile.to_string().parse().unwrap();
            assert_eq!(parsed, *profile);
        }
        assert_eq!(
            "dev".parse::<ControllerProfile>().unwrap(),
            ControllerProfile::Development
        );
        assert!("turbo".parse::<ControllerProfile>().is_err());
    }

    #[test]
    fn test_development_disables_jitter() {
        let config = ControllerConfig::from_profile(ControllerProfile::Development);
        assert!(!config.reconciler.retry.jitter);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = ControllerConfig::default();
        config.planner.disk_soft_threshold = 0.99;
        config.planner.disk_hard_threshold = 0.9;
        config.planner.max_concurrent_reconfigurations = 0;
        config.reconciler.retry.retry_ceiling = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("disk_soft_threshold")));
        assert!(errors.iter().any(|e| e.contains("retry_ceiling")));
    }

    #[test]
    fn test_validate_threshold_range() {
        let mut config = ControllerConfig::default();
        config.planner.disk_hard_threshold = 1.5;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("(0, 1]")));
    }

    #[test]
    fn test_validate_retry_delays() {
        let mut config = ControllerConfig::default();
        config.reconciler.retry.min_delay = Duration::from_secs(20);
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("min_delay"));
    }
}
