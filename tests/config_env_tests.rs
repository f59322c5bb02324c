//! Integration tests for ControllerConfig::from_env()
//!
//! Environment variables are process-global, so every test here runs under
//! one mutex and restores the variables it touched.

use serial_test::serial;
use shardctl::cluster::{ControllerConfig, ControllerError, ControllerProfile};
use shardctl::telemetry::LogFormat;
use shardctl::types::NodeId;
use std::env;
use std::sync::Mutex;
use std::time::Duration;

/// Global mutex to serialize all env-based tests.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// All environment variables read by ControllerConfig::from_env() and
/// LogFormat::from_env().
const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "CONTROLLER_PROFILE",
    "CONTROLLER_NODE_ID",
    "MAX_CONCURRENT_RECONFIGURATIONS",
    "DISK_SOFT_THRESHOLD",
    "DISK_HARD_THRESHOLD",
    "RACK_AWARENESS",
    "RETRY_CEILING",
    "LEADER_BALANCER_TOLERANCE",
    "MAX_FOLLOWER_LAG",
    "PLANNER_INTERVAL_MS",
    "NODE_LIVENESS_TIMEOUT_MS",
    "LOG_FORMAT",
];

/// Run `f` with exactly `vars` set among the config variables.
fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

    let all_originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in all_originals {
        match original {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }

    result
}

fn config_error(result: Result<ControllerConfig, ControllerError>) -> String {
    match result {
        Err(ControllerError::Config(msg)) => msg,
        other => panic!("expected config error, got {:?}", other),
    }
}

// ============================================================================
// Profiles
// ============================================================================

#[test]
#[serial]
fn test_from_env_without_variables_uses_defaults() {
    with_env_vars(&[], || {
        let config = ControllerConfig::from_env().expect("Should parse config");
        let defaults = ControllerConfig::default();
        assert_eq!(config.node_id, NodeId(0));
        assert_eq!(
            config.planner.max_concurrent_reconfigurations,
            defaults.planner.max_concurrent_reconfigurations
        );
        assert!(config.validate().is_ok());
    });
}

#[test]
#[serial]
fn test_from_env_with_profile() {
    with_env_vars(&[("CONTROLLER_PROFILE", "development")], || {
        let config = ControllerConfig::from_env().expect("Should parse config");
        let expected = ControllerConfig::from_profile(ControllerProfile::Development);
        assert_eq!(config.tick_interval, expected.tick_interval);
        assert!(!config.reconciler.retry.jitter);
    });
}

#[test]
#[serial]
fn test_from_env_unknown_profile_fails() {
    with_env_vars(&[("CONTROLLER_PROFILE", "turbo")], || {
        let msg = config_error(ControllerConfig::from_env());
        assert!(msg.contains("turbo"));
    });
}

#[test]
#[serial]
fn test_from_profile_env_falls_back_to_production() {
    with_env_vars(&[("CONTROLLER_PROFILE", "turbo")], || {
        let config = ControllerConfig::from_profile_env();
        let production = ControllerConfig::from_profile(ControllerProfile::Production);
        assert_eq!(config.tick_interval, production.tick_interval);
    });
}

// ============================================================================
// Overrides
// ============================================================================

#[test]
#[serial]
fn test_from_env_with_node_id() {
    with_env_vars(&[("CONTROLLER_NODE_ID", "42")], || {
        let config = ControllerConfig::from_env().expect("Should parse config");
        assert_eq!(config.node_id, NodeId(42));
    });
}

#[test]
#[serial]
fn test_from_env_negative_node_id_fails() {
    with_env_vars(&[("CONTROLLER_NODE_ID", "-1")], || {
        let msg = config_error(ControllerConfig::from_env());
        assert!(msg.contains("CONTROLLER_NODE_ID"));
    });
}

#[test]
#[serial]
fn test_from_env_overrides_apply_on_top_of_profile() {
    with_env_vars(
        &[
            ("CONTROLLER_PROFILE", "large-cluster"),
            ("MAX_CONCURRENT_RECONFIGURATIONS", "12"),
            ("DISK_SOFT_THRESHOLD", "0.7"),
            ("DISK_HARD_THRESHOLD", "0.9"),
            ("RACK_AWARENESS", "false"),
            ("RETRY_CEILING", "3"),
            ("LEADER_BALANCER_TOLERANCE", "2.5"),
            ("MAX_FOLLOWER_LAG", "50"),
            ("PLANNER_INTERVAL_MS", "2500"),
            ("NODE_LIVENESS_TIMEOUT_MS", "8000"),
        ],
        || {
            let config = ControllerConfig::from_env().expect("Should parse config");
            assert_eq!(config.planner.max_concurrent_reconfigurations, 12);
            assert_eq!(config.planner.disk_soft_threshold, 0.7);
            assert_eq!(config.planner.disk_hard_threshold, 0.9);
            assert!(!config.allocator.rack_awareness);
            assert_eq!(config.reconciler.retry.retry_ceiling, 3);
            assert_eq!(config.leader_balancer.tolerance, 2.5);
            assert_eq!(config.leader_balancer.max_follower_lag, 50);
            assert_eq!(config.planner.interval, Duration::from_millis(2500));
            assert_eq!(config.node_liveness_timeout, Duration::from_millis(8000));

            // Untouched profile values survive.
            let large = ControllerConfig::from_profile(ControllerProfile::LargeCluster);
            assert_eq!(
                config.reconciler.max_concurrent_dispatches,
                large.reconciler.max_concurrent_dispatches
            );
        },
    );
}

#[test]
#[serial]
fn test_from_env_values_are_trimmed() {
    with_env_vars(&[("RETRY_CEILING", " 7 ")], || {
        let config = ControllerConfig::from_env().expect("Should parse config");
        assert_eq!(config.reconciler.retry.retry_ceiling, 7);
    });
}

#[test]
#[serial]
fn test_from_env_invalid_values_name_the_variable() {
    for (name, value) in [
        ("CONTROLLER_NODE_ID", "not-a-number"),
        ("MAX_CONCURRENT_RECONFIGURATIONS", "many"),
        ("DISK_SOFT_THRESHOLD", "high"),
        ("RACK_AWARENESS", "yes"),
        ("PLANNER_INTERVAL_MS", "-5"),
    ] {
        with_env_vars(&[(name, value)], || {
            let msg = config_error(ControllerConfig::from_env());
            assert!(
                msg.starts_with(&format!("Invalid {}", name)),
                "unexpected message for {}: {}",
                name,
                msg
            );
        });
    }
}

#[test]
#[serial]
fn test_from_env_inconsistent_thresholds_fail_validation() {
    with_env_vars(
        &[("DISK_SOFT_THRESHOLD", "0.95"), ("DISK_HARD_THRESHOLD", "0.9")],
        || {
            let config = ControllerConfig::from_env().expect("Should parse config");
            let errors = config.validate().unwrap_err();
            assert!(errors.iter().any(|e| e.contains("disk_soft_threshold")));
        },
    );
}

// ============================================================================
// Logging
// ============================================================================

#[test]
#[serial]
fn test_log_format_from_env() {
    with_env_vars(&[("LOG_FORMAT", "json")], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
    });
    with_env_vars(&[("LOG_FORMAT", "pretty")], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    });
    with_env_vars(&[], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    });
}
