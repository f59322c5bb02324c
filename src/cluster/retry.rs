//! Retry policies built on `backon`.
//!
//! Two styles are used:
//!
//! - **Scheduled retries** for reconciliation operations. The reconciler never
//!   sleeps inside a retry loop; it asks [`RetrySchedule::delay_for`] when the
//!   next attempt is due and the periodic driver picks it up. Running out of
//!   delays is the retry ceiling.
//! - **Inline retries** for assignment store writes, where the caller can simply
//!   await a short `.retry()` loop.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `reconcile_policy` | config | config | config | Node operations |
//! | `store_policy` | 10ms | 500ms | 3 | Assignment store writes |

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder, Retryable};

use super::config::RetryConfig;

/// Policy for node operations dispatched by the reconciler.
pub fn reconcile_policy(config: &RetryConfig) -> ExponentialBuilder {
    let builder = ExponentialBuilder::default()
        .with_min_delay(config.min_delay)
        .with_max_delay(config.max_delay)
        .with_max_times(config.retry_ceiling);
    if config.jitter {
        builder.with_jitter()
    } else {
        builder
    }
}

/// Policy for durable assignment store writes.
///
/// Store errors are usually persistent, so it gives up quickly.
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

/// Execute an async operation with the store retry policy.
pub async fn with_store_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation.retry(store_policy()).when(condition).await
}

/// Delays for scheduled retries.
///
/// Without jitter the sequence is materialized once and shared by every
/// operation. With jitter each lookup draws from a freshly built backoff, so
/// operations retrying at the same attempt number spread out.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    policy: ExponentialBuilder,
    jitter: bool,
    delays: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(config: &RetryConfig) -> Self {
        let policy = reconcile_policy(config);
        Self {
            policy,
            jitter: config.jitter,
            delays: policy.build().collect(),
        }
    }

    /// Delay before retry number `retry_number` (1-based), or `None` when the
    /// ceiling is exhausted.
    pub fn delay_for(&self, retry_number: u32) -> Option<Duration> {
        if retry_number == 0 {
            return Some(Duration::ZERO);
        }
        let index = retry_number as usize - 1;
        if index >= self.delays.len() {
            return None;
        }
        if self.jitter {
            self.policy.build().nth(index)
        } else {
            self.delays.get(index).copied()
        }
    }

    /// Number of retries allowed after the first attempt.
    pub fn ceiling(&self) -> usize {
        self.delays.len()
    }
}

/// Record a scheduled retry for metrics.
pub fn record_retry_attempt(kind: &str, retry_number: u32) {
    super::metrics::OPERATION_RETRIES
        .with_label_values(&[kind, "scheduled"])
        .inc();

    tracing::debug!(kind, retry_number, "Retry scheduled");
}

/// Record an operation that ran out of retries.
pub fn record_retry_exhausted(kind: &str) {
    super::metrics::OPERATION_RETRIES
        .with_label_values(&[kind, "exhausted"])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn deterministic(ceiling: usize) -> RetryConfig {
        RetryConfig {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            retry_ceiling: ceiling,
            jitter: false,
        }
    }

    #[test]
    fn test_schedule_length_matches_ceiling() {
        let schedule = RetrySchedule::new(&deterministic(4));
        assert_eq!(schedule.ceiling(), 4);
        assert!(schedule.delay_for(4).is_some());
        assert!(schedule.delay_for(5).is_none());
    }

    #[test]
    fn test_jittered_delays_differ_between_lookups() {
        let mut config = deterministic(3);
        config.jitter = true;
        let schedule = RetrySchedule::new(&config);

        let delays: std::collections::BTreeSet<Duration> =
            (0..32).filter_map(|_| schedule.delay_for(1)).collect();
        assert!(delays.len() > 1);
        assert!(delays.iter().all(|d| *d >= config.min_delay));
        assert!(schedule.delay_for(4).is_none());
    }

    #[test]
    fn test_schedule_is_exponential_and_capped() {
        let schedule = RetrySchedule::new(&deterministic(6));
        assert_eq!(schedule.delay_for(0), Some(Duration::ZERO));
        assert_eq!(schedule.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(schedule.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(schedule.delay_for(3), Some(Duration::from_millis(400)));
        assert_eq!(schedule.delay_for(5), Some(Duration::from_millis(1000)));
        assert_eq!(schedule.delay_for(6), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_jittered_schedule_keeps_ceiling() {
        let mut config = deterministic(3);
        config.jitter = true;
        let schedule = RetrySchedule::new(&config);
        assert_eq!(schedule.ceiling(), 3);
        assert!(schedule.delay_for(1).unwrap() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_store_policy_retries_transient_errors() {
        let attempts = AtomicU32::new(0);

        let result = with_store_policy(
            || {
                let attempts = &attempts;
                async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    if attempt < 1 {
                        Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"))
                    } else {
                        Ok("stored")
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), "stored");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_policy_exhausts() {
        let attempts = AtomicU32::new(0);

        let result: Result<i32, std::io::Error> = with_store_policy(
            || {
                let attempts = &attempts;
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"))
                }
            },
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_retry_attempt("add_replica", 1);
        record_retry_exhausted("add_replica");
    }
}
