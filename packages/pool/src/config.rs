//! Pool construction record.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::BalancerPolicy;
use crate::error::PoolError;

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// Time an open breaker withholds traffic before probing.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Configuration for the whole pool. Every field has a default; construct
/// with struct-update syntax and validate via [`PoolConfig::validate`]
/// (called by `WorkerPool::new`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool size floor; at least 1.
    pub min_workers: usize,
    /// Pool size ceiling; `min_workers <= max_workers`.
    pub max_workers: usize,
    /// Workers started at boot. Defaults to `min_workers` when `None`.
    pub initial_workers: Option<usize>,

    /// Pending queue capacity; submissions beyond it fail with `QueueFull`.
    pub max_queue_size: usize,

    /// Queue depth beyond which the auto-scaler grows the pool.
    pub scale_up_threshold: usize,
    /// Idle worker count beyond which the auto-scaler shrinks the pool.
    pub scale_down_threshold: usize,
    /// Minimum dwell between two scale-ups.
    pub scale_up_delay: Duration,
    /// Minimum dwell between two scale-downs.
    pub scale_down_delay: Duration,
    /// Auto-scaler control loop period.
    pub scale_interval: Duration,

    /// Default deadline applied when a submission carries none.
    pub task_timeout: Duration,
    /// Default retry budget when a submission carries none.
    pub max_retries: u32,

    pub breaker: BreakerConfig,

    /// Worker heartbeat cadence.
    pub heartbeat_period: Duration,
    /// Missed heartbeats tolerated before a non-busy worker is declared dead.
    pub heartbeat_misses_allowed: u32,
    /// Margin past a task's deadline before its worker is declared dead.
    pub deadline_grace: Duration,
    /// Replacements granted to a worker slot before giving up on it.
    pub max_restarts: u32,

    /// LRU capacity of the session router.
    pub session_capacity: usize,

    /// Upper bound for the graceful phase of `shutdown`.
    pub shutdown_deadline: Duration,

    pub load_balancer_policy: BalancerPolicy,

    /// Health probe cache TTL.
    pub health_ttl: Duration,

    /// Histogram bucket upper bounds, ascending.
    pub histogram_buckets: Vec<Duration>,

    /// Patterns enabling debug channels, e.g. `["pool:*", "*:dispatch"]`.
    pub debug_namespaces: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            initial_workers: None,
            max_queue_size: 256,
            scale_up_threshold: 4,
            scale_down_threshold: 1,
            scale_up_delay: Duration::from_millis(500),
            scale_down_delay: Duration::from_secs(5),
            scale_interval: Duration::from_secs(1),
            task_timeout: Duration::from_secs(30),
            max_retries: 0,
            breaker: BreakerConfig::default(),
            heartbeat_period: Duration::from_millis(500),
            heartbeat_misses_allowed: 3,
            deadline_grace: Duration::from_secs(1),
            max_restarts: 3,
            session_capacity: 1024,
            shutdown_deadline: Duration::from_secs(5),
            load_balancer_policy: BalancerPolicy::RoundRobin,
            health_ttl: Duration::from_secs(2),
            histogram_buckets: default_buckets(),
            debug_namespaces: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "min_workers must be at least 1".into(),
            ));
        }
        if self.min_workers > self.max_workers {
            return Err(PoolError::InvalidConfig(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if let Some(initial) = self.initial_workers
            && (initial < self.min_workers || initial > self.max_workers)
        {
            return Err(PoolError::InvalidConfig(format!(
                "initial_workers ({initial}) outside [{}, {}]",
                self.min_workers, self.max_workers
            )));
        }
        if self.max_queue_size == 0 {
            return Err(PoolError::InvalidConfig(
                "max_queue_size must be non-zero".into(),
            ));
        }
        if self.session_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "session_capacity must be non-zero".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(PoolError::InvalidConfig(
                "breaker thresholds must be non-zero".into(),
            ));
        }
        if self.histogram_buckets.is_empty() {
            return Err(PoolError::InvalidConfig(
                "histogram_buckets must not be empty".into(),
            ));
        }
        if !self
            .histogram_buckets
            .windows(2)
            .all(|pair| pair[0] < pair[1])
        {
            return Err(PoolError::InvalidConfig(
                "histogram_buckets must be strictly ascending".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn initial_worker_count(&self) -> usize {
        self.initial_workers.unwrap_or(self.min_workers)
    }
}

fn default_buckets() -> Vec<Duration> {
    [
        1, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000,
    ]
    .into_iter()
    .map(Duration::from_millis)
    .collect()
}
