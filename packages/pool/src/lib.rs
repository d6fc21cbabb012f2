//! Production worker pool with dynamic auto-scaling, sticky-session
//! routing, per-worker circuit breakers, a typed bounded work queue with
//! per-task timeouts and retries, and health/metrics collection.
//!
//! Workers are OS threads fed through per-worker inboxes; a supervisor
//! thread owns dispatch, outcome handling and recovery, an auto-scaler
//! grows and shrinks the pool within configured bounds, and a health
//! monitor runs registered probes with per-probe timeouts. Shared queue
//! state sits in a [`foreman_sync`] region so all blocking is built on the
//! same atomic wait/wake layer.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use foreman_pool::{PoolConfig, TaskContext, TaskError, TaskExecutor, TaskSpec, WorkerPool};
//!
//! struct Echo;
//!
//! impl TaskExecutor for Echo {
//!     fn execute(&self, ctx: TaskContext<'_>) -> Result<Vec<u8>, TaskError> {
//!         Ok(ctx.payload.to_vec())
//!     }
//! }
//!
//! let pool = WorkerPool::new(PoolConfig::default(), Arc::new(Echo))?;
//!
//! let handle = pool.submit(TaskSpec::new("echo", b"hello".to_vec()))?;
//! let outcome = handle.wait();
//! assert!(outcome.is_success());
//!
//! pool.shutdown(Duration::from_secs(5));
//! # Ok::<(), foreman_pool::PoolError>(())
//! ```

pub mod balancer;
pub mod breaker;
pub mod config;
pub mod debug_log;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod task;
pub mod worker;

mod queue;
mod scaler;
mod session;
mod supervisor;

pub use balancer::BalancerPolicy;
pub use breaker::BreakerState;
pub use config::{BreakerConfig, PoolConfig};
pub use debug_log::{DebugChannel, DebugLog, FacadeSink, Level, LogSink};
pub use error::{PoolError, TaskError};
pub use events::{EventStream, PoolEvent};
pub use health::{HealthReport, HealthStatus, Probe, ProbeOutcome, ProbeStatus, WorkerCounts};
pub use metrics::{HistogramSummary, MetricsSnapshot};
pub use pool::{ShutdownReport, WorkerPool};
pub use task::{
    FailureKind, TaskContext, TaskExecutor, TaskHandle, TaskId, TaskOutcome, TaskSpec,
};
pub use worker::{WorkerId, WorkerStatus};
