use thiserror::Error;

/// Errors surfaced by the pool façade. Failures *inside* a task become
/// [`crate::TaskOutcome::Failure`] values, never pool-level errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("pending queue is at capacity ({capacity})")]
    QueueFull { capacity: usize },

    #[error("pool is shutting down")]
    ShuttingDown,

    /// Returned only when no worker at all can take a task; while at least
    /// one breaker admits traffic, selection retries silently.
    #[error("every worker's circuit breaker is open")]
    BreakerOpen,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn worker thread: {0}")]
    SpawnFailed(String),

    /// Invariant violation. Callers observing this should treat the pool as
    /// suspect; the pool itself increments `internal_errors` and logs at
    /// error level whenever it constructs one.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<foreman_sync::SyncError> for PoolError {
    fn from(err: foreman_sync::SyncError) -> Self {
        PoolError::Internal(format!("sync layer failure: {err}"))
    }
}

/// Application-level failure reported by a task executor.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
