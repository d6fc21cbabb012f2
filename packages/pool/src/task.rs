//! Task descriptors, outcomes, cancellation and the executor seam.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::TaskError;
use crate::supervisor::ControlMsg;

/// Unique, monotonically assigned task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Why a `Failure` outcome was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The executor returned an error or panicked.
    Execution,
    /// The assigned worker died and the retry budget is exhausted.
    WorkerCrashed,
    /// Pool-side invariant violation.
    Internal,
}

/// Terminal resolution of a task. Immutable once produced; every submitted
/// task resolves with exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(Vec<u8>),
    Failure { kind: FailureKind, message: String },
    Timeout,
    Cancelled,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

/// Pool-internal task descriptor. Cloned at dispatch so retries and
/// dead-worker recovery never depend on getting the original back.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Opaque tag used for metric partitioning.
    pub kind: String,
    /// Opaque payload; the pool guarantees byte-wise transport only.
    pub payload: Vec<u8>,
    pub submitted_at: Instant,
    /// Absolute deadline of the current attempt; re-armed on retry.
    pub deadline: Option<Instant>,
    /// Relative budget used to re-arm `deadline` when an attempt is retried.
    pub timeout: Duration,
    pub max_retries: u32,
    pub attempts_so_far: u32,
    pub preferred_session: Option<String>,
}

impl Task {
    pub(crate) fn deadline_passed(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

/// Submission parameters for [`crate::WorkerPool::submit`].
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub kind: String,
    pub payload: Vec<u8>,
    /// Per-attempt deadline; defaults to the pool's `task_timeout`.
    pub timeout: Option<Duration>,
    /// Retry budget; defaults to the pool's `max_retries`.
    pub max_retries: Option<u32>,
    /// Sticky-session key; usually set through `route` instead.
    pub session: Option<String>,
}

impl TaskSpec {
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

/// Cooperative cancellation flag for one attempt of one task.
///
/// The user-cancel bit is shared across retries of the same task; the
/// timeout bit belongs to a single attempt and is re-armed by the
/// supervisor when the task is re-queued.
#[derive(Debug, Clone)]
pub struct CancelToken {
    user_cancelled: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
}

impl CancelToken {
    pub(crate) fn new(user_cancelled: Arc<AtomicBool>) -> Self {
        Self {
            user_cancelled,
            timed_out: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fresh attempt over the same user-cancel bit.
    pub(crate) fn rearm(&self) -> Self {
        Self::new(self.user_cancelled.clone())
    }

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    /// True once the attempt should stop; executors poll this at natural
    /// step boundaries.
    pub fn is_cancelled(&self) -> bool {
        self.user_cancelled.load(Ordering::SeqCst) || self.timed_out.load(Ordering::SeqCst)
    }

    pub(crate) fn user_cancelled(&self) -> bool {
        self.user_cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }
}

/// Read-only view of a task handed to the executor.
pub struct TaskContext<'a> {
    pub task_id: TaskId,
    pub kind: &'a str,
    pub payload: &'a [u8],
    pub deadline: Option<Instant>,
    pub(crate) token: &'a CancelToken,
}

impl TaskContext<'_> {
    /// Whether the pool wants this attempt stopped (explicit cancel or
    /// deadline expiry). Honoring it promptly keeps the worker healthy.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Executes task payloads on worker threads. Supplied by the embedder at
/// pool construction; the pool itself is payload-agnostic.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(&self, ctx: TaskContext<'_>) -> Result<Vec<u8>, TaskError>;
}

impl<F> TaskExecutor for F
where
    F: Fn(TaskContext<'_>) -> Result<Vec<u8>, TaskError> + Send + Sync + 'static,
{
    fn execute(&self, ctx: TaskContext<'_>) -> Result<Vec<u8>, TaskError> {
        self(ctx)
    }
}

/// Resolves a task's future exactly once.
#[derive(Debug)]
pub(crate) struct TaskResolver {
    tx: Option<oneshot::Sender<TaskOutcome>>,
}

impl TaskResolver {
    pub(crate) fn new() -> (Self, oneshot::Receiver<TaskOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Deliver the outcome. A dropped receiver is fine (caller stopped
    /// caring); double resolution is a bug and is logged.
    pub(crate) fn resolve(&mut self, outcome: TaskOutcome) {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                tracing::error!("task resolved twice; dropping second outcome");
            }
        }
    }
}

/// Future side of a submission. Resolves exactly once.
#[derive(Debug)]
pub struct TaskHandle {
    pub(crate) id: TaskId,
    pub(crate) rx: oneshot::Receiver<TaskOutcome>,
    pub(crate) user_cancelled: Arc<AtomicBool>,
    pub(crate) control: Sender<ControlMsg>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Request cancellation. Queued tasks resolve `Cancelled` without
    /// executing; in-flight tasks are cancelled best-effort through the
    /// executor's token.
    pub fn cancel(&self) {
        self.user_cancelled.store(true, Ordering::SeqCst);
        let _ = self.control.send(ControlMsg::CancelTask(self.id));
    }

    /// Block until the outcome arrives. Must not be called from inside an
    /// async runtime; `await` the handle there instead.
    pub fn wait(self) -> TaskOutcome {
        self.rx.blocking_recv().unwrap_or_else(|_| TaskOutcome::Failure {
            kind: FailureKind::Internal,
            message: "task resolver dropped without an outcome".into(),
        })
    }

    /// Block up to `timeout`; returns the handle back on expiry so the
    /// caller can keep waiting or cancel.
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<TaskOutcome, TaskHandle> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.rx.try_recv() {
                Ok(outcome) => return Ok(outcome),
                Err(oneshot::error::TryRecvError::Empty) => {
                    if Instant::now() >= deadline {
                        return Err(self);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    return Ok(TaskOutcome::Failure {
                        kind: FailureKind::Internal,
                        message: "task resolver dropped without an outcome".into(),
                    });
                }
            }
        }
    }
}

impl std::future::IntoFuture for TaskHandle {
    type Output = TaskOutcome;
    type IntoFuture = Pin<Box<dyn Future<Output = TaskOutcome> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            self.rx.await.unwrap_or_else(|_| TaskOutcome::Failure {
                kind: FailureKind::Internal,
                message: "task resolver dropped without an outcome".into(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_rearm_keeps_user_bit() {
        let user = Arc::new(AtomicBool::new(false));
        let token = CancelToken::new(user.clone());
        token.mark_timed_out();
        assert!(token.is_cancelled());

        let next = token.rearm();
        assert!(!next.is_cancelled());

        user.store(true, Ordering::SeqCst);
        assert!(next.is_cancelled());
        assert!(next.user_cancelled());
        assert!(!next.timed_out());
    }

    #[test]
    fn resolver_delivers_once() {
        let (mut resolver, rx) = TaskResolver::new();
        resolver.resolve(TaskOutcome::Timeout);
        resolver.resolve(TaskOutcome::Cancelled);
        assert_eq!(rx.blocking_recv().expect("outcome"), TaskOutcome::Timeout);
    }
}
