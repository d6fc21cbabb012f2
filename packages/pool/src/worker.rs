//! Worker handle and the executor thread's message loop.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, System};

use crate::breaker::CircuitBreaker;
use crate::config::BreakerConfig;
use crate::debug_log::DebugChannel;
use crate::error::PoolError;
use crate::metrics::MetricsRegistry;
use crate::task::{CancelToken, FailureKind, Task, TaskContext, TaskExecutor, TaskId, TaskOutcome};

/// Stable, monotonically assigned worker identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Worker lifecycle states.
///
/// ```text
/// Starting → Idle ↔ Busy
///              ↓      ↓
///           Draining ← (drain signal)
///              ↓
///            Dead
/// ```
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting = 0,
    Idle = 1,
    Busy = 2,
    Draining = 3,
    Dead = 4,
}

impl From<u32> for WorkerStatus {
    fn from(value: u32) -> Self {
        match value {
            0 => WorkerStatus::Starting,
            1 => WorkerStatus::Idle,
            2 => WorkerStatus::Busy,
            3 => WorkerStatus::Draining,
            _ => WorkerStatus::Dead,
        }
    }
}

/// Messages understood by a worker thread. Exhaustively matched; there is
/// no unknown-tag path by construction.
pub(crate) enum WorkerMsg {
    Assign(Assignment),
    /// Best-effort: the cancel bit travels on the shared token; this
    /// message exists so an idle worker can drop stale cancels cheaply.
    CancelCurrent { task_id: TaskId },
    Drain,
}

pub(crate) struct Assignment {
    pub task: Task,
    pub token: CancelToken,
}

/// Events flowing from worker threads to the supervisor.
pub(crate) enum WorkerEvent {
    Outcome(TaskFinished),
    Heartbeat(Heartbeat),
    Exited { worker: WorkerId, panicked: bool },
}

pub(crate) struct TaskFinished {
    pub worker: WorkerId,
    pub task_id: TaskId,
    /// `attempts_so_far` at assignment; used to drop outcomes from workers
    /// that were declared dead while still holding the task.
    pub attempt: u32,
    pub outcome: TaskOutcome,
    pub busy: Duration,
}

pub(crate) struct Heartbeat {
    pub worker: WorkerId,
    pub current_task: Option<TaskId>,
    pub cpu_percent: f32,
    pub rss_mb: u64,
    /// Overshoot of the requested inbox wait; the scheduling-delay analog
    /// of event-loop lag.
    pub sched_lag: Duration,
}

/// Shared handle to one worker. The worker thread flips Idle↔Busy; the
/// supervisor owns Draining/Dead and everything else reads.
pub(crate) struct WorkerHandle {
    pub id: WorkerId,
    status: AtomicU32,
    pub inbox: Sender<WorkerMsg>,
    pub breaker: CircuitBreaker,
    /// Assignments dispatched but not yet resolved.
    pub active_tasks: AtomicU32,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub created_at: Instant,
    /// Millis since `created_at`; 0 until the first heartbeat.
    last_heartbeat_ms: AtomicU64,
    pub restart_count: u32,
    /// Raw task id, 0 when idle (ids start at 1).
    current_task: AtomicU64,
    pub join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub(crate) fn status(&self) -> WorkerStatus {
        WorkerStatus::from(self.status.load(Ordering::SeqCst))
    }

    /// CAS transition; returns false when the current status is not `from`
    /// (e.g. the supervisor force-set Draining underneath us).
    pub(crate) fn transition(&self, from: WorkerStatus, to: WorkerStatus) -> bool {
        self.status
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Unconditional status change; returns the previous status.
    pub(crate) fn force_status(&self, to: WorkerStatus) -> WorkerStatus {
        WorkerStatus::from(self.status.swap(to as u32, Ordering::SeqCst))
    }

    pub(crate) fn is_live(&self) -> bool {
        !matches!(self.status(), WorkerStatus::Dead)
    }

    pub(crate) fn note_heartbeat(&self, now: Instant) {
        let ms = now.duration_since(self.created_at).as_millis() as u64;
        self.last_heartbeat_ms.store(ms, Ordering::SeqCst);
    }

    /// Time since the last heartbeat, measured from worker creation for a
    /// worker that never heartbeated.
    pub(crate) fn heartbeat_age(&self, now: Instant) -> Duration {
        let last_ms = self.last_heartbeat_ms.load(Ordering::SeqCst);
        now.duration_since(self.created_at)
            .saturating_sub(Duration::from_millis(last_ms))
    }

    pub(crate) fn current_task(&self) -> Option<TaskId> {
        match self.current_task.load(Ordering::SeqCst) {
            0 => None,
            id => Some(TaskId(id)),
        }
    }

    fn set_current(&self, id: TaskId) {
        self.current_task.store(id.0, Ordering::SeqCst);
    }

    fn clear_current(&self) {
        self.current_task.store(0, Ordering::SeqCst);
    }
}

/// Everything a worker thread needs besides its inbox.
pub(crate) struct WorkerContext {
    pub handle: Arc<WorkerHandle>,
    pub events: Sender<WorkerEvent>,
    pub executor: Arc<dyn TaskExecutor>,
    pub heartbeat_period: Duration,
    pub metrics: Arc<MetricsRegistry>,
    pub channel: DebugChannel,
}

/// Spawn a worker thread and return its shared handle.
pub(crate) fn spawn_worker(
    id: WorkerId,
    restart_count: u32,
    breaker_config: BreakerConfig,
    events: Sender<WorkerEvent>,
    executor: Arc<dyn TaskExecutor>,
    heartbeat_period: Duration,
    metrics: Arc<MetricsRegistry>,
    channel: DebugChannel,
) -> Result<Arc<WorkerHandle>, PoolError> {
    let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
    let handle = Arc::new(WorkerHandle {
        id,
        status: AtomicU32::new(WorkerStatus::Starting as u32),
        inbox: inbox_tx,
        breaker: CircuitBreaker::new(breaker_config),
        active_tasks: AtomicU32::new(0),
        tasks_completed: AtomicU64::new(0),
        tasks_failed: AtomicU64::new(0),
        created_at: Instant::now(),
        last_heartbeat_ms: AtomicU64::new(0),
        restart_count,
        current_task: AtomicU64::new(0),
        join: Mutex::new(None),
    });

    let ctx = WorkerContext {
        handle: handle.clone(),
        events,
        executor,
        heartbeat_period,
        metrics,
        channel,
    };
    let join = std::thread::Builder::new()
        .name(format!("{id}"))
        .spawn(move || run_worker(inbox_rx, ctx))
        .map_err(|e| PoolError::SpawnFailed(e.to_string()))?;

    if let Ok(mut slot) = handle.join.lock() {
        *slot = Some(join);
    }
    Ok(handle)
}

/// Reports thread exit to the supervisor on every path out of the loop,
/// panics included.
struct ExitSentinel {
    worker: WorkerId,
    events: Sender<WorkerEvent>,
}

impl Drop for ExitSentinel {
    fn drop(&mut self) {
        let _ = self.events.send(WorkerEvent::Exited {
            worker: self.worker,
            panicked: std::thread::panicking(),
        });
    }
}

fn run_worker(inbox: Receiver<WorkerMsg>, ctx: WorkerContext) {
    let _sentinel = ExitSentinel {
        worker: ctx.handle.id,
        events: ctx.events.clone(),
    };
    let mut sampler = ResourceSampler::new();
    ctx.channel
        .debug(|| format!("{} online", ctx.handle.id));

    // First heartbeat announces readiness; the supervisor flips
    // Starting → Idle when it arrives.
    send_heartbeat(&ctx, &mut sampler, Duration::ZERO);

    loop {
        let wait_started = Instant::now();
        match inbox.recv_timeout(ctx.heartbeat_period) {
            Ok(WorkerMsg::Assign(assignment)) => {
                run_assignment(&ctx, assignment);
                // Fresh liveness signal after a potentially long execution.
                send_heartbeat(&ctx, &mut sampler, Duration::ZERO);
            }
            Ok(WorkerMsg::CancelCurrent { task_id }) => {
                // The cancel bit is on the token; a cancel for a task we
                // already finished is stale.
                ctx.channel
                    .debug(|| format!("{}: cancel notice for {task_id}", ctx.handle.id));
            }
            Ok(WorkerMsg::Drain) => {
                ctx.handle.force_status(WorkerStatus::Draining);
                ctx.channel
                    .debug(|| format!("{} draining", ctx.handle.id));
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                let lag = wait_started.elapsed().saturating_sub(ctx.heartbeat_period);
                send_heartbeat(&ctx, &mut sampler, lag);
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn run_assignment(ctx: &WorkerContext, assignment: Assignment) {
    let Assignment { task, token } = assignment;
    let handle = &ctx.handle;

    // Fails when the supervisor set Draining underneath us; execute anyway,
    // drain semantics finish the work already handed over.
    handle.transition(WorkerStatus::Idle, WorkerStatus::Busy);
    handle.set_current(task.id);
    ctx.metrics.add_busy(1);

    let started = Instant::now();
    let result = catch_unwind(AssertUnwindSafe(|| {
        ctx.executor.execute(TaskContext {
            task_id: task.id,
            kind: &task.kind,
            payload: &task.payload,
            deadline: task.deadline,
            token: &token,
        })
    }));
    let busy = started.elapsed();

    ctx.metrics.add_busy(-1);
    handle.clear_current();

    // Cancellation and timeout take precedence over whatever the executor
    // returned on its way out.
    let outcome = if token.user_cancelled() {
        TaskOutcome::Cancelled
    } else if token.timed_out() {
        TaskOutcome::Timeout
    } else {
        match result {
            Ok(Ok(bytes)) => TaskOutcome::Success(bytes),
            Ok(Err(err)) => TaskOutcome::Failure {
                kind: FailureKind::Execution,
                message: err.message,
            },
            Err(panic) => TaskOutcome::Failure {
                kind: FailureKind::Execution,
                message: panic_message(panic.as_ref()),
            },
        }
    };

    match &outcome {
        TaskOutcome::Success(_) => {
            handle.tasks_completed.fetch_add(1, Ordering::SeqCst);
        }
        TaskOutcome::Cancelled => {}
        _ => {
            handle.tasks_failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    handle.transition(WorkerStatus::Busy, WorkerStatus::Idle);
    ctx.channel.debug(|| {
        format!(
            "{} finished {} in {:?}",
            handle.id, task.id, busy
        )
    });

    let _ = ctx.events.send(WorkerEvent::Outcome(TaskFinished {
        worker: handle.id,
        task_id: task.id,
        attempt: task.attempts_so_far,
        outcome,
        busy,
    }));
}

fn send_heartbeat(ctx: &WorkerContext, sampler: &mut ResourceSampler, sched_lag: Duration) {
    let (cpu_percent, rss_mb) = sampler.sample();
    let _ = ctx.events.send(WorkerEvent::Heartbeat(Heartbeat {
        worker: ctx.handle.id,
        current_task: ctx.handle.current_task(),
        cpu_percent,
        rss_mb,
        sched_lag,
    }));
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("executor panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("executor panicked: {message}")
    } else {
        "executor panicked".to_string()
    }
}

/// Per-worker CPU / resident-memory sampling for heartbeats.
struct ResourceSampler {
    system: System,
    pid: Option<Pid>,
}

impl ResourceSampler {
    fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    fn sample(&mut self) -> (f32, u64) {
        let Some(pid) = self.pid else {
            return (0.0, 0);
        };
        self.system.refresh_process_specifics(
            pid,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        match self.system.process(pid) {
            Some(process) => (process.cpu_usage(), process.memory() / (1024 * 1024)),
            None => (0.0, 0),
        }
    }
}

/// Detached handle for policy and selection tests; the inbox receiver is
/// dropped, which is fine because nothing is sent.
#[cfg(test)]
pub(crate) fn test_handle(id: u64, status: WorkerStatus, active: u32) -> Arc<WorkerHandle> {
    let (tx, _rx) = crossbeam_channel::unbounded();
    Arc::new(WorkerHandle {
        id: WorkerId(id),
        status: AtomicU32::new(status as u32),
        inbox: tx,
        breaker: CircuitBreaker::new(BreakerConfig::default()),
        active_tasks: AtomicU32::new(active),
        tasks_completed: AtomicU64::new(0),
        tasks_failed: AtomicU64::new(0),
        created_at: Instant::now(),
        last_heartbeat_ms: AtomicU64::new(0),
        restart_count: 0,
        current_task: AtomicU64::new(0),
        join: Mutex::new(None),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_guarded() {
        let handle = test_handle(1, WorkerStatus::Starting, 0);
        assert!(handle.transition(WorkerStatus::Starting, WorkerStatus::Idle));
        assert!(handle.transition(WorkerStatus::Idle, WorkerStatus::Busy));
        // Stale transition loses against the current state.
        assert!(!handle.transition(WorkerStatus::Idle, WorkerStatus::Busy));
        assert_eq!(handle.force_status(WorkerStatus::Draining), WorkerStatus::Busy);
        assert_eq!(handle.status(), WorkerStatus::Draining);
    }

    #[test]
    fn heartbeat_age_counts_from_creation() {
        let handle = test_handle(2, WorkerStatus::Starting, 0);
        let later = handle.created_at + Duration::from_millis(300);
        assert!(handle.heartbeat_age(later) >= Duration::from_millis(300));
        handle.note_heartbeat(later);
        assert!(handle.heartbeat_age(later + Duration::from_millis(50)) <= Duration::from_millis(51));
    }
}
