//! Pool façade: construction, submission, health, metrics and shutdown.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use dashmap::DashMap;
use foreman_sync::SharedRegion;
use serde::Serialize;

use crate::breaker::BreakerState;
use crate::config::PoolConfig;
use crate::debug_log::DebugLog;
use crate::error::PoolError;
use crate::events::{EventBus, EventStream};
use crate::health::{HealthMonitor, HealthReport, Probe, ProbeOutcome, WorkerCounts};
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::queue::{PendingQueue, QueuedTask};
use crate::scaler::AutoScaler;
use crate::supervisor::{ControlMsg, Supervisor};
use crate::task::{CancelToken, Task, TaskExecutor, TaskHandle, TaskId, TaskResolver, TaskSpec};
use crate::worker::{WorkerHandle, WorkerId, WorkerStatus};

/// Shared-region layout. The region is allocated once at construction and
/// never resized; the queue's control words live at the front.
const QUEUE_LOCK_OFFSET: usize = 0;
const QUEUE_SIZE_OFFSET: usize = 4;
const REGION_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolState {
    Running,
    Draining,
    Terminated,
}

impl From<u32> for PoolState {
    fn from(value: u32) -> Self {
        match value {
            0 => PoolState::Running,
            1 => PoolState::Draining,
            _ => PoolState::Terminated,
        }
    }
}

/// Final accounting returned by [`WorkerPool::shutdown`].
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub duration: Duration,
    /// Workers that exited cleanly within the deadline.
    pub workers_drained: usize,
    /// Workers force-detached when the deadline passed.
    pub workers_forced: usize,
    pub tasks_completed_during_drain: u64,
    pub tasks_cancelled: u64,
    pub metrics: MetricsSnapshot,
}

/// State shared between the façade, supervisor, scaler and health probes.
/// Instantiated per pool; nothing here is process-global.
pub(crate) struct PoolCore {
    pub config: PoolConfig,
    pub workers: DashMap<WorkerId, Arc<WorkerHandle>>,
    pub queue: PendingQueue,
    pub metrics: Arc<MetricsRegistry>,
    pub events: EventBus,
    pub executor: Arc<dyn TaskExecutor>,
    pub debug: DebugLog,
    pub control_tx: Sender<ControlMsg>,
    pub started_at: Instant,
    state: AtomicU32,
    pub shutdown_report: Mutex<Option<ShutdownReport>>,
    next_task_id: AtomicU64,
}

impl PoolCore {
    pub(crate) fn state(&self) -> PoolState {
        PoolState::from(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: PoolState) {
        self.state.store(state as u32, Ordering::SeqCst);
    }

    fn next_task_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Shared submit path for `submit`, `route` and the synthetic health
    /// probe.
    pub(crate) fn submit_spec(&self, spec: TaskSpec) -> Result<TaskHandle, PoolError> {
        if self.state() != PoolState::Running {
            return Err(PoolError::ShuttingDown);
        }

        // With every breaker firmly open there is no worker that could ever
        // take the task; reject instead of queueing into a black hole.
        let now = Instant::now();
        let mut live = 0usize;
        let mut blocked = 0usize;
        for entry in self.workers.iter() {
            let worker = entry.value();
            if matches!(
                worker.status(),
                WorkerStatus::Starting | WorkerStatus::Idle | WorkerStatus::Busy
            ) {
                live += 1;
                if worker.breaker.firmly_open(now) {
                    blocked += 1;
                }
            }
        }
        if live > 0 && blocked == live {
            return Err(PoolError::BreakerOpen);
        }

        let timeout = spec.timeout.unwrap_or(self.config.task_timeout);
        let task = Task {
            id: self.next_task_id(),
            kind: spec.kind,
            payload: spec.payload,
            submitted_at: now,
            deadline: Some(now + timeout),
            timeout,
            max_retries: spec.max_retries.unwrap_or(self.config.max_retries),
            attempts_so_far: 0,
            preferred_session: spec.session,
        };
        let id = task.id;
        let kind = task.kind.clone();

        let (resolver, rx) = TaskResolver::new();
        let user_cancelled = Arc::new(AtomicBool::new(false));
        let token = CancelToken::new(user_cancelled.clone());
        self.queue.push(QueuedTask {
            task,
            resolver,
            token,
        })?;
        self.metrics.on_submitted(&kind);
        let _ = self.control_tx.send(ControlMsg::TaskQueued);

        Ok(TaskHandle {
            id,
            rx,
            user_cancelled,
            control: self.control_tx.clone(),
        })
    }

    pub(crate) fn worker_counts(&self) -> WorkerCounts {
        let mut counts = WorkerCounts::default();
        for entry in self.workers.iter() {
            let worker = entry.value();
            counts.total += 1;
            match worker.status() {
                WorkerStatus::Dead => counts.dead += 1,
                WorkerStatus::Starting | WorkerStatus::Idle | WorkerStatus::Busy
                    if worker.breaker.state() == BreakerState::Closed =>
                {
                    counts.healthy += 1;
                }
                _ => counts.degraded += 1,
            }
        }
        counts
    }
}

/// Production worker pool: auto-scaling executor threads with sticky
/// sessions, per-worker circuit breakers, health probes and a metrics
/// registry. See [`PoolConfig`] for tuning.
pub struct WorkerPool {
    core: Arc<PoolCore>,
    monitor: HealthMonitor,
    supervisor_join: Mutex<Option<JoinHandle<()>>>,
    scaler_join: Mutex<Option<JoinHandle<()>>>,
    scaler_stop: Sender<()>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, executor: Arc<dyn TaskExecutor>) -> Result<Self, PoolError> {
        config.validate()?;

        let debug = DebugLog::new(config.debug_namespaces.clone());
        let metrics = Arc::new(MetricsRegistry::new(&config.histogram_buckets));
        let region = SharedRegion::new(REGION_LEN)?;
        let queue = PendingQueue::new(
            region,
            QUEUE_LOCK_OFFSET,
            QUEUE_SIZE_OFFSET,
            config.max_queue_size,
            metrics.clone(),
        )?;
        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        let core = Arc::new(PoolCore {
            config,
            workers: DashMap::new(),
            queue,
            metrics,
            events: EventBus::new(),
            executor,
            debug,
            control_tx,
            started_at: Instant::now(),
            state: AtomicU32::new(PoolState::Running as u32),
            shutdown_report: Mutex::new(None),
            next_task_id: AtomicU64::new(1),
        });

        let supervisor = Supervisor::new(core.clone(), control_rx);
        let supervisor_join = std::thread::Builder::new()
            .name("pool-supervisor".to_string())
            .spawn(move || supervisor.run())
            .map_err(|e| PoolError::SpawnFailed(e.to_string()))?;

        let (scaler_stop, scaler_stop_rx) = crossbeam_channel::bounded(1);
        let scaler = AutoScaler {
            core: core.clone(),
            control: core.control_tx.clone(),
            stop: scaler_stop_rx,
            channel: core.debug.channel("pool:scaler"),
        };
        let scaler_join = std::thread::Builder::new()
            .name("pool-scaler".to_string())
            .spawn(move || scaler.run())
            .map_err(|e| PoolError::SpawnFailed(e.to_string()))?;

        let monitor = HealthMonitor::new(core.config.health_ttl, builtin_probes(&core));

        Ok(Self {
            core,
            monitor,
            supervisor_join: Mutex::new(Some(supervisor_join)),
            scaler_join: Mutex::new(Some(scaler_join)),
            scaler_stop,
        })
    }

    /// Enqueue a task; the handle resolves exactly once with its outcome.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskHandle, PoolError> {
        self.core.submit_spec(spec)
    }

    /// As [`submit`](Self::submit), with sticky routing: tasks sharing a
    /// session key run on the same worker while that worker lives.
    pub fn route(&self, session: impl Into<String>, mut spec: TaskSpec) -> Result<TaskHandle, PoolError> {
        spec.session = Some(session.into());
        self.core.submit_spec(spec)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    pub fn health(&self) -> HealthReport {
        self.monitor.check(
            self.core.started_at.elapsed(),
            self.core.worker_counts(),
            self.core.queue.len(),
        )
    }

    /// Register an additional health probe.
    pub fn register_probe(&self, probe: Probe) {
        self.monitor.register(probe);
    }

    /// Subscribe to lifecycle events. Every subscriber receives every
    /// event variant.
    pub fn events(&self) -> EventStream {
        self.core.events.subscribe()
    }

    /// Graceful shutdown: reject new submissions, drain workers up to
    /// `deadline`, force-detach the rest. Idempotent; a second call
    /// returns the first call's report.
    pub fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        if let Some(report) = self.stored_report() {
            return report;
        }

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let margin = Duration::from_secs(2);
        let sent = self
            .core
            .control_tx
            .send(ControlMsg::Shutdown {
                deadline,
                reply: reply_tx,
            })
            .is_ok();
        if sent && let Ok(report) = reply_rx.recv_timeout(deadline + margin) {
            self.reap_threads();
            return report;
        }

        // A concurrent shutdown is in progress (or just finished); wait for
        // its report.
        let give_up = Instant::now() + deadline + margin;
        while Instant::now() < give_up {
            if let Some(report) = self.stored_report() {
                self.reap_threads();
                return report;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        self.core.metrics.on_internal_error("shutdown report missing");
        ShutdownReport {
            duration: deadline,
            workers_drained: 0,
            workers_forced: 0,
            tasks_completed_during_drain: 0,
            tasks_cancelled: 0,
            metrics: self.core.metrics.snapshot(),
        }
    }

    fn stored_report(&self) -> Option<ShutdownReport> {
        self.core
            .shutdown_report
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
    }

    fn reap_threads(&self) {
        let _ = self.scaler_stop.send(());
        if let Ok(mut slot) = self.scaler_join.lock()
            && let Some(join) = slot.take()
        {
            let _ = join.join();
        }
        if let Ok(mut slot) = self.supervisor_join.lock()
            && let Some(join) = slot.take()
        {
            let _ = join.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.core.state() == PoolState::Running {
            let _ = self.shutdown(self.core.config.shutdown_deadline);
        }
        self.reap_threads();
    }
}

/// The probes every pool carries: at least one responsive worker, queue
/// depth within its limit, and an end-to-end synthetic task.
fn builtin_probes(core: &Arc<PoolCore>) -> Vec<Probe> {
    let heartbeat_window =
        core.config.heartbeat_period * (core.config.heartbeat_misses_allowed + 1);
    let queue_capacity = core.config.max_queue_size;
    let synthetic_timeout = core.config.task_timeout.min(Duration::from_millis(500));

    let responsive_core = Arc::downgrade(core);
    let queue_core = Arc::downgrade(core);
    let synthetic_core = Arc::downgrade(core);

    vec![
        Probe::new(
            "worker-responsive",
            true,
            Duration::from_secs(1),
            move || {
                let Some(core) = responsive_core.upgrade() else {
                    return ProbeOutcome::Fail("pool gone".into());
                };
                let now = Instant::now();
                let responsive = core.workers.iter().any(|entry| {
                    let worker = entry.value();
                    matches!(
                        worker.status(),
                        WorkerStatus::Starting | WorkerStatus::Idle | WorkerStatus::Busy
                    ) && worker.heartbeat_age(now) <= heartbeat_window
                });
                if responsive {
                    ProbeOutcome::Ok
                } else {
                    ProbeOutcome::Fail("no responsive worker".into())
                }
            },
        ),
        Probe::new(
            "queue-within-limit",
            false,
            Duration::from_secs(1),
            move || {
                let Some(core) = queue_core.upgrade() else {
                    return ProbeOutcome::Fail("pool gone".into());
                };
                let depth = core.queue.len();
                if depth < queue_capacity {
                    ProbeOutcome::Ok
                } else {
                    ProbeOutcome::Fail(format!("queue at capacity ({depth})"))
                }
            },
        ),
        Probe::new(
            "synthetic-task",
            false,
            Duration::from_secs(2),
            move || {
                let Some(core) = synthetic_core.upgrade() else {
                    return ProbeOutcome::Fail("pool gone".into());
                };
                let spec = TaskSpec::new("health:synthetic", Vec::new())
                    .timeout(synthetic_timeout)
                    .max_retries(0);
                match core.submit_spec(spec) {
                    Ok(handle) => match handle.wait() {
                        outcome if outcome.is_success() => ProbeOutcome::Ok,
                        outcome => ProbeOutcome::Fail(format!("synthetic task: {outcome:?}")),
                    },
                    Err(err) => ProbeOutcome::Fail(format!("submit failed: {err}")),
                }
            },
        ),
    ]
}
