//! Supervisor: spawns workers, dispatches tasks, evaluates breakers,
//! recovers from worker death and drives graceful shutdown.
//!
//! Runs on its own thread and owns all mutation of the worker set, the
//! session map and the in-flight table; everything else communicates with
//! it through channels. Lock ordering across the codebase is
//! Pool (queue) → Worker → Breaker → SessionMap → MetricsRegistry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select};

use crate::balancer::{SelectionPolicy, make_policy};
use crate::breaker::BreakerTransition;
use crate::debug_log::DebugChannel;
use crate::error::PoolError;
use crate::events::PoolEvent;
use crate::metrics::Resolution;
use crate::pool::{PoolCore, PoolState, ShutdownReport};
use crate::queue::QueuedTask;
use crate::session::SessionRouter;
use crate::task::{CancelToken, FailureKind, Task, TaskId, TaskOutcome, TaskResolver};
use crate::worker::{
    Assignment, TaskFinished, WorkerEvent, WorkerHandle, WorkerId, WorkerMsg, WorkerStatus,
    spawn_worker,
};

/// Liveness / deadline sweep cadence.
const TICK: Duration = Duration::from_millis(20);

/// Messages from the façade, task handles and the auto-scaler.
pub(crate) enum ControlMsg {
    TaskQueued,
    CancelTask(TaskId),
    ScaleUp,
    ScaleDown,
    Shutdown {
        deadline: Duration,
        reply: Sender<ShutdownReport>,
    },
}

/// A dispatched task awaiting its outcome. The task copy is what retries
/// and dead-worker recovery re-queue; the original travelled to the worker.
struct InFlight {
    task: Task,
    resolver: TaskResolver,
    token: CancelToken,
    worker: WorkerId,
}

pub(crate) struct Supervisor {
    core: Arc<PoolCore>,
    control_rx: Receiver<ControlMsg>,
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,
    sessions: SessionRouter,
    policy: Box<dyn SelectionPolicy>,
    in_flight: HashMap<TaskId, InFlight>,
    /// Dispatch recency per worker, for LRU scale-down victims.
    last_assigned: HashMap<WorkerId, Instant>,
    next_worker_id: u64,
    channel: DebugChannel,
    dispatch_channel: DebugChannel,
}

impl Supervisor {
    pub(crate) fn new(core: Arc<PoolCore>, control_rx: Receiver<ControlMsg>) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let policy = make_policy(core.config.load_balancer_policy);
        let sessions = SessionRouter::new(core.config.session_capacity);
        let channel = core.debug.channel("pool:supervisor");
        let dispatch_channel = core.debug.channel("pool:dispatch");
        Self {
            core,
            control_rx,
            events_tx,
            events_rx,
            sessions,
            policy,
            in_flight: HashMap::new(),
            last_assigned: HashMap::new(),
            next_worker_id: 1,
            channel,
            dispatch_channel,
        }
    }

    pub(crate) fn run(mut self) {
        for _ in 0..self.core.config.initial_worker_count() {
            if let Err(err) = self.spawn_one(0) {
                tracing::error!(error = %err, "failed to spawn initial worker");
            }
        }

        // Receive first, act second: arm bodies stay free of `self` borrows.
        enum Step {
            Event(WorkerEvent),
            Control(ControlMsg),
            ControlClosed,
            Tick,
            Idle,
        }

        let tick = crossbeam_channel::tick(TICK);
        loop {
            let step = select! {
                recv(self.events_rx) -> event => match event {
                    Ok(event) => Step::Event(event),
                    Err(_) => Step::Idle,
                },
                recv(self.control_rx) -> msg => match msg {
                    Ok(msg) => Step::Control(msg),
                    Err(_) => Step::ControlClosed,
                },
                recv(tick) -> _ => Step::Tick,
            };
            match step {
                Step::Event(event) => self.handle_worker_event(event),
                Step::Control(ControlMsg::TaskQueued) => self.dispatch_pending(),
                Step::Control(ControlMsg::CancelTask(id)) => self.handle_cancel(id),
                Step::Control(ControlMsg::ScaleUp) => self.scale_up(),
                Step::Control(ControlMsg::ScaleDown) => self.scale_down(),
                Step::Control(ControlMsg::Shutdown { deadline, reply }) => {
                    self.run_shutdown(deadline, Some(reply));
                    return;
                }
                // Every sender (façade included) is gone; drain with the
                // configured deadline so no worker thread leaks.
                Step::ControlClosed => {
                    let deadline = self.core.config.shutdown_deadline;
                    self.run_shutdown(deadline, None);
                    return;
                }
                Step::Tick => self.on_tick(),
                Step::Idle => {}
            }
        }
    }

    // Worker lifecycle

    fn spawn_one(&mut self, restart_count: u32) -> Result<(), PoolError> {
        let id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;
        let handle = spawn_worker(
            id,
            restart_count,
            self.core.config.breaker.clone(),
            self.events_tx.clone(),
            self.core.executor.clone(),
            self.core.config.heartbeat_period,
            self.core.metrics.clone(),
            self.core.debug.channel("pool:worker"),
        )?;
        self.core.workers.insert(id, handle);
        self.core.metrics.set_pool_size(self.core.workers.len());
        self.core.events.emit(PoolEvent::WorkerStarted { worker: id });
        self.channel
            .debug(|| format!("spawned {id} (restart {restart_count})"));
        Ok(())
    }

    fn scale_up(&mut self) {
        if self.core.state() != PoolState::Running {
            return;
        }
        if self.core.workers.len() >= self.core.config.max_workers {
            return;
        }
        if let Err(err) = self.spawn_one(0) {
            tracing::error!(error = %err, "scale-up spawn failed");
            return;
        }
        self.core
            .metrics
            .counters
            .scale_ups
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.core.events.emit(PoolEvent::ScaledUp {
            size: self.core.workers.len(),
        });
    }

    fn scale_down(&mut self) {
        if self.core.state() != PoolState::Running {
            return;
        }
        if !self.core.queue.is_empty() {
            return;
        }
        let live = self
            .core
            .workers
            .iter()
            .filter(|entry| {
                matches!(
                    entry.value().status(),
                    WorkerStatus::Starting | WorkerStatus::Idle | WorkerStatus::Busy
                )
            })
            .count();
        if live <= self.core.config.min_workers {
            return;
        }

        // Evict the least recently used idle worker.
        let victim = self
            .core
            .workers
            .iter()
            .filter(|entry| entry.value().status() == WorkerStatus::Idle)
            .map(|entry| entry.value().clone())
            .min_by_key(|w| self.last_assigned.get(&w.id).copied());
        let Some(victim) = victim else {
            return;
        };

        victim.force_status(WorkerStatus::Draining);
        if victim.inbox.send(WorkerMsg::Drain).is_err() {
            // Thread already gone; the exit event will clean up.
            return;
        }
        self.core
            .metrics
            .counters
            .scale_downs
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.core.events.emit(PoolEvent::ScaledDown { size: live - 1 });
        self.channel
            .debug(|| format!("draining {} (scale-down)", victim.id));
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Heartbeat(hb) => {
                let now = Instant::now();
                let mut became_ready = false;
                if let Some(worker) = self.core.workers.get(&hb.worker) {
                    worker.note_heartbeat(now);
                    if worker.status() == WorkerStatus::Starting {
                        became_ready =
                            worker.transition(WorkerStatus::Starting, WorkerStatus::Idle);
                    }
                }
                self.channel.debug(|| {
                    format!(
                        "{} hb cpu={:.1}% rss={}MB task={:?} lag={:?}",
                        hb.worker, hb.cpu_percent, hb.rss_mb, hb.current_task, hb.sched_lag
                    )
                });
                if hb.sched_lag > self.core.config.heartbeat_period {
                    tracing::warn!(
                        worker = %hb.worker,
                        lag_ms = hb.sched_lag.as_millis() as u64,
                        "worker scheduling delay"
                    );
                }
                if became_ready {
                    self.dispatch_pending();
                }
            }
            WorkerEvent::Outcome(finished) => self.handle_outcome(finished),
            WorkerEvent::Exited { worker, panicked } => self.handle_exit(worker, panicked),
        }
    }

    fn handle_exit(&mut self, worker: WorkerId, panicked: bool) {
        let Some((_, handle)) = self.core.workers.remove(&worker) else {
            // Already reaped (declared dead or forced at shutdown).
            return;
        };
        let previous = handle.force_status(WorkerStatus::Dead);
        let clean = previous == WorkerStatus::Draining && !panicked;

        self.sessions.worker_died(worker);
        self.last_assigned.remove(&worker);
        self.core.metrics.set_pool_size(self.core.workers.len());

        if clean {
            self.core.events.emit(PoolEvent::WorkerDied { worker, code: 0 });
        } else {
            self.core.events.emit(PoolEvent::WorkerDied { worker, code: 1 });
            self.core
                .metrics
                .counters
                .worker_crashes
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.fail_in_flight_of(worker);
            self.replace(&handle);
        }

        // The thread has left its loop; join to release it.
        if let Ok(mut slot) = handle.join.lock()
            && let Some(join) = slot.take()
        {
            let _ = join.join();
        }
        self.dispatch_pending();
    }

    /// Spawn a replacement for a crashed worker while its slot has restart
    /// budget left.
    fn replace(&mut self, dead: &WorkerHandle) {
        if self.core.state() != PoolState::Running {
            return;
        }
        if dead.restart_count >= self.core.config.max_restarts {
            tracing::error!(
                worker = %dead.id,
                restarts = dead.restart_count,
                "restart budget exhausted; pool continues with fewer workers"
            );
            return;
        }
        if let Err(err) = self.spawn_one(dead.restart_count + 1) {
            tracing::error!(error = %err, "replacement spawn failed");
        }
    }

    /// Declare a worker dead without waiting for its thread (hung executor
    /// or lost heartbeat). The thread is detached; a straggling outcome is
    /// dropped by the attempt check in `handle_outcome`.
    fn declare_dead(&mut self, worker: WorkerId, code: i32) {
        let Some((_, handle)) = self.core.workers.remove(&worker) else {
            return;
        };
        handle.force_status(WorkerStatus::Dead);
        self.sessions.worker_died(worker);
        self.last_assigned.remove(&worker);
        self.core.metrics.set_pool_size(self.core.workers.len());
        self.core
            .metrics
            .counters
            .worker_crashes
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::warn!(
            worker = %worker,
            code,
            completed = handle.tasks_completed.load(std::sync::atomic::Ordering::SeqCst),
            failed = handle.tasks_failed.load(std::sync::atomic::Ordering::SeqCst),
            sessions_remaining = self.sessions.len(),
            "worker declared dead"
        );
        self.core.events.emit(PoolEvent::WorkerDied { worker, code });
        if let Ok(mut slot) = handle.join.lock() {
            // Detach: the thread may be wedged in the executor.
            slot.take();
        }
        self.fail_in_flight_of(worker);
        self.replace(&handle);
        self.dispatch_pending();
    }

    fn fail_in_flight_of(&mut self, worker: WorkerId) {
        let ids: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, infl)| infl.worker == worker)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let Some(infl) = self.in_flight.remove(&id) else {
                continue;
            };
            if self.core.state() == PoolState::Running
                && infl.task.attempts_so_far < infl.task.max_retries
            {
                self.requeue_retry(infl);
            } else {
                self.resolve_in_flight(
                    infl,
                    TaskOutcome::Failure {
                        kind: FailureKind::WorkerCrashed,
                        message: "worker died".into(),
                    },
                    Resolution::Failed,
                );
            }
        }
    }

    // Dispatch

    fn dispatch_pending(&mut self) {
        self.resolve_expired_queued(Instant::now());
        if self.core.state() != PoolState::Running {
            return;
        }

        'outer: loop {
            if self.core.queue.is_empty() {
                break;
            }
            let idle = self.idle_candidates();
            if idle.is_empty() {
                break;
            }
            let first = self.policy.pick(&idle).unwrap_or(0);

            for offset in 0..idle.len() {
                let worker = idle[(first + offset) % idle.len()].clone();
                match self.pop_for(&worker) {
                    Ok(Some(queued)) => {
                        self.send_assignment(queued, worker);
                        continue 'outer;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        self.core.metrics.on_internal_error("queue pop failed");
                        tracing::error!(error = %err, "dispatch aborted");
                        break 'outer;
                    }
                }
            }
            // Nothing eligible for any idle worker (all remaining tasks are
            // pinned to busy workers).
            break;
        }
    }

    /// Idle workers whose breaker admits traffic and whose inbox holds no
    /// outstanding assignment (so the queue, not worker inboxes, buffers
    /// backlog), sorted by id for stable policy rotation.
    fn idle_candidates(&self) -> Vec<Arc<WorkerHandle>> {
        let mut idle: Vec<Arc<WorkerHandle>> = self
            .core
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|w| {
                w.status() == WorkerStatus::Idle
                    && w.active_tasks.load(std::sync::atomic::Ordering::SeqCst) == 0
                    && w.breaker.admits()
            })
            .collect();
        idle.sort_by_key(|w| w.id);
        idle
    }

    fn pop_for(&mut self, worker: &WorkerHandle) -> Result<Option<QueuedTask>, PoolError> {
        let sessions = &mut self.sessions;
        let workers = &self.core.workers;
        self.core.queue.pop_next_for(worker.id, |key| {
            // A mapping to a worker that is no longer dispatchable counts
            // as unmapped: the task may go anywhere and will be re-pinned.
            sessions.map(key).filter(|id| {
                workers
                    .get(id)
                    .map(|w| {
                        matches!(w.status(), WorkerStatus::Idle | WorkerStatus::Busy)
                    })
                    .unwrap_or(false)
            })
        })
    }

    fn send_assignment(&mut self, queued: QueuedTask, worker: Arc<WorkerHandle>) {
        // Breaker may have opened between selection and send: re-select
        // once, then fall back to the queue head.
        if !worker.breaker.admits() {
            let idle = self.idle_candidates();
            let other = idle.into_iter().find(|w| w.id != worker.id);
            match other {
                Some(other) => return self.send_assignment(queued, other),
                None => {
                    if let Err(err) = self.core.queue.push_front(queued) {
                        self.core.metrics.on_internal_error("requeue after breaker");
                        tracing::error!(error = %err, "lost task on breaker re-selection");
                    }
                    return;
                }
            }
        }

        let QueuedTask {
            task,
            resolver,
            token,
        } = queued;
        let now = Instant::now();

        worker.breaker.admit();
        if let Some(key) = task.preferred_session.as_deref() {
            self.sessions.bind(key, worker.id);
        }
        if task.attempts_so_far == 0 {
            self.core
                .metrics
                .record_wait_in_queue(&task.kind, now.duration_since(task.submitted_at));
        }

        self.in_flight.insert(
            task.id,
            InFlight {
                task: task.clone(),
                resolver,
                token: token.clone(),
                worker: worker.id,
            },
        );
        worker
            .active_tasks
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.last_assigned.insert(worker.id, now);
        self.dispatch_channel
            .debug(|| format!("{} -> {}", task.id, worker.id));

        if let Err(send_error) = worker.inbox.send(WorkerMsg::Assign(Assignment { task, token }))
            && let WorkerMsg::Assign(assignment) = send_error.into_inner()
        {
            // Worker thread is gone; undo, take it out of the candidate set
            // and let the exit event finish the cleanup.
            worker.force_status(WorkerStatus::Dead);
            worker
                .active_tasks
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            if let Some(infl) = self.in_flight.remove(&assignment.task.id) {
                let requeued = QueuedTask {
                    task: assignment.task,
                    resolver: infl.resolver,
                    token: assignment.token,
                };
                if self.core.queue.push_front(requeued).is_err() {
                    self.core.metrics.on_internal_error("requeue after dead inbox");
                }
            }
        }
    }

    // Outcome handling

    fn handle_outcome(&mut self, finished: TaskFinished) {
        let now = Instant::now();
        let Some(infl) = self.in_flight.remove(&finished.task_id) else {
            // Late result from a worker we already declared dead; the task
            // was retried or resolved elsewhere.
            self.dispatch_channel
                .debug(|| format!("stale outcome for {} ignored", finished.task_id));
            return;
        };
        if infl.worker != finished.worker || infl.task.attempts_so_far != finished.attempt {
            // Same story, but the task id is already live again on another
            // worker; put the entry back untouched.
            self.in_flight.insert(finished.task_id, infl);
            self.dispatch_channel
                .debug(|| format!("stale outcome for {} ignored", finished.task_id));
            return;
        }

        if let Some(worker) = self.core.workers.get(&finished.worker) {
            worker
                .active_tasks
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }
        self.core
            .metrics
            .record_worker_busy(finished.worker, finished.busy);

        match finished.outcome {
            TaskOutcome::Success(bytes) => {
                self.notify_breaker_success(finished.worker);
                self.core
                    .metrics
                    .record_task_latency(&infl.task.kind, now.duration_since(infl.task.submitted_at));
                self.resolve_in_flight(infl, TaskOutcome::Success(bytes), Resolution::Completed);
            }
            TaskOutcome::Cancelled => {
                self.resolve_in_flight(infl, TaskOutcome::Cancelled, Resolution::Cancelled);
            }
            outcome @ (TaskOutcome::Failure { .. } | TaskOutcome::Timeout) => {
                self.notify_breaker_failure(finished.worker, now);
                if self.core.state() == PoolState::Running
                    && infl.task.attempts_so_far < infl.task.max_retries
                {
                    self.requeue_retry(infl);
                } else {
                    let resolution = match outcome {
                        TaskOutcome::Timeout => Resolution::TimedOut,
                        _ => Resolution::Failed,
                    };
                    self.core.metrics.record_task_latency(
                        &infl.task.kind,
                        now.duration_since(infl.task.submitted_at),
                    );
                    self.resolve_in_flight(infl, outcome, resolution);
                }
            }
        }

        self.dispatch_pending();
    }

    fn requeue_retry(&mut self, mut infl: InFlight) {
        infl.task.attempts_so_far += 1;
        infl.task.deadline = Some(Instant::now() + infl.task.timeout);
        let token = infl.token.rearm();
        self.core.metrics.on_retried();
        self.dispatch_channel.debug(|| {
            format!(
                "{} retry {}/{}",
                infl.task.id, infl.task.attempts_so_far, infl.task.max_retries
            )
        });
        let requeued = QueuedTask {
            task: infl.task,
            resolver: infl.resolver,
            token,
        };
        if let Err(err) = self.core.queue.push_front(requeued) {
            self.core.metrics.on_internal_error("retry requeue failed");
            tracing::error!(error = %err, "retry requeue failed");
        }
    }

    fn resolve_in_flight(
        &mut self,
        mut infl: InFlight,
        outcome: TaskOutcome,
        resolution: Resolution,
    ) {
        infl.resolver.resolve(outcome);
        self.core.metrics.on_resolved(&infl.task.kind, resolution);
    }

    fn resolve_queued(&mut self, mut queued: QueuedTask, outcome: TaskOutcome, resolution: Resolution) {
        queued.resolver.resolve(outcome);
        self.core.metrics.on_resolved(&queued.task.kind, resolution);
    }

    fn notify_breaker_success(&mut self, worker: WorkerId) {
        let transition = self
            .core
            .workers
            .get(&worker)
            .and_then(|w| w.breaker.on_success());
        if let Some(transition) = transition {
            self.emit_breaker(worker, transition);
        }
    }

    fn notify_breaker_failure(&mut self, worker: WorkerId, now: Instant) {
        let transition = self
            .core
            .workers
            .get(&worker)
            .and_then(|w| w.breaker.on_failure(now));
        if let Some(transition) = transition {
            self.emit_breaker(worker, transition);
        }
    }

    fn emit_breaker(&mut self, worker: WorkerId, transition: BreakerTransition) {
        use std::sync::atomic::Ordering;
        match transition {
            BreakerTransition::Opened => {
                self.core.metrics.counters.breaker_opens.fetch_add(1, Ordering::Relaxed);
                self.core.events.emit(PoolEvent::BreakerOpened { worker });
            }
            BreakerTransition::HalfOpened => {
                self.core.events.emit(PoolEvent::BreakerHalfOpen { worker });
            }
            BreakerTransition::Closed => {
                self.core.metrics.counters.breaker_closes.fetch_add(1, Ordering::Relaxed);
                self.core.events.emit(PoolEvent::BreakerClosed { worker });
            }
        }
    }

    // Cancellation and timeouts

    fn handle_cancel(&mut self, id: TaskId) {
        match self.core.queue.cancel(id) {
            Ok(Some(queued)) => {
                self.resolve_queued(queued, TaskOutcome::Cancelled, Resolution::Cancelled);
            }
            Ok(None) => {
                // In flight (or already resolved): the cancel bit is on the
                // shared token; nudge the worker as well.
                if let Some(infl) = self.in_flight.get(&id)
                    && let Some(worker) = self.core.workers.get(&infl.worker)
                {
                    let _ = worker.inbox.send(WorkerMsg::CancelCurrent { task_id: id });
                }
            }
            Err(err) => {
                self.core.metrics.on_internal_error("queue cancel failed");
                tracing::error!(error = %err, "cancel failed");
            }
        }
    }

    fn resolve_expired_queued(&mut self, now: Instant) {
        match self.core.queue.sweep_expired(now) {
            Ok(expired) => {
                for queued in expired {
                    self.dispatch_channel
                        .debug(|| format!("{} expired in queue", queued.task.id));
                    self.resolve_queued(queued, TaskOutcome::Timeout, Resolution::TimedOut);
                }
            }
            Err(err) => {
                self.core.metrics.on_internal_error("deadline sweep failed");
                tracing::error!(error = %err, "deadline sweep failed");
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();

        // Cooldown expiry can re-admit open breakers.
        let half_opened: Vec<WorkerId> = self
            .core
            .workers
            .iter()
            .filter(|entry| entry.value().breaker.maybe_half_open(now).is_some())
            .map(|entry| *entry.key())
            .collect();
        for worker in half_opened {
            self.emit_breaker(worker, BreakerTransition::HalfOpened);
        }

        self.resolve_expired_queued(now);

        // In-flight deadline enforcement: first the cooperative cancel,
        // then the hard declare-dead past the grace margin.
        let grace = self.core.config.deadline_grace;
        let mut hung: Vec<WorkerId> = Vec::new();
        for infl in self.in_flight.values() {
            if let Some(deadline) = infl.task.deadline {
                if now >= deadline && !infl.token.timed_out() {
                    infl.token.mark_timed_out();
                    if let Some(worker) = self.core.workers.get(&infl.worker) {
                        let _ = worker.inbox.send(WorkerMsg::CancelCurrent {
                            task_id: infl.task.id,
                        });
                    }
                }
                if now >= deadline + grace {
                    hung.push(infl.worker);
                }
            }
        }
        for worker in hung {
            tracing::warn!(worker = %worker, "worker exceeded task deadline + grace");
            self.declare_dead(worker, 3);
        }

        // Heartbeat liveness for workers that should be chatty.
        let allowed = self.core.config.heartbeat_period
            * (self.core.config.heartbeat_misses_allowed + 1);
        let silent: Vec<WorkerId> = self
            .core
            .workers
            .iter()
            .filter(|entry| {
                matches!(
                    entry.value().status(),
                    WorkerStatus::Starting | WorkerStatus::Idle
                ) && entry.value().heartbeat_age(now) > allowed
            })
            .map(|entry| *entry.key())
            .collect();
        for worker in silent {
            tracing::warn!(worker = %worker, "worker missed heartbeats");
            self.declare_dead(worker, 2);
        }

        self.dispatch_pending();
    }

    // Shutdown

    fn run_shutdown(&mut self, deadline: Duration, reply: Option<Sender<ShutdownReport>>) {
        let started = Instant::now();
        self.core.set_state(PoolState::Draining);
        self.core.queue.set_shutting_down();
        self.core.events.emit(PoolEvent::ShutdownInitiated);
        self.channel
            .debug(|| format!("shutdown started (deadline {deadline:?})"));

        let completed_before = self
            .core
            .metrics
            .counters
            .tasks_completed
            .load(std::sync::atomic::Ordering::Relaxed);
        let mut cancelled: u64 = 0;

        // Queued work never starts once drain begins.
        match self.core.queue.drain_all() {
            Ok(queued) => {
                for task in queued {
                    cancelled += 1;
                    self.resolve_queued(task, TaskOutcome::Cancelled, Resolution::Cancelled);
                }
            }
            Err(err) => {
                self.core.metrics.on_internal_error("shutdown drain failed");
                tracing::error!(error = %err, "shutdown queue drain failed");
            }
        }

        // Ask every worker to finish its current task and leave.
        for entry in self.core.workers.iter() {
            let worker = entry.value();
            worker.force_status(WorkerStatus::Draining);
            let _ = worker.inbox.send(WorkerMsg::Drain);
        }

        // Graceful phase: consume outcomes and exits until empty or late.
        let mut drained: usize = 0;
        while !self.core.workers.is_empty() {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            match self.events_rx.recv_timeout(remaining) {
                Ok(WorkerEvent::Outcome(finished)) => self.handle_outcome(finished),
                Ok(WorkerEvent::Heartbeat(hb)) => {
                    if let Some(worker) = self.core.workers.get(&hb.worker) {
                        worker.note_heartbeat(Instant::now());
                    }
                }
                Ok(WorkerEvent::Exited { worker, .. }) => {
                    if let Some((_, handle)) = self.core.workers.remove(&worker) {
                        handle.force_status(WorkerStatus::Dead);
                        drained += 1;
                        self.core.events.emit(PoolEvent::WorkerDied { worker, code: 0 });
                        if let Ok(mut slot) = handle.join.lock()
                            && let Some(join) = slot.take()
                        {
                            let _ = join.join();
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Force phase: whatever is still alive is detached and declared dead.
        let forced: Vec<WorkerId> = self.core.workers.iter().map(|e| *e.key()).collect();
        for worker in &forced {
            if let Some((_, handle)) = self.core.workers.remove(worker) {
                handle.force_status(WorkerStatus::Dead);
                self.core.events.emit(PoolEvent::WorkerDied {
                    worker: *worker,
                    code: 4,
                });
                if let Ok(mut slot) = handle.join.lock() {
                    slot.take();
                }
            }
        }

        // In-flight tasks on forced workers resolve as cancelled.
        let leftover: Vec<TaskId> = self.in_flight.keys().copied().collect();
        for id in leftover {
            if let Some(infl) = self.in_flight.remove(&id) {
                cancelled += 1;
                self.resolve_in_flight(infl, TaskOutcome::Cancelled, Resolution::Cancelled);
            }
        }

        self.core.metrics.set_pool_size(0);
        self.core.set_state(PoolState::Terminated);
        self.core.events.emit(PoolEvent::ShutdownComplete);

        let completed_after = self
            .core
            .metrics
            .counters
            .tasks_completed
            .load(std::sync::atomic::Ordering::Relaxed);
        let report = ShutdownReport {
            duration: started.elapsed(),
            workers_drained: drained,
            workers_forced: forced.len(),
            tasks_completed_during_drain: completed_after - completed_before,
            tasks_cancelled: cancelled,
            metrics: self.core.metrics.snapshot(),
        };
        if let Ok(mut slot) = self.core.shutdown_report.lock() {
            *slot = Some(report.clone());
        }
        if let Some(reply) = reply {
            let _ = reply.send(report);
        }
        self.channel.debug(|| "shutdown complete".to_string());
    }
}
