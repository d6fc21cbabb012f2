//! Bounded FIFO of pending tasks with session-aware dequeue.
//!
//! The task objects live on the heap; the queue's control state (lock word
//! and size mirror) lives in the pool's shared region and all structural
//! access happens under the region mutex, so the depth word is readable
//! (and waitable) by anything observing the region.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use foreman_sync::{Mutex as RegionMutex, SharedRegion};

use crate::error::PoolError;
use crate::metrics::MetricsRegistry;
use crate::task::{CancelToken, Task, TaskId, TaskResolver};
use crate::worker::WorkerId;

/// A task plus its resolution machinery while it sits in the queue.
pub(crate) struct QueuedTask {
    pub task: Task,
    pub resolver: TaskResolver,
    pub token: CancelToken,
}

pub(crate) struct PendingQueue {
    region: SharedRegion,
    lock: RegionMutex,
    size_offset: usize,
    /// Guarded by `lock`; never touched without holding it.
    items: UnsafeCell<VecDeque<QueuedTask>>,
    capacity: usize,
    shutting_down: AtomicBool,
    metrics: Arc<MetricsRegistry>,
}

// Safety: `items` is only accessed while holding the region mutex.
unsafe impl Send for PendingQueue {}
unsafe impl Sync for PendingQueue {}

impl PendingQueue {
    pub(crate) fn new(
        region: SharedRegion,
        lock_offset: usize,
        size_offset: usize,
        capacity: usize,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, PoolError> {
        let lock = RegionMutex::new(region.clone(), lock_offset)?;
        region.store32(size_offset, 0)?;
        Ok(Self {
            region,
            lock,
            size_offset,
            items: UnsafeCell::new(VecDeque::new()),
            capacity,
            shutting_down: AtomicBool::new(false),
            metrics,
        })
    }

    /// Run `f` over the task list under the region mutex, then republish
    /// the depth word and gauge.
    fn with_items<R>(
        &self,
        f: impl FnOnce(&mut VecDeque<QueuedTask>) -> R,
    ) -> Result<R, PoolError> {
        let _guard = self.lock.lock()?;
        // Safety: the region mutex is held for the whole closure.
        let items = unsafe { &mut *self.items.get() };
        let result = f(items);
        let len = items.len();
        self.region.store32(self.size_offset, len as u32)?;
        self.metrics.set_queue_length(len);
        Ok(result)
    }

    /// Append a new submission. Rejections drop the queued task, which in
    /// turn drops its resolver; the caller never hands out a handle.
    pub(crate) fn push(&self, queued: QueuedTask) -> Result<(), PoolError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        let capacity = self.capacity;
        self.with_items(move |items| {
            if items.len() >= capacity {
                Err(PoolError::QueueFull { capacity })
            } else {
                items.push_back(queued);
                Ok(())
            }
        })?
    }

    /// Re-queue a retry at the head. Bypasses the capacity check: the task
    /// already held a queue slot and retries must not be lost to a burst.
    pub(crate) fn push_front(&self, queued: QueuedTask) -> Result<(), PoolError> {
        self.with_items(move |items| items.push_front(queued))
    }

    /// Oldest task whose `preferred_session` is absent, unmapped, or mapped
    /// to `worker`. FIFO tie-break by position.
    pub(crate) fn pop_next_for(
        &self,
        worker: WorkerId,
        mut resolve_session: impl FnMut(&str) -> Option<WorkerId>,
    ) -> Result<Option<QueuedTask>, PoolError> {
        self.with_items(move |items| {
            let position = items.iter().position(|queued| {
                match queued.task.preferred_session.as_deref() {
                    None => true,
                    Some(key) => match resolve_session(key) {
                        None => true,
                        Some(mapped) => mapped == worker,
                    },
                }
            });
            position.and_then(|idx| items.remove(idx))
        })
    }

    /// Remove every task whose deadline already passed; the caller resolves
    /// them `Timeout` without ever executing them.
    pub(crate) fn sweep_expired(&self, now: Instant) -> Result<Vec<QueuedTask>, PoolError> {
        self.with_items(move |items| {
            let mut expired = Vec::new();
            let mut idx = 0;
            while idx < items.len() {
                if items[idx].task.deadline_passed(now) {
                    if let Some(queued) = items.remove(idx) {
                        expired.push(queued);
                    }
                } else {
                    idx += 1;
                }
            }
            expired
        })
    }

    /// Remove a queued task by id (explicit cancellation before dispatch).
    pub(crate) fn cancel(&self, id: TaskId) -> Result<Option<QueuedTask>, PoolError> {
        self.with_items(move |items| {
            items
                .iter()
                .position(|queued| queued.task.id == id)
                .and_then(|idx| items.remove(idx))
        })
    }

    /// Empty the queue at shutdown.
    pub(crate) fn drain_all(&self) -> Result<Vec<QueuedTask>, PoolError> {
        self.with_items(|items| items.drain(..).collect())
    }

    pub(crate) fn len(&self) -> usize {
        self.region.load32(self.size_offset).unwrap_or(0) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use std::time::Duration;

    fn test_queue(capacity: usize) -> PendingQueue {
        let region = SharedRegion::new(64).expect("region");
        let metrics = Arc::new(MetricsRegistry::new(&[Duration::from_millis(10)]));
        PendingQueue::new(region, 0, 4, capacity, metrics).expect("queue")
    }

    fn queued(id: u64, session: Option<&str>) -> QueuedTask {
        let (resolver, _rx) = TaskResolver::new();
        let user = Arc::new(StdAtomicBool::new(false));
        QueuedTask {
            task: Task {
                id: TaskId(id),
                kind: "test".into(),
                payload: Vec::new(),
                submitted_at: Instant::now(),
                deadline: None,
                timeout: Duration::from_secs(30),
                max_retries: 0,
                attempts_so_far: 0,
                preferred_session: session.map(String::from),
            },
            resolver,
            token: CancelToken::new(user),
        }
    }

    #[test]
    fn push_beyond_capacity_rejects() {
        let queue = test_queue(2);
        queue.push(queued(1, None)).expect("push");
        queue.push(queued(2, None)).expect("push");
        assert!(matches!(
            queue.push(queued(3, None)),
            Err(PoolError::QueueFull { capacity: 2 })
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn push_after_shutdown_rejects() {
        let queue = test_queue(2);
        queue.set_shutting_down();
        assert!(matches!(
            queue.push(queued(1, None)),
            Err(PoolError::ShuttingDown)
        ));
    }

    #[test]
    fn pop_next_for_respects_sessions() {
        let queue = test_queue(8);
        queue.push(queued(1, Some("s1"))).expect("push");
        queue.push(queued(2, None)).expect("push");

        // s1 is pinned to worker 9; worker 5 gets the unpinned task.
        let popped = queue
            .pop_next_for(WorkerId(5), |key| {
                (key == "s1").then_some(WorkerId(9))
            })
            .expect("pop")
            .expect("task");
        assert_eq!(popped.task.id, TaskId(2));

        let popped = queue
            .pop_next_for(WorkerId(9), |key| {
                (key == "s1").then_some(WorkerId(9))
            })
            .expect("pop")
            .expect("task");
        assert_eq!(popped.task.id, TaskId(1));
    }

    #[test]
    fn pop_next_for_unmapped_session_goes_anywhere() {
        let queue = test_queue(8);
        queue.push(queued(1, Some("fresh"))).expect("push");
        let popped = queue
            .pop_next_for(WorkerId(3), |_| None)
            .expect("pop")
            .expect("task");
        assert_eq!(popped.task.id, TaskId(1));
    }

    #[test]
    fn fifo_order_within_session() {
        let queue = test_queue(8);
        queue.push(queued(1, Some("s"))).expect("push");
        queue.push(queued(2, Some("s"))).expect("push");
        queue.push(queued(3, Some("s"))).expect("push");
        for expected in 1..=3u64 {
            let popped = queue
                .pop_next_for(WorkerId(1), |_| Some(WorkerId(1)))
                .expect("pop")
                .expect("task");
            assert_eq!(popped.task.id, TaskId(expected));
        }
    }

    #[test]
    fn sweep_removes_expired_only() {
        let queue = test_queue(8);
        let now = Instant::now();
        let mut stale = queued(1, None);
        stale.task.deadline = Some(now - Duration::from_millis(1));
        let mut fresh = queued(2, None);
        fresh.task.deadline = Some(now + Duration::from_secs(60));
        queue.push(stale).expect("push");
        queue.push(fresh).expect("push");

        let expired = queue.sweep_expired(now).expect("sweep");
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task.id, TaskId(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn cancel_removes_by_id() {
        let queue = test_queue(8);
        queue.push(queued(1, None)).expect("push");
        queue.push(queued(2, None)).expect("push");
        let cancelled = queue.cancel(TaskId(1)).expect("cancel").expect("present");
        assert_eq!(cancelled.task.id, TaskId(1));
        assert!(queue.cancel(TaskId(1)).expect("cancel").is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn retries_jump_the_line() {
        let queue = test_queue(8);
        queue.push(queued(1, None)).expect("push");
        queue.push_front(queued(2, None)).expect("push_front");
        let popped = queue
            .pop_next_for(WorkerId(1), |_| None)
            .expect("pop")
            .expect("task");
        assert_eq!(popped.task.id, TaskId(2));
    }
}
