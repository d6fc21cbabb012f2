//! Metrics registry: atomics per counter, per-slot atomic histogram
//! buckets, wait-free snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::worker::WorkerId;

/// Pool-wide counters. Monotonic across snapshots.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub tasks_submitted: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_retried: AtomicU64,
    pub tasks_timed_out: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    pub tasks_resolved: AtomicU64,
    pub breaker_opens: AtomicU64,
    pub breaker_closes: AtomicU64,
    pub scale_ups: AtomicU64,
    pub scale_downs: AtomicU64,
    pub worker_crashes: AtomicU64,
    pub internal_errors: AtomicU64,
}

#[derive(Debug, Default)]
struct Gauges {
    pool_size: AtomicU64,
    busy_workers: AtomicU64,
    queue_length: AtomicU64,
}

/// Per-`kind` task counters.
#[derive(Debug, Default)]
struct KindCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

/// How a task left the pool; drives counter bookkeeping at resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

pub struct MetricsRegistry {
    pub(crate) counters: Counters,
    gauges: Gauges,
    bucket_bounds: Arc<[Duration]>,
    task_latency: DashMap<String, Histogram>,
    wait_in_queue: DashMap<String, Histogram>,
    worker_busy_time: DashMap<u64, Histogram>,
    per_kind: DashMap<String, KindCounters>,
}

impl MetricsRegistry {
    pub(crate) fn new(bucket_bounds: &[Duration]) -> Self {
        Self {
            counters: Counters::default(),
            gauges: Gauges::default(),
            bucket_bounds: bucket_bounds.into(),
            task_latency: DashMap::new(),
            wait_in_queue: DashMap::new(),
            worker_busy_time: DashMap::new(),
            per_kind: DashMap::new(),
        }
    }

    pub(crate) fn on_submitted(&self, kind: &str) {
        self.counters.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        self.kind_entry(kind).submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_retried(&self) {
        self.counters.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Terminal bookkeeping for one task. Exactly one call per task keeps
    /// `tasks_resolved` equal to the sum of the four terminal counters.
    pub(crate) fn on_resolved(&self, kind: &str, resolution: Resolution) {
        let kind_counters = self.kind_entry(kind);
        match resolution {
            Resolution::Completed => {
                self.counters.tasks_completed.fetch_add(1, Ordering::Relaxed);
                kind_counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Resolution::Failed => {
                self.counters.tasks_failed.fetch_add(1, Ordering::Relaxed);
                kind_counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Resolution::TimedOut => {
                self.counters.tasks_timed_out.fetch_add(1, Ordering::Relaxed);
                kind_counters.timed_out.fetch_add(1, Ordering::Relaxed);
            }
            Resolution::Cancelled => {
                self.counters.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
                kind_counters.cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.counters.tasks_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_task_latency(&self, kind: &str, latency: Duration) {
        self.histogram(&self.task_latency, kind).record(latency);
    }

    pub(crate) fn record_wait_in_queue(&self, kind: &str, wait: Duration) {
        self.histogram(&self.wait_in_queue, kind).record(wait);
    }

    pub(crate) fn record_worker_busy(&self, worker: WorkerId, busy: Duration) {
        self.worker_busy_time
            .entry(worker.0)
            .or_insert_with(|| Histogram::new(self.bucket_bounds.clone()))
            .record(busy);
    }

    pub(crate) fn set_pool_size(&self, size: usize) {
        self.gauges.pool_size.store(size as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_busy(&self, delta: i64) {
        if delta >= 0 {
            self.gauges
                .busy_workers
                .fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            self.gauges
                .busy_workers
                .fetch_sub((-delta) as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_queue_length(&self, length: usize) {
        self.gauges
            .queue_length
            .store(length as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_internal_error(&self, context: &str) {
        self.counters.internal_errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!(context, "internal invariant violated");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: CountersSnapshot {
                tasks_submitted: self.counters.tasks_submitted.load(Ordering::Relaxed),
                tasks_completed: self.counters.tasks_completed.load(Ordering::Relaxed),
                tasks_failed: self.counters.tasks_failed.load(Ordering::Relaxed),
                tasks_retried: self.counters.tasks_retried.load(Ordering::Relaxed),
                tasks_timed_out: self.counters.tasks_timed_out.load(Ordering::Relaxed),
                tasks_cancelled: self.counters.tasks_cancelled.load(Ordering::Relaxed),
                tasks_resolved: self.counters.tasks_resolved.load(Ordering::Relaxed),
                breaker_opens: self.counters.breaker_opens.load(Ordering::Relaxed),
                breaker_closes: self.counters.breaker_closes.load(Ordering::Relaxed),
                scale_ups: self.counters.scale_ups.load(Ordering::Relaxed),
                scale_downs: self.counters.scale_downs.load(Ordering::Relaxed),
                worker_crashes: self.counters.worker_crashes.load(Ordering::Relaxed),
                internal_errors: self.counters.internal_errors.load(Ordering::Relaxed),
            },
            gauges: GaugesSnapshot {
                pool_size: self.gauges.pool_size.load(Ordering::Relaxed),
                busy_workers: self.gauges.busy_workers.load(Ordering::Relaxed),
                queue_length: self.gauges.queue_length.load(Ordering::Relaxed),
            },
            task_latency: summarize(&self.task_latency),
            wait_in_queue: summarize(&self.wait_in_queue),
            worker_busy_time: self
                .worker_busy_time
                .iter()
                .map(|entry| (*entry.key(), entry.value().summary()))
                .collect(),
            per_kind: self
                .per_kind
                .iter()
                .map(|entry| {
                    (
                        entry.key().clone(),
                        KindCountersSnapshot {
                            submitted: entry.value().submitted.load(Ordering::Relaxed),
                            completed: entry.value().completed.load(Ordering::Relaxed),
                            failed: entry.value().failed.load(Ordering::Relaxed),
                            timed_out: entry.value().timed_out.load(Ordering::Relaxed),
                            cancelled: entry.value().cancelled.load(Ordering::Relaxed),
                        },
                    )
                })
                .collect(),
        }
    }

    fn histogram<'a>(
        &self,
        map: &'a DashMap<String, Histogram>,
        kind: &str,
    ) -> dashmap::mapref::one::RefMut<'a, String, Histogram> {
        match map.get_mut(kind) {
            Some(h) => h,
            None => map
                .entry(kind.to_string())
                .or_insert_with(|| Histogram::new(self.bucket_bounds.clone())),
        }
    }

    fn kind_entry(&self, kind: &str) -> dashmap::mapref::one::RefMut<'_, String, KindCounters> {
        match self.per_kind.get_mut(kind) {
            Some(c) => c,
            None => self.per_kind.entry(kind.to_string()).or_default(),
        }
    }
}

fn summarize(map: &DashMap<String, Histogram>) -> BTreeMap<String, HistogramSummary> {
    map.iter()
        .map(|entry| (entry.key().clone(), entry.value().summary()))
        .collect()
}

/// Bucketed latency histogram. One atomic slot per bucket plus running
/// count/sum/min/max; recording is lock-free.
#[derive(Debug)]
pub(crate) struct Histogram {
    bounds: Arc<[Duration]>,
    /// One slot per bound, plus a final overflow slot.
    slots: Box<[AtomicU64]>,
    count: AtomicU64,
    sum_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl Histogram {
    fn new(bounds: Arc<[Duration]>) -> Self {
        let slots = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            slots,
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }

    fn record(&self, value: Duration) {
        let us = value.as_micros() as u64;
        let idx = self
            .bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bounds.len());
        self.slots[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    fn summary(&self) -> HistogramSummary {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return HistogramSummary::default();
        }
        let min_us = self.min_us.load(Ordering::Relaxed);
        let max_us = self.max_us.load(Ordering::Relaxed);
        HistogramSummary {
            count,
            min_us,
            max_us,
            p50_us: self.percentile(0.50, count, min_us, max_us),
            p95_us: self.percentile(0.95, count, min_us, max_us),
            p99_us: self.percentile(0.99, count, min_us, max_us),
        }
    }

    /// Estimate a percentile by linear interpolation inside the bucket that
    /// contains the target rank, clamped to the observed min/max.
    fn percentile(&self, q: f64, count: u64, min_us: u64, max_us: u64) -> u64 {
        let target = ((q * count as f64).ceil() as u64).max(1);
        let mut cumulative = 0u64;
        for (idx, slot) in self.slots.iter().enumerate() {
            let in_bucket = slot.load(Ordering::Relaxed);
            if cumulative + in_bucket >= target {
                let lower_us = if idx == 0 {
                    0
                } else {
                    self.bounds[idx - 1].as_micros() as u64
                };
                let upper_us = if idx < self.bounds.len() {
                    self.bounds[idx].as_micros() as u64
                } else {
                    max_us
                };
                let position = if in_bucket == 0 {
                    0.0
                } else {
                    (target - cumulative) as f64 / in_bucket as f64
                };
                let estimate =
                    lower_us as f64 + position * (upper_us.saturating_sub(lower_us)) as f64;
                return (estimate as u64).clamp(min_us, max_us);
            }
            cumulative += in_bucket;
        }
        max_us
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_timed_out: u64,
    pub tasks_cancelled: u64,
    pub tasks_resolved: u64,
    pub breaker_opens: u64,
    pub breaker_closes: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub worker_crashes: u64,
    pub internal_errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GaugesSnapshot {
    pub pool_size: u64,
    pub busy_workers: u64,
    pub queue_length: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindCountersSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

/// Serializable point-in-time capture of the registry. Counter values are
/// monotonic between successive snapshots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: CountersSnapshot,
    pub gauges: GaugesSnapshot,
    pub task_latency: BTreeMap<String, HistogramSummary>,
    pub wait_in_queue: BTreeMap<String, HistogramSummary>,
    pub worker_busy_time: BTreeMap<u64, HistogramSummary>,
    pub per_kind: BTreeMap<String, KindCountersSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_equals_terminal_sum() {
        let metrics = MetricsRegistry::new(&[Duration::from_millis(10)]);
        metrics.on_submitted("a");
        metrics.on_submitted("a");
        metrics.on_submitted("b");
        metrics.on_resolved("a", Resolution::Completed);
        metrics.on_resolved("a", Resolution::Failed);
        metrics.on_resolved("b", Resolution::TimedOut);

        let snap = metrics.snapshot();
        let c = &snap.counters;
        assert_eq!(
            c.tasks_completed + c.tasks_failed + c.tasks_timed_out + c.tasks_cancelled,
            c.tasks_resolved
        );
        assert_eq!(snap.per_kind["a"].completed, 1);
        assert_eq!(snap.per_kind["b"].timed_out, 1);
    }

    #[test]
    fn counters_monotonic_across_snapshots() {
        let metrics = MetricsRegistry::new(&[Duration::from_millis(10)]);
        metrics.on_submitted("k");
        let first = metrics.snapshot();
        metrics.on_submitted("k");
        let second = metrics.snapshot();
        assert!(second.counters.tasks_submitted >= first.counters.tasks_submitted);
    }

    #[test]
    fn histogram_summary_brackets_observations() {
        let bounds: Vec<Duration> = [1, 10, 100].into_iter().map(Duration::from_millis).collect();
        let hist = Histogram::new(bounds.into());
        for ms in [2u64, 4, 6, 8, 50] {
            hist.record(Duration::from_millis(ms));
        }
        let summary = hist.summary();
        assert_eq!(summary.count, 5);
        assert_eq!(summary.min_us, 2_000);
        assert_eq!(summary.max_us, 50_000);
        assert!(summary.p50_us >= summary.min_us && summary.p50_us <= summary.max_us);
        assert!(summary.p99_us >= summary.p50_us);
    }

    #[test]
    fn empty_histogram_summary_is_zeroed() {
        let hist = Histogram::new(vec![Duration::from_millis(1)].into());
        assert_eq!(hist.summary(), HistogramSummary::default());
    }
}
