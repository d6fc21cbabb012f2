//! Worker selection policies.
//!
//! A policy ranks the candidate set (live workers whose breaker is not
//! open) and returns the index to try first; the dispatcher falls back to
//! the remaining candidates in rotation when the first choice has no
//! eligible task. Candidates are presented sorted by worker id, so
//! rotation is stable across calls.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};

use crate::worker::{WorkerHandle, WorkerStatus};

/// Config-selectable policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerPolicy {
    RoundRobin,
    LeastConnections,
    /// Session-pinned tasks always follow their mapping; this policy makes
    /// the *unpinned* choice least-connections, which is also the fallback
    /// used when a mapped worker has gone away.
    Sticky,
}

pub(crate) trait SelectionPolicy: Send {
    /// Index of the preferred candidate, or `None` for an empty set.
    fn pick(&mut self, candidates: &[Arc<WorkerHandle>]) -> Option<usize>;
}

pub(crate) fn make_policy(policy: BalancerPolicy) -> Box<dyn SelectionPolicy> {
    match policy {
        BalancerPolicy::RoundRobin => Box::new(RoundRobin { cursor: 0 }),
        // Sticky differs from least-connections only in the session
        // machinery, which lives in the queue and session router.
        BalancerPolicy::LeastConnections | BalancerPolicy::Sticky => Box::new(LeastConnections),
    }
}

/// Stable rotation. Idle candidates are preferred; when everything is busy
/// the least-loaded busy worker is chosen instead.
struct RoundRobin {
    cursor: usize,
}

impl SelectionPolicy for RoundRobin {
    fn pick(&mut self, candidates: &[Arc<WorkerHandle>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let idle: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, w)| w.status() == WorkerStatus::Idle)
            .map(|(idx, _)| idx)
            .collect();
        if idle.is_empty() {
            return least_loaded(candidates);
        }
        let choice = idle[self.cursor % idle.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Some(choice)
    }
}

/// Minimum outstanding assignments, lowest id on ties.
struct LeastConnections;

impl SelectionPolicy for LeastConnections {
    fn pick(&mut self, candidates: &[Arc<WorkerHandle>]) -> Option<usize> {
        least_loaded(candidates)
    }
}

fn least_loaded(candidates: &[Arc<WorkerHandle>]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(_, w)| (w.active_tasks.load(Ordering::SeqCst), w.id))
        .map(|(idx, _)| idx)
}
