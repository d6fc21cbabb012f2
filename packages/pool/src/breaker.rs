//! Per-worker circuit breaker.
//!
//! State machine: `Closed → Open → HalfOpen → (Closed | Open)`, never
//! skipping states. In `Closed`, a success resets the consecutive-failure
//! counter to zero. Mutation happens only on the supervisor thread; the
//! atomics exist so the façade and health monitor can read states without
//! locking.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u32> for BreakerState {
    fn from(value: u32) -> Self {
        match value {
            0 => BreakerState::Closed,
            1 => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }
}

/// State change produced by an outcome evaluation; the supervisor turns
/// these into lifecycle events and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened,
    HalfOpened,
    Closed,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU32,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    /// Milliseconds since `epoch`; meaningful only while `Open`.
    opened_at_ms: AtomicU64,
    /// Probes admitted in the current half-open phase.
    half_open_admitted: AtomicU32,
    epoch: Instant,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: AtomicU32::new(BreakerState::Closed as u32),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            half_open_admitted: AtomicU32::new(0),
            epoch: Instant::now(),
            config,
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from(self.state.load(Ordering::SeqCst))
    }

    /// Whether routing may hand this worker a task right now. In half-open
    /// only a bounded number of probes is admitted; the count is consumed
    /// by [`admit`](Self::admit) at dispatch time.
    pub fn admits(&self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                self.half_open_admitted.load(Ordering::SeqCst) < self.config.success_threshold
            }
        }
    }

    /// Consume an admission slot for an actual dispatch.
    pub(crate) fn admit(&self) {
        if self.state() == BreakerState::HalfOpen {
            self.half_open_admitted.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn on_success(&self) -> Option<BreakerTransition> {
        match self.state() {
            BreakerState::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                None
            }
            BreakerState::HalfOpen => {
                let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.state.store(BreakerState::Closed as u32, Ordering::SeqCst);
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    self.consecutive_successes.store(0, Ordering::SeqCst);
                    self.half_open_admitted.store(0, Ordering::SeqCst);
                    Some(BreakerTransition::Closed)
                } else {
                    None
                }
            }
            // An outcome can straggle in while open (e.g. a task assigned
            // just before the breaker tripped); it does not close anything.
            BreakerState::Open => None,
        }
    }

    pub(crate) fn on_failure(&self, now: Instant) -> Option<BreakerTransition> {
        match self.state() {
            BreakerState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.trip(now);
                    Some(BreakerTransition::Opened)
                } else {
                    None
                }
            }
            // Any half-open failure re-opens and restarts the cooldown.
            BreakerState::HalfOpen => {
                self.trip(now);
                Some(BreakerTransition::Opened)
            }
            BreakerState::Open => None,
        }
    }

    /// Called periodically; moves `Open → HalfOpen` once the cooldown has
    /// elapsed.
    pub(crate) fn maybe_half_open(&self, now: Instant) -> Option<BreakerTransition> {
        if self.state() != BreakerState::Open {
            return None;
        }
        let opened_at_ms = self.opened_at_ms.load(Ordering::SeqCst);
        let elapsed_ms = now.duration_since(self.epoch).as_millis() as u64 - opened_at_ms;
        if elapsed_ms >= self.config.cooldown.as_millis() as u64 {
            self.state
                .store(BreakerState::HalfOpen as u32, Ordering::SeqCst);
            self.consecutive_successes.store(0, Ordering::SeqCst);
            self.half_open_admitted.store(0, Ordering::SeqCst);
            Some(BreakerTransition::HalfOpened)
        } else {
            None
        }
    }

    /// True while `Open` with an unexpired cooldown; used by the façade's
    /// all-breakers-open rejection check.
    pub(crate) fn firmly_open(&self, now: Instant) -> bool {
        if self.state() != BreakerState::Open {
            return false;
        }
        let opened_at_ms = self.opened_at_ms.load(Ordering::SeqCst);
        let elapsed_ms = now.duration_since(self.epoch).as_millis() as u64 - opened_at_ms;
        elapsed_ms < self.config.cooldown.as_millis() as u64
    }

    fn trip(&self, now: Instant) {
        self.state.store(BreakerState::Open as u32, Ordering::SeqCst);
        self.opened_at_ms.store(
            now.duration_since(self.epoch).as_millis() as u64,
            Ordering::SeqCst,
        );
        self.consecutive_successes.store(0, Ordering::SeqCst);
        self.half_open_admitted.store(0, Ordering::SeqCst);
    }
}
