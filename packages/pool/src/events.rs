//! Lifecycle event bus.
//!
//! Events are fanned out over a bounded broadcast channel; a subscriber
//! that falls behind loses the oldest events rather than blocking the
//! pool. Every subscriber sees every variant, which is the explicit form
//! of wildcard subscription.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::worker::WorkerId;

/// Buffered events per subscriber before lag drops the oldest.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    WorkerStarted { worker: WorkerId },
    /// `code` 0 is a clean drain exit; non-zero codes are abnormal
    /// (1 panic/exit, 2 heartbeat loss, 3 deadline overrun, 4 forced at
    /// shutdown).
    WorkerDied { worker: WorkerId, code: i32 },
    BreakerOpened { worker: WorkerId },
    BreakerHalfOpen { worker: WorkerId },
    BreakerClosed { worker: WorkerId },
    ScaledUp { size: usize },
    ScaledDown { size: usize },
    ShutdownInitiated,
    ShutdownComplete,
}

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Emit to all current subscribers; no subscribers is not an error.
    pub(crate) fn emit(&self, event: PoolEvent) {
        tracing::debug!(?event, "lifecycle event");
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            lagged: 0,
        }
    }
}

/// Subscriber half of the event bus.
pub struct EventStream {
    rx: broadcast::Receiver<PoolEvent>,
    lagged: u64,
}

impl EventStream {
    /// Next event; `None` once the pool is gone and the buffer is drained.
    pub async fn recv(&mut self) -> Option<PoolEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.lagged += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Blocking variant for thread-based consumers.
    pub fn blocking_recv(&mut self) -> Option<PoolEvent> {
        loop {
            match self.rx.blocking_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.lagged += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll; `None` when no event is currently buffered.
    pub fn try_recv(&mut self) -> Option<PoolEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.lagged += n;
                }
                Err(_) => return None,
            }
        }
    }

    /// Events dropped because this subscriber fell behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }
}
