//! Auto-scaling control loop.
//!
//! Reads queue depth and worker idleness on a fixed period and asks the
//! supervisor to grow or shrink by one, with hysteresis dwell times so a
//! bursty queue cannot thrash the pool. The supervisor re-validates every
//! command against the live worker set; this loop only decides intent.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::debug_log::DebugChannel;
use crate::pool::{PoolCore, PoolState};
use crate::supervisor::ControlMsg;
use crate::worker::WorkerStatus;

pub(crate) struct AutoScaler {
    pub core: Arc<PoolCore>,
    pub control: Sender<ControlMsg>,
    /// Any message, or disconnection, stops the loop.
    pub stop: Receiver<()>,
    pub channel: DebugChannel,
}

impl AutoScaler {
    pub(crate) fn run(self) {
        let mut last_scale_up: Option<Instant> = None;
        let mut last_scale_down: Option<Instant> = None;
        let config = &self.core.config;

        loop {
            match self.stop.recv_timeout(config.scale_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if self.core.state() != PoolState::Running {
                return;
            }

            let queue_depth = self.core.queue.len();
            let mut size = 0usize;
            let mut idle = 0usize;
            let mut healthy = 0usize;
            for entry in self.core.workers.iter() {
                let worker = entry.value();
                match worker.status() {
                    WorkerStatus::Starting | WorkerStatus::Idle | WorkerStatus::Busy => {
                        size += 1;
                        if worker.status() == WorkerStatus::Idle {
                            idle += 1;
                        }
                        if worker.breaker.state() != crate::breaker::BreakerState::Open {
                            healthy += 1;
                        }
                    }
                    WorkerStatus::Draining | WorkerStatus::Dead => {}
                }
            }

            let now = Instant::now();
            let up_allowed = last_scale_up
                .is_none_or(|at| now.duration_since(at) > config.scale_up_delay);
            let down_allowed = last_scale_down
                .is_none_or(|at| now.duration_since(at) > config.scale_down_delay);

            // Growing into a pool whose every breaker is open just burns a
            // worker slot, except that with zero healthy workers a fresh
            // worker is the only way traffic ever moves again.
            let pressure =
                queue_depth > config.scale_up_threshold || (healthy == 0 && queue_depth > 0);

            if pressure && size < config.max_workers && up_allowed {
                self.channel.debug(|| {
                    format!("scale up: depth={queue_depth} size={size} healthy={healthy}")
                });
                if self.control.send(ControlMsg::ScaleUp).is_err() {
                    return;
                }
                last_scale_up = Some(now);
            } else if queue_depth == 0
                && idle > config.scale_down_threshold
                && size > config.min_workers
                && down_allowed
            {
                self.channel
                    .debug(|| format!("scale down: idle={idle} size={size}"));
                if self.control.send(ControlMsg::ScaleDown).is_err() {
                    return;
                }
                last_scale_down = Some(now);
            }
        }
    }
}
