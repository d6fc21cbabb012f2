//! Shared fixtures for the pool integration tests.

// Each test binary compiles its own copy and uses a different subset.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use foreman_pool::{EventStream, PoolEvent, TaskContext, TaskError, TaskExecutor};

/// Executor with scripted behavior per task `kind`, recording which worker
/// thread ran each task. Worker threads are named `worker-{id}` by the
/// pool, so the thread name identifies the worker.
pub struct ScriptedExecutor {
    /// `(task_id, worker thread name)`, appended when execution starts.
    pub log: Arc<Mutex<Vec<(u64, String)>>>,
    /// First worker to run a `poisonable` task; it keeps failing them
    /// until `healed` is set.
    pub victim: OnceLock<String>,
    pub healed: AtomicBool,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        // Let RUST_LOG surface pool tracing and debug-channel output when a
        // test needs a closer look.
        let _ = env_logger::builder().is_test(true).try_init();
        Arc::new(Self {
            log: Arc::new(Mutex::new(Vec::new())),
            victim: OnceLock::new(),
            healed: AtomicBool::new(false),
        })
    }

    pub fn executions(&self) -> Vec<(u64, String)> {
        self.log.lock().expect("log lock").clone()
    }

    pub fn workers_used(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .executions()
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl TaskExecutor for ScriptedExecutor {
    fn execute(&self, ctx: TaskContext<'_>) -> Result<Vec<u8>, TaskError> {
        let worker = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        self.log
            .lock()
            .expect("log lock")
            .push((ctx.task_id.0, worker.clone()));

        match ctx.kind {
            // Byte-wise echo.
            "echo" | "cpu" => Ok(ctx.payload.to_vec()),

            // Always fails.
            "fail" => Err(TaskError::new("scripted failure")),

            // Sleeps for the duration encoded in the payload (millis,
            // little-endian u64), polling cancellation.
            "sleep" => {
                let millis = payload_millis(ctx.payload);
                let deadline = Instant::now() + Duration::from_millis(millis);
                while Instant::now() < deadline {
                    if ctx.is_cancelled() {
                        return Err(TaskError::new("interrupted"));
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
                Ok(Vec::new())
            }

            // Busy until cancelled (cooperative hang).
            "hang" => {
                let give_up = Instant::now() + Duration::from_secs(10);
                while !ctx.is_cancelled() && Instant::now() < give_up {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(TaskError::new("hung"))
            }

            // Ignores cancellation entirely; the supervisor has to declare
            // the worker dead.
            "wedge" => {
                std::thread::sleep(Duration::from_secs(3));
                Err(TaskError::new("wedged"))
            }

            // Panics; the worker must survive.
            "panic" => panic!("scripted panic"),

            // The first worker to run one becomes the victim and fails
            // until healed.
            "poisonable" => {
                let victim = self.victim.get_or_init(|| worker.clone());
                if *victim == worker && !self.healed.load(Ordering::SeqCst) {
                    Err(TaskError::new("victim failure"))
                } else {
                    Ok(ctx.payload.to_vec())
                }
            }

            // Built-in synthetic health probe.
            "health:synthetic" => Ok(Vec::new()),

            other => Err(TaskError::new(format!("unknown kind {other}"))),
        }
    }
}

pub fn payload_millis(payload: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let len = payload.len().min(8);
    bytes[..len].copy_from_slice(&payload[..len]);
    u64::from_le_bytes(bytes)
}

pub fn millis_payload(millis: u64) -> Vec<u8> {
    millis.to_le_bytes().to_vec()
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Drain the stream until an event matching `pred` shows up.
pub fn wait_for_event(
    stream: &mut EventStream,
    timeout: Duration,
    mut pred: impl FnMut(&PoolEvent) -> bool,
) -> Option<PoolEvent> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        while let Some(event) = stream.try_recv() {
            if pred(&event) {
                return Some(event);
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    None
}

/// Collect every event currently buffered.
pub fn drain_events(stream: &mut EventStream) -> Vec<PoolEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.try_recv() {
        events.push(event);
    }
    events
}
