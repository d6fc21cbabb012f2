//! Auto-scaler behavior: grow under queue pressure, shrink when idle.

mod common;

use std::time::Duration;

use common::{ScriptedExecutor, millis_payload, wait_for_event, wait_until};
use foreman_pool::{PoolConfig, PoolEvent, TaskSpec, WorkerPool};

fn scaling_config() -> PoolConfig {
    PoolConfig {
        min_workers: 2,
        max_workers: 4,
        max_queue_size: 100,
        scale_up_threshold: 3,
        scale_down_threshold: 1,
        scale_up_delay: Duration::from_millis(50),
        scale_down_delay: Duration::from_millis(150),
        scale_interval: Duration::from_millis(25),
        heartbeat_period: Duration::from_millis(50),
        ..PoolConfig::default()
    }
}

#[test]
fn pool_grows_under_load_and_shrinks_back() {
    let executor = ScriptedExecutor::new();
    let pool = WorkerPool::new(scaling_config(), executor).expect("pool");
    let mut events = pool.events();

    let handles: Vec<_> = (0..12)
        .map(|_| {
            pool.submit(TaskSpec::new("sleep", millis_payload(300)))
                .expect("submit")
        })
        .collect();

    // Queue depth beyond the threshold must raise the pool to its maximum.
    let scaled_to_max = wait_for_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, PoolEvent::ScaledUp { size: 4 })
    });
    assert!(scaled_to_max.is_some(), "pool never reached max size");

    for handle in handles {
        assert!(handle.wait().is_success());
    }

    // With the queue empty and workers idle, hysteresis permitting, the
    // pool drops back to its floor.
    assert!(
        wait_until(Duration::from_secs(10), || {
            pool.metrics().gauges.pool_size == 2
        }),
        "pool never shrank back to min"
    );

    let snapshot = pool.metrics();
    assert!(snapshot.counters.scale_ups >= 2);
    assert!(snapshot.counters.scale_downs >= 2);
    // Scale-down drains are clean exits, not crashes.
    assert_eq!(snapshot.counters.worker_crashes, 0);
    assert_eq!(snapshot.counters.tasks_completed, 12);

    pool.shutdown(Duration::from_secs(2));
}

#[test]
fn pool_size_never_leaves_bounds() {
    let executor = ScriptedExecutor::new();
    let pool = WorkerPool::new(scaling_config(), executor).expect("pool");

    let handles: Vec<_> = (0..20)
        .map(|_| {
            pool.submit(TaskSpec::new("sleep", millis_payload(50)))
                .expect("submit")
        })
        .collect();

    // Sample the gauge while the load plays out.
    let sampled_ok = wait_until(Duration::from_secs(10), || {
        let size = pool.metrics().gauges.pool_size;
        assert!((2..=4).contains(&(size as usize)), "size {size} out of bounds");
        pool.metrics().counters.tasks_resolved == 20
    });
    assert!(sampled_ok, "tasks did not finish in time");

    for handle in handles {
        assert!(handle.wait().is_success());
    }
    pool.shutdown(Duration::from_secs(2));
}

#[test]
fn no_scale_up_without_queue_pressure() {
    let executor = ScriptedExecutor::new();
    let pool = WorkerPool::new(scaling_config(), executor).expect("pool");

    for _ in 0..3 {
        assert!(
            pool.submit(TaskSpec::new("echo", Vec::new()))
                .expect("submit")
                .wait()
                .is_success()
        );
        std::thread::sleep(Duration::from_millis(60));
    }

    assert_eq!(pool.metrics().counters.scale_ups, 0);
    pool.shutdown(Duration::from_secs(2));
}
