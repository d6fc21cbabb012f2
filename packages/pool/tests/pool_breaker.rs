//! Circuit breaker isolation: open on failures, route around, recover.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{ScriptedExecutor, wait_for_event, wait_until};
use foreman_pool::{
    BreakerConfig, PoolConfig, PoolError, PoolEvent, TaskOutcome, TaskSpec, WorkerPool,
};

fn breaker_config(workers: usize) -> PoolConfig {
    PoolConfig {
        min_workers: workers,
        max_workers: workers,
        max_queue_size: 50,
        heartbeat_period: Duration::from_millis(50),
        breaker: BreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            cooldown: Duration::from_millis(250),
        },
        ..PoolConfig::default()
    }
}

#[test]
fn breaker_opens_after_five_failures_and_recovers() {
    let executor = ScriptedExecutor::new();
    let pool = WorkerPool::new(breaker_config(1), executor).expect("pool");
    let mut events = pool.events();

    for _ in 0..5 {
        let outcome = pool
            .submit(TaskSpec::new("fail", Vec::new()))
            .expect("submit")
            .wait();
        assert!(matches!(outcome, TaskOutcome::Failure { .. }));
    }

    assert!(
        wait_for_event(&mut events, Duration::from_secs(2), |e| matches!(
            e,
            PoolEvent::BreakerOpened { .. }
        ))
        .is_some(),
        "breaker never opened"
    );
    assert_eq!(pool.metrics().counters.breaker_opens, 1);

    // Single worker, firmly open: nothing can take the task.
    assert!(
        wait_until(Duration::from_secs(1), || matches!(
            pool.submit(TaskSpec::new("echo", Vec::new())),
            Err(PoolError::BreakerOpen)
        )),
        "submission was not rejected while open"
    );

    // After the cooldown the breaker probes again.
    assert!(
        wait_for_event(&mut events, Duration::from_secs(2), |e| matches!(
            e,
            PoolEvent::BreakerHalfOpen { .. }
        ))
        .is_some(),
        "breaker never half-opened"
    );

    for _ in 0..3 {
        let outcome = pool
            .submit(TaskSpec::new("echo", Vec::new()))
            .expect("submit")
            .wait();
        assert!(outcome.is_success());
    }

    assert!(
        wait_for_event(&mut events, Duration::from_secs(2), |e| matches!(
            e,
            PoolEvent::BreakerClosed { .. }
        ))
        .is_some(),
        "breaker never closed"
    );
    assert_eq!(pool.metrics().counters.breaker_closes, 1);

    pool.shutdown(Duration::from_secs(2));
}

#[test]
fn open_breaker_routes_traffic_to_healthy_workers() {
    let executor = ScriptedExecutor::new();
    let pool = WorkerPool::new(breaker_config(2), executor.clone()).expect("pool");
    let mut events = pool.events();

    // The first worker to touch a poisonable task keeps failing them until
    // its breaker opens; waits keep attempts sequential so the victim's
    // failures stay consecutive.
    let mut victim_failures = 0;
    while victim_failures < 5 {
        let outcome = pool
            .submit(TaskSpec::new("poisonable", b"x".to_vec()))
            .expect("submit")
            .wait();
        if matches!(outcome, TaskOutcome::Failure { .. }) {
            victim_failures += 1;
        }
    }

    assert!(
        wait_for_event(&mut events, Duration::from_secs(2), |e| matches!(
            e,
            PoolEvent::BreakerOpened { .. }
        ))
        .is_some(),
        "victim breaker never opened"
    );
    let victim = executor.victim.get().cloned().expect("victim recorded");

    // While the victim is open, every task lands on the other worker.
    let before = executor.executions().len();
    for _ in 0..6 {
        let outcome = pool
            .submit(TaskSpec::new("poisonable", b"x".to_vec()))
            .expect("submit")
            .wait();
        assert!(outcome.is_success(), "healthy worker should carry traffic");
    }
    let routed = &executor.executions()[before..];
    assert!(
        routed.iter().all(|(_, worker)| *worker != victim),
        "traffic reached the open worker"
    );

    // Heal the victim; after cooldown its probes succeed and it closes.
    executor.healed.store(true, Ordering::SeqCst);
    assert!(
        wait_for_event(&mut events, Duration::from_secs(3), |e| matches!(
            e,
            PoolEvent::BreakerHalfOpen { .. }
        ))
        .is_some(),
        "victim never half-opened"
    );
    assert!(
        wait_until(Duration::from_secs(5), || {
            for _ in 0..2 {
                let _ = pool
                    .submit(TaskSpec::new("poisonable", b"x".to_vec()))
                    .map(|h| h.wait());
            }
            pool.metrics().counters.breaker_closes >= 1
        }),
        "victim breaker never closed after healing"
    );

    pool.shutdown(Duration::from_secs(2));
}
