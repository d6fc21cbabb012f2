//! Health monitor: composite status, probe registration, debug channels.

mod common;

use std::time::Duration;

use common::ScriptedExecutor;
use foreman_pool::{
    HealthStatus, PoolConfig, Probe, ProbeOutcome, ProbeStatus, TaskSpec, WorkerPool,
};

fn health_config() -> PoolConfig {
    PoolConfig {
        min_workers: 2,
        max_workers: 2,
        heartbeat_period: Duration::from_millis(50),
        health_ttl: Duration::from_millis(100),
        ..PoolConfig::default()
    }
}

#[test]
fn healthy_pool_reports_healthy() {
    let executor = ScriptedExecutor::new();
    let pool = WorkerPool::new(health_config(), executor).expect("pool");

    // Warm up: make sure workers have heartbeated at least once.
    assert!(
        pool.submit(TaskSpec::new("echo", Vec::new()))
            .expect("submit")
            .wait()
            .is_success()
    );

    let report = pool.health();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.workers.total, 2);
    assert_eq!(report.workers.healthy, 2);
    assert_eq!(report.workers.dead, 0);
    assert_eq!(report.queue, 0);
    assert!(report.uptime > Duration::ZERO);

    let names: Vec<&str> = report.probes.iter().map(|p| p.name.as_str()).collect();
    assert!(names.contains(&"worker-responsive"));
    assert!(names.contains(&"queue-within-limit"));
    assert!(names.contains(&"synthetic-task"));
    assert!(report.probes.iter().all(|p| p.status == ProbeStatus::Ok));

    pool.shutdown(Duration::from_secs(2));
}

#[test]
fn failed_critical_probe_makes_the_pool_unhealthy() {
    let executor = ScriptedExecutor::new();
    let pool = WorkerPool::new(health_config(), executor).expect("pool");

    pool.register_probe(Probe::new(
        "backing-store",
        true,
        Duration::from_millis(200),
        || ProbeOutcome::Fail("connection refused".into()),
    ));

    let report = pool.health();
    assert_eq!(report.status, HealthStatus::Unhealthy);
    let probe = report
        .probes
        .iter()
        .find(|p| p.name == "backing-store")
        .expect("registered probe ran");
    assert_eq!(probe.status, ProbeStatus::Fail);
    assert_eq!(probe.reason.as_deref(), Some("connection refused"));
    assert!(probe.critical);

    pool.shutdown(Duration::from_secs(2));
}

#[test]
fn failed_soft_probe_only_degrades() {
    let executor = ScriptedExecutor::new();
    let pool = WorkerPool::new(health_config(), executor).expect("pool");

    pool.register_probe(Probe::new(
        "cache-warm",
        false,
        Duration::from_millis(200),
        || ProbeOutcome::Fail("cold".into()),
    ));

    let report = pool.health();
    assert_eq!(report.status, HealthStatus::Degraded);

    pool.shutdown(Duration::from_secs(2));
}

#[test]
fn health_report_serializes() {
    let executor = ScriptedExecutor::new();
    let pool = WorkerPool::new(health_config(), executor).expect("pool");

    let report = pool.health();
    let json = serde_json::to_value(&report).expect("serialize");
    assert!(json["status"].is_string());
    assert!(json["probes"].is_array());
    assert!(json["workers"]["total"].is_number());

    let metrics = serde_json::to_value(pool.metrics()).expect("serialize");
    assert!(metrics["counters"]["tasks_submitted"].is_number());

    pool.shutdown(Duration::from_secs(2));
}
