//! Probe-based health monitoring with a TTL result cache.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;

/// Result of one probe execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok,
    Fail(String),
}

type CheckFn = dyn Fn() -> ProbeOutcome + Send + Sync;

/// A registered health check. Probes run concurrently, each bounded by its
/// own timeout; a timed-out probe counts as failed.
pub struct Probe {
    name: String,
    critical: bool,
    timeout: Duration,
    check: Arc<CheckFn>,
}

impl Probe {
    pub fn new(
        name: impl Into<String>,
        critical: bool,
        timeout: Duration,
        check: impl Fn() -> ProbeOutcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            critical,
            timeout,
            check: Arc::new(check),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub name: String,
    pub status: ProbeStatus,
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub critical: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Worker population broken down by condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCounts {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub dead: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime: Duration,
    pub probes: Vec<ProbeReport>,
    pub workers: WorkerCounts,
    pub queue: usize,
}

/// Runs registered probes and caches the composite result for a short TTL
/// so frequent `health()` calls do not multiply probe load.
pub(crate) struct HealthMonitor {
    probes: Mutex<Vec<Probe>>,
    ttl: Duration,
    cache: Mutex<Option<(Instant, HealthReport)>>,
}

impl HealthMonitor {
    pub(crate) fn new(ttl: Duration, probes: Vec<Probe>) -> Self {
        Self {
            probes: Mutex::new(probes),
            ttl,
            cache: Mutex::new(None),
        }
    }

    pub(crate) fn register(&self, probe: Probe) {
        if let Ok(mut probes) = self.probes.lock() {
            probes.push(probe);
        }
        // A new probe invalidates whatever was cached.
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    pub(crate) fn check(
        &self,
        uptime: Duration,
        workers: WorkerCounts,
        queue: usize,
    ) -> HealthReport {
        if let Ok(cache) = self.cache.lock()
            && let Some((at, report)) = cache.as_ref()
            && at.elapsed() < self.ttl
        {
            return report.clone();
        }

        let probe_reports = self.run_probes();
        let any_critical_failed = probe_reports
            .iter()
            .any(|p| p.critical && p.status == ProbeStatus::Fail);
        let any_failed = probe_reports.iter().any(|p| p.status == ProbeStatus::Fail);
        let status = if any_critical_failed {
            HealthStatus::Unhealthy
        } else if any_failed {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let report = HealthReport {
            status,
            uptime,
            probes: probe_reports,
            workers,
            queue,
        };
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some((Instant::now(), report.clone()));
        }
        report
    }

    /// Launch every probe on its own scratch thread and gather results with
    /// per-probe timeouts.
    fn run_probes(&self) -> Vec<ProbeReport> {
        struct Launched {
            name: String,
            critical: bool,
            timeout: Duration,
            started: Instant,
            rx: crossbeam_channel::Receiver<ProbeOutcome>,
        }

        let launched: Vec<Launched> = {
            let Ok(probes) = self.probes.lock() else {
                return Vec::new();
            };
            probes
                .iter()
                .map(|probe| {
                    let (tx, rx) = crossbeam_channel::bounded(1);
                    let check = probe.check.clone();
                    let _ = thread::Builder::new()
                        .name(format!("health-{}", probe.name))
                        .spawn(move || {
                            let _ = tx.send(check());
                        });
                    Launched {
                        name: probe.name.clone(),
                        critical: probe.critical,
                        timeout: probe.timeout,
                        started: Instant::now(),
                        rx,
                    }
                })
                .collect()
        };

        launched
            .into_iter()
            .map(|probe| {
                let (status, reason) = match probe.rx.recv_timeout(probe.timeout) {
                    Ok(ProbeOutcome::Ok) => (ProbeStatus::Ok, None),
                    Ok(ProbeOutcome::Fail(reason)) => (ProbeStatus::Fail, Some(reason)),
                    Err(RecvTimeoutError::Timeout) => (
                        ProbeStatus::Fail,
                        Some(format!("timed out after {:?}", probe.timeout)),
                    ),
                    Err(RecvTimeoutError::Disconnected) => {
                        (ProbeStatus::Fail, Some("probe panicked".to_string()))
                    }
                };
                ProbeReport {
                    name: probe.name,
                    status,
                    duration: probe.started.elapsed(),
                    reason,
                    critical: probe.critical,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts() -> WorkerCounts {
        WorkerCounts {
            total: 2,
            healthy: 2,
            degraded: 0,
            dead: 0,
        }
    }

    #[test]
    fn healthy_when_all_probes_pass() {
        let monitor = HealthMonitor::new(
            Duration::from_secs(60),
            vec![Probe::new("always-ok", true, Duration::from_secs(1), || {
                ProbeOutcome::Ok
            })],
        );
        let report = monitor.check(Duration::from_secs(1), counts(), 0);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.probes.len(), 1);
        assert_eq!(report.probes[0].status, ProbeStatus::Ok);
    }

    #[test]
    fn critical_failure_is_unhealthy() {
        let monitor = HealthMonitor::new(
            Duration::from_secs(60),
            vec![
                Probe::new("ok", false, Duration::from_secs(1), || ProbeOutcome::Ok),
                Probe::new("bad", true, Duration::from_secs(1), || {
                    ProbeOutcome::Fail("backend gone".into())
                }),
            ],
        );
        let report = monitor.check(Duration::from_secs(1), counts(), 0);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        let bad = report.probes.iter().find(|p| p.name == "bad").expect("bad");
        assert_eq!(bad.reason.as_deref(), Some("backend gone"));
    }

    #[test]
    fn non_critical_failure_is_degraded() {
        let monitor = HealthMonitor::new(
            Duration::from_secs(60),
            vec![Probe::new("soft", false, Duration::from_secs(1), || {
                ProbeOutcome::Fail("meh".into())
            })],
        );
        let report = monitor.check(Duration::from_secs(1), counts(), 0);
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn slow_probe_times_out_as_failure() {
        let monitor = HealthMonitor::new(
            Duration::from_secs(60),
            vec![Probe::new(
                "sleepy",
                true,
                Duration::from_millis(20),
                || {
                    thread::sleep(Duration::from_millis(500));
                    ProbeOutcome::Ok
                },
            )],
        );
        let report = monitor.check(Duration::from_secs(1), counts(), 0);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(
            report.probes[0]
                .reason
                .as_deref()
                .is_some_and(|r| r.contains("timed out"))
        );
    }

    #[test]
    fn results_are_cached_within_ttl() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_probe = runs.clone();
        let monitor = HealthMonitor::new(
            Duration::from_secs(60),
            vec![Probe::new("counted", true, Duration::from_secs(1), move || {
                runs_probe.fetch_add(1, Ordering::SeqCst);
                ProbeOutcome::Ok
            })],
        );
        monitor.check(Duration::from_secs(1), counts(), 0);
        monitor.check(Duration::from_secs(2), counts(), 0);
        monitor.check(Duration::from_secs(3), counts(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
