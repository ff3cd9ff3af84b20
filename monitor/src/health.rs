use crate::resources::ResourceMonitor;
use cortex_common::config::HealthConfig;
use cortex_common::{now_unix, HealthIssue, HealthStatus, ResourceSnapshot};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Boundary to the workload layer: the set of tasks currently running on
/// this node.
pub trait TaskSource: Send + Sync {
    fn active_tasks(&self) -> Vec<String>;
}

/// Events produced by the health reporter
#[derive(Debug, Clone)]
pub enum HealthEvent {
    Status(HealthStatus),
    Issue(HealthIssue),
}

/// Derives healthy/degraded status from the latest resource snapshot and
/// the running-task set. The issue list is regenerated from scratch every
/// tick; nothing is accumulated across ticks.
pub struct HealthReporter {
    config: HealthConfig,
    monitor: Arc<ResourceMonitor>,
    tasks: Arc<dyn TaskSource>,
    latest: RwLock<Option<HealthStatus>>,
    events: broadcast::Sender<HealthEvent>,
    cancel: CancellationToken,
    started: Instant,
}

impl HealthReporter {
    pub fn new(
        config: HealthConfig,
        monitor: Arc<ResourceMonitor>,
        tasks: Arc<dyn TaskSource>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            monitor,
            tasks,
            latest: RwLock::new(None),
            events,
            cancel: CancellationToken::new(),
            started: Instant::now(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Last status produced; a fresh evaluation when none exists yet.
    pub fn current(&self) -> HealthStatus {
        if let Some(status) = self.latest.read().clone() {
            return status;
        }
        self.check_once()
    }

    pub fn start(self: &Arc<Self>) {
        let reporter = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(reporter.config.check_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = reporter.cancel.cancelled() => {
                        debug!("health reporter stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        reporter.check_once();
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run one health check tick and publish the result.
    pub fn check_once(&self) -> HealthStatus {
        let snapshot = self.monitor.latest();
        let active_tasks = self.tasks.active_tasks();
        let uptime = self.started.elapsed().as_secs();

        let status = self.evaluate(snapshot.as_ref(), active_tasks, uptime);

        for issue in &status.issues {
            if matches!(issue.severity, cortex_common::IssueSeverity::Error) {
                warn!(code = %issue.code, "{}", issue.message);
            }
            let _ = self.events.send(HealthEvent::Issue(issue.clone()));
        }
        let _ = self.events.send(HealthEvent::Status(status.clone()));

        *self.latest.write() = Some(status.clone());
        status
    }

    /// Pure derivation: snapshot + tasks -> status.
    pub fn evaluate(
        &self,
        snapshot: Option<&ResourceSnapshot>,
        active_tasks: Vec<String>,
        uptime_seconds: u64,
    ) -> HealthStatus {
        let mut issues = Vec::new();

        let snapshot = match snapshot {
            Some(s) => s,
            None => {
                issues.push(HealthIssue::warning(
                    "NO_RESOURCES",
                    "no resource snapshot available yet",
                ));
                return HealthStatus {
                    healthy: false,
                    message: "no resource snapshot".to_string(),
                    last_check: now_unix(),
                    uptime_seconds,
                    active_tasks,
                    issues,
                };
            }
        };

        check_threshold(
            &mut issues,
            "memory",
            snapshot.memory.used_pct,
            self.config.memory_warn_pct,
            self.config.memory_error_pct,
        );
        check_threshold(
            &mut issues,
            "cpu",
            snapshot.cpu.usage_percent,
            self.config.cpu_warn_pct,
            self.config.cpu_error_pct,
        );
        check_threshold(
            &mut issues,
            "disk",
            snapshot.disk.used_pct,
            self.config.disk_warn_pct,
            self.config.disk_error_pct,
        );

        if snapshot.gaming_detected {
            issues.push(HealthIssue::warning(
                "GAMING_ACTIVE",
                "gaming activity detected; deferring GPU-heavy work",
            ));
        }

        let has_errors = issues
            .iter()
            .any(|i| matches!(i.severity, cortex_common::IssueSeverity::Error));
        let healthy = !has_errors;

        let message = if issues.is_empty() {
            "ok".to_string()
        } else {
            format!("{} issue(s)", issues.len())
        };

        HealthStatus {
            healthy,
            message,
            last_check: now_unix(),
            uptime_seconds,
            active_tasks,
            issues,
        }
    }
}

fn check_threshold(issues: &mut Vec<HealthIssue>, what: &str, value: f64, warn: f64, error: f64) {
    let upper = what.to_uppercase();
    if value >= error {
        issues.push(HealthIssue::error(
            format!("CRITICAL_{upper}"),
            format!("{what} usage at {value:.1}%"),
        ));
    } else if value >= warn {
        issues.push(HealthIssue::warning(
            format!("HIGH_{upper}"),
            format!("{what} usage at {value:.1}%"),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_common::config::MonitorConfig;
    use cortex_common::{CpuStats, DiskStats, IssueSeverity, MemoryStats};

    struct NoTasks;

    impl TaskSource for NoTasks {
        fn active_tasks(&self) -> Vec<String> {
            Vec::new()
        }
    }

    struct FixedTasks(Vec<String>);

    impl TaskSource for FixedTasks {
        fn active_tasks(&self) -> Vec<String> {
            self.0.clone()
        }
    }

    fn reporter() -> Arc<HealthReporter> {
        HealthReporter::new(
            HealthConfig::default(),
            ResourceMonitor::new(MonitorConfig::default()),
            Arc::new(NoTasks),
        )
    }

    fn snapshot(mem_pct: f64, cpu_pct: f64, disk_pct: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu: CpuStats {
                cores: 8,
                usage_percent: cpu_pct,
                load_avg: [0.0; 3],
            },
            memory: MemoryStats {
                total_bytes: 100,
                available_bytes: 100 - mem_pct as u64,
                used_pct: mem_pct,
            },
            disk: DiskStats {
                total_bytes: 100,
                available_bytes: 100 - disk_pct as u64,
                used_pct: disk_pct,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_missing_snapshot_forces_unhealthy() {
        let status = reporter().evaluate(None, vec![], 5);
        assert!(!status.healthy);
        assert_eq!(status.issues.len(), 1);
        assert_eq!(status.issues[0].code, "NO_RESOURCES");
        assert_eq!(status.issues[0].severity, IssueSeverity::Warning);
    }

    #[tokio::test]
    async fn test_all_clear_is_healthy() {
        let status = reporter().evaluate(Some(&snapshot(50.0, 30.0, 60.0)), vec![], 5);
        assert!(status.healthy);
        assert!(status.issues.is_empty());
        assert_eq!(status.message, "ok");
    }

    #[tokio::test]
    async fn test_warn_thresholds_keep_node_healthy() {
        let status = reporter().evaluate(Some(&snapshot(91.0, 96.0, 96.0)), vec![], 5);
        assert!(status.healthy, "warnings alone never flip healthy");
        assert_eq!(status.issues.len(), 3);
        assert!(status
            .issues
            .iter()
            .all(|i| i.severity == IssueSeverity::Warning));
    }

    #[tokio::test]
    async fn test_error_threshold_marks_unhealthy() {
        let status = reporter().evaluate(Some(&snapshot(96.0, 30.0, 60.0)), vec![], 5);
        assert!(!status.healthy);
        assert_eq!(status.issues[0].code, "CRITICAL_MEMORY");
    }

    #[tokio::test]
    async fn test_gaming_raises_warning_only() {
        let mut snap = snapshot(50.0, 30.0, 60.0);
        snap.gaming_detected = true;
        let status = reporter().evaluate(Some(&snap), vec![], 5);
        assert!(status.healthy);
        assert!(status.issues.iter().any(|i| i.code == "GAMING_ACTIVE"));
    }

    #[tokio::test]
    async fn test_issues_are_regenerated_not_accumulated() {
        let r = reporter();
        let bad = r.evaluate(Some(&snapshot(96.0, 30.0, 60.0)), vec![], 5);
        assert_eq!(bad.issues.len(), 1);
        let good = r.evaluate(Some(&snapshot(50.0, 30.0, 60.0)), vec![], 6);
        assert!(good.issues.is_empty());
        assert!(good.healthy);
    }

    #[tokio::test]
    async fn test_active_tasks_pass_through() {
        let r = HealthReporter::new(
            HealthConfig::default(),
            ResourceMonitor::new(MonitorConfig::default()),
            Arc::new(FixedTasks(vec!["bench-1".into()])),
        );
        let status = r.check_once();
        assert_eq!(status.active_tasks, vec!["bench-1".to_string()]);
    }
}
