use cortex_common::config::MonitorConfig;
use cortex_common::{now_unix_ms, CpuStats, DiskStats, GpuStats, MemoryStats, ResourceSnapshot};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Events produced by the resource monitor
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Snapshot(ResourceSnapshot),
    GamingStarted,
    GamingEnded,
}

/// Gaming-activity state machine with hysteresis.
///
/// A snapshot is gaming-positive when a running process name matches the
/// configured set (case-insensitive substring) or any GPU exceeds the
/// utilization threshold. After gaming ends the tracker stays "in cooldown"
/// for the configured window so GPU-heavy scheduling can be deferred.
/// The clock is monotonic; wall-clock jumps cannot reopen the window.
#[derive(Debug)]
pub struct GamingTracker {
    processes: Vec<String>,
    gpu_threshold_pct: f64,
    cooldown: Duration,
    gaming: bool,
    gaming_started_at: Option<Instant>,
    gaming_ended_at: Option<Instant>,
}

impl GamingTracker {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            processes: config
                .gaming_processes
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            gpu_threshold_pct: config.gaming_gpu_threshold_pct,
            cooldown: Duration::from_millis(config.gaming_cooldown_ms),
            gaming: false,
            gaming_started_at: None,
            gaming_ended_at: None,
        }
    }

    fn matches_process(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.processes.iter().any(|p| lower.contains(p.as_str()))
    }

    /// Fold one snapshot into the state machine. Marks per-GPU gaming flags
    /// and `gaming_detected` on the snapshot, and returns a transition event
    /// when the gaming state flipped. Repeated identical snapshots are
    /// idempotent.
    pub fn observe(
        &mut self,
        snapshot: &mut ResourceSnapshot,
        process_names: &[String],
        now: Instant,
    ) -> Option<MonitorEvent> {
        let process_hit = process_names.iter().any(|n| self.matches_process(n));

        for gpu in snapshot.gpus.iter_mut() {
            gpu.in_use_for_gaming = gpu.utilization_pct > self.gpu_threshold_pct;
        }
        let gpu_hit = snapshot.gpus.iter().any(|g| g.in_use_for_gaming);

        let current = process_hit || gpu_hit;
        snapshot.gaming_detected = current;

        match (self.gaming, current) {
            (false, true) => {
                self.gaming = true;
                self.gaming_started_at = Some(now);
                Some(MonitorEvent::GamingStarted)
            }
            (true, false) => {
                self.gaming = false;
                self.gaming_ended_at = Some(now);
                Some(MonitorEvent::GamingEnded)
            }
            _ => None,
        }
    }

    pub fn gaming(&self) -> bool {
        self.gaming
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        if self.gaming {
            return false;
        }
        match self.gaming_ended_at {
            Some(ended) => now.duration_since(ended) < self.cooldown,
            None => false,
        }
    }
}

/// Periodic local telemetry producer (CPU, memory, disk, GPUs).
///
/// A failing sub-source defaults its snapshot field and is logged; the
/// snapshot cadence is never broken by a single failing probe.
pub struct ResourceMonitor {
    config: MonitorConfig,
    system: Mutex<System>,
    tracker: Mutex<GamingTracker>,
    latest: RwLock<Option<ResourceSnapshot>>,
    events: broadcast::Sender<MonitorEvent>,
    cancel: CancellationToken,
    gpu_probe_failed: AtomicBool,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            tracker: Mutex::new(GamingTracker::new(&config)),
            config,
            system: Mutex::new(System::new_all()),
            latest: RwLock::new(None),
            events,
            cancel: CancellationToken::new(),
            gpu_probe_failed: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Last snapshot produced, if any.
    pub fn latest(&self) -> Option<ResourceSnapshot> {
        self.latest.read().clone()
    }

    pub fn is_in_gaming_cooldown(&self) -> bool {
        self.tracker.lock().in_cooldown(Instant::now())
    }

    pub fn gaming_active(&self) -> bool {
        self.tracker.lock().gaming()
    }

    /// Spawn the periodic poll loop.
    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(monitor.config.poll_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => {
                        debug!("resource monitor stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        monitor.poll_once().await;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Collect one snapshot, run the gaming state machine, publish events.
    pub async fn poll_once(&self) -> ResourceSnapshot {
        let gpus = self.probe_gpus().await;
        let (cpu, memory, disk, process_names) = self.probe_system();

        let mut snapshot = ResourceSnapshot {
            timestamp: now_unix_ms(),
            cpu,
            memory,
            disk,
            gpus,
            gaming_detected: false,
        };

        let transition =
            self.tracker
                .lock()
                .observe(&mut snapshot, &process_names, Instant::now());

        *self.latest.write() = Some(snapshot.clone());

        if let Some(event) = transition {
            debug!(?event, "gaming state changed");
            let _ = self.events.send(event);
        }
        let _ = self.events.send(MonitorEvent::Snapshot(snapshot.clone()));

        snapshot
    }

    fn probe_system(&self) -> (CpuStats, MemoryStats, DiskStats, Vec<String>) {
        let mut sys = self.system.lock();
        sys.refresh_all();

        let cpu = CpuStats {
            cores: sys.cpus().len() as u32,
            usage_percent: sys.global_cpu_info().cpu_usage() as f64,
            load_avg: {
                let load = System::load_average();
                [load.one, load.five, load.fifteen]
            },
        };

        let total = sys.total_memory();
        let available = sys.available_memory();
        let memory = MemoryStats {
            total_bytes: total,
            available_bytes: available,
            used_pct: if total > 0 {
                (total.saturating_sub(available)) as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        };

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks
            .iter()
            .fold((0u64, 0u64), |(t, a), d| (t + d.total_space(), a + d.available_space()));
        let disk = DiskStats {
            total_bytes: disk_total,
            available_bytes: disk_available,
            used_pct: if disk_total > 0 {
                (disk_total.saturating_sub(disk_available)) as f64 / disk_total as f64 * 100.0
            } else {
                0.0
            },
        };

        let process_names = sys
            .processes()
            .values()
            .map(|p| p.name().to_string())
            .collect();

        (cpu, memory, disk, process_names)
    }

    /// GPU inventory via `nvidia-smi`. Hosts without the binary report an
    /// empty list; the failure is logged once.
    async fn probe_gpus(&self) -> Vec<GpuStats> {
        let output = tokio::process::Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,name,memory.total,memory.free,utilization.gpu",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                parse_nvidia_smi(&stdout)
            }
            Ok(out) => {
                if !self.gpu_probe_failed.swap(true, Ordering::Relaxed) {
                    warn!(code = ?out.status.code(), "nvidia-smi exited with failure; reporting no GPUs");
                }
                Vec::new()
            }
            Err(e) => {
                if !self.gpu_probe_failed.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "nvidia-smi unavailable; reporting no GPUs");
                }
                Vec::new()
            }
        }
    }
}

/// Parse `nvidia-smi --query-gpu` CSV output (memory columns in MiB).
fn parse_nvidia_smi(output: &str) -> Vec<GpuStats> {
    let mut gpus = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
        if fields.len() != 5 {
            continue;
        }
        let parsed = (
            fields[0].parse::<u32>(),
            fields[2].parse::<u64>(),
            fields[3].parse::<u64>(),
            fields[4].parse::<f64>(),
        );
        if let (Ok(index), Ok(mem_total_mib), Ok(mem_free_mib), Ok(util)) = parsed {
            gpus.push(GpuStats {
                index,
                name: fields[1].to_string(),
                memory_total_bytes: mem_total_mib * 1024 * 1024,
                memory_free_bytes: mem_free_mib * 1024 * 1024,
                utilization_pct: util,
                in_use_for_gaming: false,
            });
        } else {
            warn!(line, "skipping unparseable nvidia-smi line");
        }
    }
    gpus
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_common::GpuStats;

    fn config() -> MonitorConfig {
        MonitorConfig::default()
    }

    fn snapshot_with_gpu(util: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            gpus: vec![GpuStats {
                index: 0,
                name: "test".into(),
                memory_total_bytes: 8 << 30,
                memory_free_bytes: 4 << 30,
                utilization_pct: util,
                in_use_for_gaming: false,
            }],
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_snapshot_is_not_gaming() {
        let mut tracker = GamingTracker::new(&config());
        let mut snap = snapshot_with_gpu(10.0);
        let event = tracker.observe(&mut snap, &["systemd".into(), "sshd".into()], Instant::now());
        assert!(event.is_none());
        assert!(!snap.gaming_detected);
        assert!(!tracker.in_cooldown(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gaming_process_starts_and_cooldown_expires() {
        let mut tracker = GamingTracker::new(&config());
        let mut snap = snapshot_with_gpu(10.0);

        // steam appears -> gaming_started
        let event = tracker.observe(&mut snap, &["Steam".into()], Instant::now());
        assert!(matches!(event, Some(MonitorEvent::GamingStarted)));
        assert!(snap.gaming_detected);

        // steam goes away -> gaming_ended, cooldown opens
        let mut snap = snapshot_with_gpu(10.0);
        let event = tracker.observe(&mut snap, &[], Instant::now());
        assert!(matches!(event, Some(MonitorEvent::GamingEnded)));
        assert!(tracker.in_cooldown(Instant::now()));

        // 30s later the cooldown has expired
        tokio::time::advance(Duration::from_millis(30_001)).await;
        assert!(!tracker.in_cooldown(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gpu_threshold_counts_as_gaming() {
        let mut tracker = GamingTracker::new(&config());
        let mut snap = snapshot_with_gpu(88.0);
        let event = tracker.observe(&mut snap, &[], Instant::now());
        assert!(matches!(event, Some(MonitorEvent::GamingStarted)));
        assert!(snap.gaming_detected);
        assert!(snap.gpus[0].in_use_for_gaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_snapshots_are_idempotent() {
        let mut tracker = GamingTracker::new(&config());

        for i in 0..3 {
            let mut snap = snapshot_with_gpu(10.0);
            let event = tracker.observe(&mut snap, &["steam".into()], Instant::now());
            if i == 0 {
                assert!(matches!(event, Some(MonitorEvent::GamingStarted)));
            } else {
                assert!(event.is_none(), "duplicate snapshot must not re-emit");
            }
        }
        assert!(tracker.gaming());

        for i in 0..3 {
            let mut snap = snapshot_with_gpu(10.0);
            let event = tracker.observe(&mut snap, &[], Instant::now());
            if i == 0 {
                assert!(matches!(event, Some(MonitorEvent::GamingEnded)));
            } else {
                assert!(event.is_none());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_cooldown_while_gaming() {
        let mut tracker = GamingTracker::new(&config());
        let mut snap = snapshot_with_gpu(10.0);
        tracker.observe(&mut snap, &["steam".into()], Instant::now());
        assert!(!tracker.in_cooldown(Instant::now()));
    }

    #[test]
    fn test_process_match_is_case_insensitive_substring() {
        let tracker = GamingTracker::new(&config());
        assert!(tracker.matches_process("SteamWebHelper"));
        assert!(tracker.matches_process("/usr/bin/lutris-wrapper"));
        assert!(!tracker.matches_process("rust-analyzer"));
    }

    #[test]
    fn test_parse_nvidia_smi_output() {
        let out = "0, NVIDIA GeForce RTX 4090, 24564, 20480, 35\n1, NVIDIA RTX A6000, 49140, 1024, 91\n";
        let gpus = parse_nvidia_smi(out);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 4090");
        assert_eq!(gpus[0].memory_total_bytes, 24564 * 1024 * 1024);
        assert_eq!(gpus[1].utilization_pct, 91.0);
    }

    #[test]
    fn test_parse_nvidia_smi_skips_garbage() {
        let gpus = parse_nvidia_smi("garbage line\n0, GPU, not-a-number, 1, 2\n");
        assert!(gpus.is_empty());
    }
}
