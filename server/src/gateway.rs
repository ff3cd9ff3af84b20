use cortex_cluster::{AllocationSource, LeaderGated};
use cortex_common::{ResourceTotals, Result};
use cortex_monitor::TaskSource;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// A bridge to one external chat service. Concrete adapters (Telegram and
/// friends) live in their plugins; the gateway only drives this contract.
#[async_trait::async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn send(&self, message: &str) -> Result<()>;
}

/// Leader-gated messaging gateway: its adapters hold external connections,
/// so exactly one node in the cluster may run them at a time.
pub struct MessagingGateway {
    adapters: Vec<Arc<dyn ChannelAdapter>>,
    connected: AtomicBool,
}

impl MessagingGateway {
    pub fn new(adapters: Vec<Arc<dyn ChannelAdapter>>) -> Arc<Self> {
        Arc::new(Self {
            adapters,
            connected: AtomicBool::new(false),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Broadcast to every connected adapter; failures are logged per
    /// adapter and do not stop the fan-out.
    pub async fn notify(&self, message: &str) -> Result<()> {
        if !self.is_connected() {
            warn!("notify while gateway inactive; dropping message");
            return Ok(());
        }
        for adapter in &self.adapters {
            if let Err(e) = adapter.send(message).await {
                warn!(adapter = adapter.name(), error = %e, "notify failed");
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LeaderGated for MessagingGateway {
    fn name(&self) -> &str {
        "messaging-gateway"
    }

    async fn activate(&self) -> Result<()> {
        for adapter in &self.adapters {
            adapter.connect().await?;
            info!(adapter = adapter.name(), "messaging adapter connected");
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        for adapter in &self.adapters {
            adapter.disconnect().await?;
            info!(adapter = adapter.name(), "messaging adapter disconnected");
        }
        Ok(())
    }
}

/// The scheduler's authoritative half. Placement itself belongs to the
/// workload layer; the seat only owns the cluster-wide queue counter and
/// must therefore run on the leader alone.
pub struct SchedulerSeat {
    active: AtomicBool,
    queued: AtomicU32,
}

impl SchedulerSeat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(false),
            queued: AtomicU32::new(0),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> u32 {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn enqueue(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dequeue(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| q.checked_sub(1));
    }
}

#[async_trait::async_trait]
impl LeaderGated for SchedulerSeat {
    fn name(&self) -> &str {
        "scheduler-seat"
    }

    async fn activate(&self) -> Result<()> {
        self.active.store(true, Ordering::SeqCst);
        info!("scheduler seat active on this node");
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        info!("scheduler seat released");
        Ok(())
    }
}

/// Named tasks currently running on this node. The execution model is the
/// workload layer's concern; the core only tracks identity for health
/// reports and drain decisions.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, String>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, name: &str) -> String {
        let task_id = uuid::Uuid::new_v4().simple().to_string();
        self.tasks.insert(task_id.clone(), name.to_string());
        task_id
    }

    pub fn remove(&self, task_id: &str) -> bool {
        self.tasks.remove(task_id).is_some()
    }

    pub fn count(&self) -> usize {
        self.tasks.len()
    }
}

impl TaskSource for TaskRegistry {
    fn active_tasks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.iter().map(|t| t.value().clone()).collect();
        names.sort();
        names
    }
}

/// Allocation view the cluster-state projection reads: local task counts
/// plus the leader-held queue depth.
pub struct WorkloadView {
    pub registry: Arc<TaskRegistry>,
    pub scheduler: Arc<SchedulerSeat>,
}

impl AllocationSource for WorkloadView {
    fn in_use(&self) -> ResourceTotals {
        // Per-task reservations are owned by the workload layer; without
        // it, nothing is reserved.
        ResourceTotals::default()
    }

    fn active_tasks(&self) -> u32 {
        self.registry.count() as u32
    }

    fn queued_tasks(&self) -> u32 {
        self.scheduler.queued()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockAdapter {
        name: String,
        connects: AtomicU32,
        disconnects: AtomicU32,
    }

    impl MockAdapter {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                connects: AtomicU32::new(0),
                disconnects: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl ChannelAdapter for MockAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, _message: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_gateway_connects_and_disconnects_all_adapters() {
        let a = MockAdapter::new("telegram");
        let b = MockAdapter::new("matrix");
        let gateway = MessagingGateway::new(vec![a.clone(), b.clone()]);

        gateway.activate().await.unwrap();
        assert!(gateway.is_connected());
        assert_eq!(a.connects.load(Ordering::SeqCst), 1);
        assert_eq!(b.connects.load(Ordering::SeqCst), 1);

        gateway.deactivate().await.unwrap();
        assert!(!gateway.is_connected());
        assert_eq!(a.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(b.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scheduler_queue_counter() {
        let seat = SchedulerSeat::new();
        seat.enqueue();
        seat.enqueue();
        assert_eq!(seat.queued(), 2);
        seat.dequeue();
        assert_eq!(seat.queued(), 1);
        // never underflows
        seat.dequeue();
        seat.dequeue();
        assert_eq!(seat.queued(), 0);
    }

    #[tokio::test]
    async fn test_task_registry_round_trip() {
        let registry = TaskRegistry::new();
        let id = registry.register("benchmark");
        assert_eq!(registry.active_tasks(), vec!["benchmark".to_string()]);
        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert_eq!(registry.count(), 0);
    }
}
