pub mod health;
pub mod resources;

pub use health::{HealthEvent, HealthReporter, TaskSource};
pub use resources::{GamingTracker, MonitorEvent, ResourceMonitor};
