/// Server supervision building blocks.
///
/// This module holds the pieces the host is assembled from: the per-server
/// state machine, the health monitor, the lifecycle event log and the
/// statistics types.
///
/// # Components
///
/// * `instance` - One hosted server: status, metadata and handles
/// * `monitor` - Periodic, concurrent health pings
/// * `lifecycle` - Bounded history of host events
/// * `stats` - Registry aggregates and resource samples
///
/// # Examples
///
/// Following an instance's status changes:
///
/// ```
/// use mcp_host::config::ServerConfig;
/// use mcp_host::server::{ServerInstance, ServerStatus};
///
/// # async fn example() {
/// let instance = ServerInstance::new("notes", ServerConfig::embedded("Notes"));
/// assert_eq!(instance.status(), ServerStatus::Stopped);
///
/// let mut changes = instance.subscribe();
/// // ... once the host starts it ...
/// while let Some(change) = changes.recv().await {
///     println!("{}: {} -> {}", change.server_id, change.previous, change.status);
/// }
/// # }
/// ```
mod instance;
pub mod lifecycle;
pub mod monitor;
mod stats;

pub use instance::{InstanceMetadata, ServerInstance, ServerStatus, StatusChange};
pub use lifecycle::{LifecycleLog, LifecycleRecord};
pub use monitor::{HealthMonitor, HealthMonitorConfig, HealthRecord, HealthStatus};
pub use stats::{HostStats, ResourceUsage, TypeCounts};
