use crate::lock;
use crate::server::{ServerInstance, ServerStatus};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

type Watched = Arc<Mutex<HashMap<String, Arc<ServerInstance>>>>;
type Records = Arc<Mutex<HashMap<String, HealthRecord>>>;

/// Outcome of the last health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The server answered its ping in time
    Healthy,
    /// The ping failed, timed out, or could not be sent
    Unhealthy,
}

/// Result of the most recent check of one server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    /// Healthy or not
    pub status: HealthStatus,
    /// Round trip of the ping, when it succeeded
    pub response_time: Option<Duration>,
    /// When the check finished
    pub last_checked_at: DateTime<Utc>,
    /// Why the check failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthRecord {
    fn healthy(response_time: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            response_time: Some(response_time),
            last_checked_at: Utc::now(),
            error: None,
        }
    }

    fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            response_time: None,
            last_checked_at: Utc::now(),
            error: Some(error.into()),
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Time between two check cycles
    pub check_interval: Duration,
    /// Upper bound for one ping
    pub ping_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

/// Periodically pings every registered `Running` server.
///
/// Pings within a cycle run concurrently, each bounded by
/// `ping_timeout`. A failed ping only marks the server unhealthy for that
/// cycle; it never changes the server's status. The monitor keeps its own
/// map of watched instances and its own health records and never touches the
/// host's registry.
///
/// # Examples
///
/// ```no_run
/// use mcp_host::server::{HealthMonitor, HealthMonitorConfig};
/// use std::time::Duration;
///
/// # async fn example() {
/// let monitor = HealthMonitor::new(HealthMonitorConfig {
///     check_interval: Duration::from_secs(10),
///     ping_timeout: Duration::from_secs(2),
/// });
/// monitor.start();
/// // ... register instances ...
/// monitor.stop();
/// # }
/// ```
pub struct HealthMonitor {
    /// Monitor configuration
    config: HealthMonitorConfig,
    /// Instances to check, keyed by server id
    watched: Watched,
    /// Latest record per server id
    records: Records,
    /// Periodic task
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a stopped monitor
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self {
            config,
            watched: Arc::new(Mutex::new(HashMap::new())),
            records: Arc::new(Mutex::new(HashMap::new())),
            task: Mutex::new(None),
        }
    }

    /// Start the periodic task. Does nothing if already running.
    ///
    /// The first cycle runs one interval after the start. Must be called
    /// within a Tokio runtime.
    pub fn start(&self) {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let watched = Arc::clone(&self.watched);
        let records = Arc::clone(&self.records);
        let config = self.config.clone();

        *task = Some(tokio::spawn(async move {
            let start = time::Instant::now() + config.check_interval;
            let mut interval = time::interval_at(start, config.check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                run_cycle(&watched, &records, config.ping_timeout).await;
            }
        }));
        tracing::debug!(interval = ?self.config.check_interval, "Health monitor started");
    }

    /// Stop the periodic task. Safe to call when not running.
    pub fn stop(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
            tracing::debug!("Health monitor stopped");
        }
    }

    /// Whether the periodic task is running
    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Start watching an instance, replacing any earlier one with the same id
    pub fn register(&self, instance: Arc<ServerInstance>) {
        let server_id = instance.server_id().to_string();
        lock(&self.watched).insert(server_id, instance);
    }

    /// Stop watching a server and forget its health record.
    ///
    /// Returns whether the server was being watched.
    pub fn unregister(&self, server_id: &str) -> bool {
        let mut watched = lock(&self.watched);
        let removed = watched.remove(server_id).is_some();
        lock(&self.records).remove(server_id);
        removed
    }

    /// Whether a server is being watched
    pub fn is_registered(&self, server_id: &str) -> bool {
        lock(&self.watched).contains_key(server_id)
    }

    /// Latest record of a server
    pub fn health(&self, server_id: &str) -> Option<HealthRecord> {
        lock(&self.records).get(server_id).cloned()
    }

    /// Latest record of every checked server
    pub fn all_health(&self) -> HashMap<String, HealthRecord> {
        lock(&self.records).clone()
    }

    /// Run one check cycle now, independent of the periodic task
    pub async fn check_all(&self) {
        run_cycle(&self.watched, &self.records, self.config.ping_timeout).await;
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Ping one instance through its protocol handle
pub async fn probe(instance: &ServerInstance, timeout: Duration) -> HealthRecord {
    let Some(protocol) = instance.protocol() else {
        return HealthRecord::unhealthy("no protocol handle");
    };

    let started = Instant::now();
    match time::timeout(timeout, protocol.ping()).await {
        Ok(Ok(())) => HealthRecord::healthy(started.elapsed()),
        Ok(Err(e)) => HealthRecord::unhealthy(e.to_string()),
        Err(_) => HealthRecord::unhealthy(format!("ping timed out after {:?}", timeout)),
    }
}

async fn run_cycle(watched: &Watched, records: &Records, timeout: Duration) {
    let targets: Vec<Arc<ServerInstance>> = lock(watched)
        .values()
        .filter(|instance| instance.status() == ServerStatus::Running)
        .cloned()
        .collect();
    if targets.is_empty() {
        return;
    }

    let results = join_all(targets.iter().map(|instance| probe(instance, timeout))).await;

    let watched = lock(watched);
    let mut records = lock(records);
    for (instance, record) in targets.iter().zip(results) {
        // Drop results for servers unregistered while the cycle was in flight
        let current = watched
            .get(instance.server_id())
            .is_some_and(|registered| Arc::ptr_eq(registered, instance));
        if !current {
            continue;
        }
        if let Some(error) = &record.error {
            tracing::warn!(server_id = %instance.server_id(), error = %error, "Health check failed");
        }
        records.insert(instance.server_id().to_string(), record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProtocolClient;
    use crate::config::ServerConfig;
    use crate::error::{Error, Result};
    use crate::sandbox::{Sandbox, TerminationMode};
    use crate::transport::{JsonRpcMessage, JsonRpcResponse};
    use async_trait::async_trait;
    use mockall::mock;
    use serde_json::Value;

    mock! {
        pub Protocol {}

        #[async_trait]
        impl ProtocolClient for Protocol {
            async fn ping(&self) -> Result<()>;
            async fn request(&self, method: &str, params: Option<Value>) -> Result<Value>;
        }
    }

    struct StubSandbox {
        protocol: Option<Arc<dyn ProtocolClient>>,
    }

    #[async_trait]
    impl Sandbox for StubSandbox {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn terminate(&self, _mode: TerminationMode) -> Result<()> {
            Ok(())
        }

        async fn handle_message(&self, _message: JsonRpcMessage) -> Result<Option<JsonRpcResponse>> {
            Ok(None)
        }

        fn protocol(&self) -> Option<Arc<dyn ProtocolClient>> {
            self.protocol.clone()
        }
    }

    fn running(server_id: &str, protocol: Option<MockProtocol>) -> Arc<ServerInstance> {
        let instance = Arc::new(ServerInstance::new(server_id, ServerConfig::embedded(server_id)));
        instance.transition(ServerStatus::Starting).unwrap();
        instance.attach(Arc::new(StubSandbox {
            protocol: protocol.map(|p| Arc::new(p) as Arc<dyn ProtocolClient>),
        }));
        instance.transition(ServerStatus::Running).unwrap();
        instance
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthMonitorConfig {
            check_interval: Duration::from_secs(3600),
            ping_timeout: Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn test_check_all_records_each_outcome() {
        let mut healthy = MockProtocol::new();
        healthy.expect_ping().times(1).returning(|| Ok(()));
        let mut failing = MockProtocol::new();
        failing
            .expect_ping()
            .times(1)
            .returning(|| Err(Error::Communication("broken pipe".to_string())));

        let monitor = monitor();
        monitor.register(running("up", Some(healthy)));
        monitor.register(running("down", Some(failing)));
        monitor.register(running("mute", None));
        monitor.check_all().await;

        let up = monitor.health("up").unwrap();
        assert_eq!(up.status, HealthStatus::Healthy);
        assert!(up.response_time.is_some());

        let down = monitor.health("down").unwrap();
        assert_eq!(down.status, HealthStatus::Unhealthy);
        assert!(down.error.unwrap().contains("broken pipe"));

        let mute = monitor.health("mute").unwrap();
        assert_eq!(mute.error.as_deref(), Some("no protocol handle"));
        assert_eq!(monitor.all_health().len(), 3);
    }

    #[tokio::test]
    async fn test_only_running_instances_are_pinged() {
        let mut protocol = MockProtocol::new();
        protocol.expect_ping().times(0);

        let instance = running("crashed", Some(protocol));
        instance.mark_crashed().unwrap();

        let monitor = monitor();
        monitor.register(instance);
        monitor.check_all().await;

        assert!(monitor.health("crashed").is_none());
    }

    #[tokio::test]
    async fn test_unregister_forgets_record() {
        let mut protocol = MockProtocol::new();
        protocol.expect_ping().returning(|| Ok(()));

        let monitor = monitor();
        monitor.register(running("a", Some(protocol)));
        monitor.check_all().await;
        assert!(monitor.health("a").is_some());

        assert!(monitor.unregister("a"));
        assert!(!monitor.is_registered("a"));
        assert!(monitor.health("a").is_none());
        assert!(!monitor.unregister("a"));
    }

    #[tokio::test]
    async fn test_start_stop_are_idempotent() {
        let monitor = monitor();
        monitor.stop();
        monitor.start();
        monitor.start();
        assert!(monitor.is_running());
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }
}
