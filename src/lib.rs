/*!
 # MCP Host

 A Rust library that supervises many Model Context Protocol (MCP) servers
 inside one process.

 ## Overview

 MCP Host provides functionality to:
 - Start, stop and restart servers of three kinds: internal (plugin
   provided), external (child process over stdio) and embedded (in-process)
 - Enforce a server capacity and unique server ids
 - Health-check running servers with concurrent protocol pings
 - Restart servers that crash, up to a configured limit
 - Publish lifecycle events to any number of subscribers
 - Report registry statistics and per-server resource usage

 ## Basic Usage

 ```no_run
 use mcp_host::config::ServerConfig;
 use mcp_host::{HostConfig, Result, ServerHost};

 #[tokio::main]
 async fn main() -> Result<()> {
     let host = ServerHost::new(HostConfig::default());
     host.initialize().await?;

     // Watch what happens
     let _listener = host.on(|event| println!("{}: {:?}", event.name(), event.server_id()));

     let fetch = ServerConfig::external("fetch", "uvx", vec!["mcp-server-fetch".to_string()]);
     let instance = host.start_server("fetch", fetch).await?;
     println!("fetch is {}", instance.status());

     host.run_health_checks().await;
     println!("health: {:?}", host.get_server_health("fetch"));
     println!("stats: {:?}", host.get_stats());

     host.shutdown().await;
     Ok(())
 }
 ```

 ## Features

 - **Isolation**: every server runs behind a `Sandbox`; the host never
   reaches past it
 - **Capacity and uniqueness**: checked atomically with registration
 - **Crash recovery**: automatic restart with a bounded restart count
 - **Events**: broadcast bus plus a bounded history of recent events
 - **Configuration**: JSON or YAML files, durations in milliseconds
 - **Tracing**: every public host operation runs in a `tracing` span
*/

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod sandbox;
pub mod security;
pub mod server;
pub mod transport;

pub use client::{McpClient, ProtocolClient};
pub use config::{Config, HostConfig, ServerConfig, ServerType};
pub use error::{Error, Result};
pub use events::{EventBus, HostEvent, Listener, RestartReason, Subscription};
pub use server::{HealthRecord, HealthStatus, HostStats, ResourceUsage, ServerInstance, ServerStatus};

use config::{validate_config, validate_host_config, validate_server_config};
use sandbox::{
    DefaultSandboxFactory, Sandbox, SandboxEvent, SandboxEventReceiver, SandboxFactory, TerminationMode,
};
use security::{AllowAllSecurity, SecurityManager};
use server::{HealthMonitor, HealthMonitorConfig, LifecycleLog, LifecycleRecord, StatusChange};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use transport::{JsonRpcMessage, JsonRpcResponse};

/// Lock a mutex, recovering the guard if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct HostInner {
    /// Host configuration
    config: HostConfig,
    /// Registered instances, keyed by server id
    registry: Mutex<HashMap<String, Arc<ServerInstance>>>,
    /// Latest resource sample per server id
    resources: Mutex<HashMap<String, ResourceUsage>>,
    /// Per-instance tasks relaying status changes and sandbox events
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Periodic health checks
    monitor: HealthMonitor,
    /// Host event bus
    events: EventBus<HostEvent>,
    /// Recent host events
    log: LifecycleLog,
    /// Creates sandboxes
    sandbox_factory: Arc<dyn SandboxFactory>,
    /// Admission checks
    security: Arc<dyn SecurityManager>,
    /// Set by `initialize`, cleared by `shutdown`
    initialized: AtomicBool,
}

impl Drop for HostInner {
    fn drop(&mut self) {
        for (_, watcher) in lock(&self.watchers).drain() {
            watcher.abort();
        }
    }
}

/// Supervises a set of MCP servers.
///
/// `ServerHost` is a cheap handle; clones share the same registry. All
/// public methods are instrumented with `tracing` spans.
///
/// Every server id maps to at most one [`ServerInstance`]. An instance is
/// registered (in `Starting` state) before its sandbox initializes, so
/// concurrent starts with the same id, or starts beyond `max_servers`, are
/// rejected without side effects.
#[derive(Clone)]
pub struct ServerHost {
    inner: Arc<HostInner>,
}

/// Builds a [`ServerHost`] with custom sandboxing or security
///
/// # Examples
///
/// ```no_run
/// use mcp_host::security::PermissionPolicy;
/// use mcp_host::{HostConfig, ServerHost};
/// use std::sync::Arc;
///
/// let host = ServerHost::builder(HostConfig::default())
///     .security(Arc::new(PermissionPolicy::new().allow_external_processes(true)))
///     .build();
/// ```
pub struct ServerHostBuilder {
    config: HostConfig,
    sandbox_factory: Option<Arc<dyn SandboxFactory>>,
    security: Option<Arc<dyn SecurityManager>>,
}

impl ServerHostBuilder {
    /// Use `factory` to create sandboxes instead of [`DefaultSandboxFactory`]
    pub fn sandbox_factory(mut self, factory: Arc<dyn SandboxFactory>) -> Self {
        self.sandbox_factory = Some(factory);
        self
    }

    /// Use `security` for admission checks instead of [`AllowAllSecurity`]
    pub fn security(mut self, security: Arc<dyn SecurityManager>) -> Self {
        self.security = Some(security);
        self
    }

    /// Build the host. It still needs [`ServerHost::initialize`].
    pub fn build(self) -> ServerHost {
        let monitor = HealthMonitor::new(HealthMonitorConfig {
            check_interval: self.config.health_check_interval,
            ping_timeout: self.config.health_check_timeout,
        });
        let events = EventBus::new(self.config.event_capacity);

        ServerHost {
            inner: Arc::new(HostInner {
                config: self.config,
                registry: Mutex::new(HashMap::new()),
                resources: Mutex::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
                monitor,
                events,
                log: LifecycleLog::default(),
                sandbox_factory: self
                    .sandbox_factory
                    .unwrap_or_else(|| Arc::new(DefaultSandboxFactory::new())),
                security: self.security.unwrap_or_else(|| Arc::new(AllowAllSecurity)),
                initialized: AtomicBool::new(false),
            }),
        }
    }
}

impl ServerHost {
    /// Create a host with the default sandbox factory and no admission checks
    #[tracing::instrument(skip(config), fields(max_servers = config.max_servers))]
    pub fn new(config: HostConfig) -> Self {
        tracing::info!("Creating new ServerHost");
        Self::builder(config).build()
    }

    /// Start building a host
    pub fn builder(config: HostConfig) -> ServerHostBuilder {
        ServerHostBuilder {
            config,
            sandbox_factory: None,
            security: None,
        }
    }

    /// Create a host from a validated file-level configuration.
    ///
    /// The configured servers are not started; pass `config.servers` to
    /// [`start_all`](Self::start_all) after initializing.
    #[tracing::instrument(skip(config), fields(num_servers = config.servers.len()))]
    pub fn from_config(config: &Config) -> Result<Self> {
        validate_config(config)?;
        Ok(Self::new(config.host.clone()))
    }

    /// Load and validate a configuration file, then create a host from it
    #[tracing::instrument(skip(path), fields(config_path = ?path.as_ref()))]
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<(Self, Config)> {
        tracing::info!("Loading configuration from file");
        let config = Config::from_file(path)?;
        let host = Self::from_config(&config)?;
        Ok((host, config))
    }

    /// Host configuration
    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    /// Whether `initialize` has run and `shutdown` has not
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Start the health monitor and accept server operations.
    ///
    /// Fails with `ConfigInvalid` if the host configuration is unusable, in
    /// which case the host stays uninitialized. Calling it again while
    /// initialized does nothing.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        if let Err(e) = validate_host_config(&self.inner.config) {
            tracing::error!(error = %e, "Refusing to initialize with invalid host configuration");
            return Err(e);
        }
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            tracing::debug!("Host already initialized");
            return Ok(());
        }
        self.inner.monitor.start();
        tracing::info!("Server host initialized");
        self.emit(HostEvent::Initialized);
        Ok(())
    }

    /// Start a server under `server_id`.
    ///
    /// Fails with `ServerAlreadyExists` or `CapacityExceeded` without side
    /// effects. If the sandbox fails to initialize within
    /// `server_startup_timeout`, the entry is rolled back, `server-error` is
    /// emitted, and the error is returned.
    #[tracing::instrument(skip(self, config), fields(server_id = %server_id, server_type = %config.server_type()))]
    pub async fn start_server(&self, server_id: &str, config: ServerConfig) -> Result<Arc<ServerInstance>> {
        self.ensure_initialized()?;
        tracing::info!("Attempting to start server");
        let instance = self.start_instance(server_id, config, 0).await?;
        tracing::info!("Server started successfully");
        Ok(instance)
    }

    /// Start every server in `servers`, in id order.
    ///
    /// Stops at nothing: each failure is logged and the rest are still
    /// started. A single failure is returned as is, several are aggregated.
    #[tracing::instrument(skip(self, servers), fields(num_servers = servers.len()))]
    pub async fn start_all(&self, servers: &BTreeMap<String, ServerConfig>) -> Result<Vec<Arc<ServerInstance>>> {
        tracing::info!("Starting all configured servers");
        let mut started = Vec::new();
        let mut errors = Vec::new();

        for (server_id, config) in servers {
            match self.start_server(server_id, config.clone()).await {
                Ok(instance) => started.push(instance),
                Err(e) => {
                    tracing::error!(server_id = %server_id, error = %e, "Failed to start server");
                    errors.push((server_id.as_str(), e));
                }
            }
        }

        if errors.len() == 1 {
            return Err(errors.remove(0).1);
        }
        if !errors.is_empty() {
            let error_msg = errors
                .iter()
                .map(|(server_id, e)| format!("{}: {}", server_id, e))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::Other(format!("Multiple servers failed to start: {}", error_msg)));
        }

        tracing::info!(num_started = started.len(), "Finished starting all servers");
        Ok(started)
    }

    /// Stop a server and remove it from the registry.
    ///
    /// With `graceful`, the sandbox gets `server_shutdown_timeout` to exit
    /// on its own before it is torn down by force. Fails with `InvalidState`
    /// while the server is `Starting` or already `Stopping`. If the forced
    /// teardown fails, the server is still removed and `ShutdownFailed` is
    /// returned.
    #[tracing::instrument(skip(self), fields(server_id = %server_id))]
    pub async fn stop_server(&self, server_id: &str, graceful: bool) -> Result<()> {
        self.ensure_initialized()?;
        tracing::info!("Attempting to stop server");
        self.stop_instance(server_id, graceful).await
    }

    /// Stop a server and start a fresh instance with the same config.
    ///
    /// The new instance starts with a restart count of zero.
    #[tracing::instrument(skip(self), fields(server_id = %server_id))]
    pub async fn restart_server(&self, server_id: &str) -> Result<Arc<ServerInstance>> {
        self.ensure_initialized()?;
        tracing::info!("Attempting to restart server");
        self.restart_instance(server_id, RestartReason::Explicit, None).await
    }

    /// Latest health record, if the server has been checked
    pub fn get_server_health(&self, server_id: &str) -> Option<HealthRecord> {
        self.inner.monitor.health(server_id)
    }

    /// Latest resource sample, if the sandbox reported one
    pub fn get_server_resource_usage(&self, server_id: &str) -> Option<ResourceUsage> {
        lock(&self.inner.resources).get(server_id).copied()
    }

    /// Registry aggregates
    pub fn get_stats(&self) -> HostStats {
        let registry = lock(&self.inner.registry);
        HostStats::collect(registry.values().map(Arc::as_ref))
    }

    /// Registered instance for `server_id`
    pub fn get_server(&self, server_id: &str) -> Option<Arc<ServerInstance>> {
        lock(&self.inner.registry).get(server_id).cloned()
    }

    /// Every registered instance, ordered by server id
    pub fn list_servers(&self) -> Vec<Arc<ServerInstance>> {
        let mut servers: Vec<_> = lock(&self.inner.registry).values().cloned().collect();
        servers.sort_by(|a, b| a.server_id().cmp(b.server_id()));
        servers
    }

    /// Route a raw JSON-RPC message to a running server.
    ///
    /// Requests yield the server's response, notifications yield `None`.
    #[tracing::instrument(skip(self, message), fields(server_id = %server_id))]
    pub async fn send_message(&self, server_id: &str, message: JsonRpcMessage) -> Result<Option<JsonRpcResponse>> {
        self.ensure_initialized()?;
        let instance = self
            .get_server(server_id)
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))?;

        let status = instance.status();
        let sandbox = match instance.sandbox() {
            Some(sandbox) if status == ServerStatus::Running => sandbox,
            _ => {
                return Err(Error::InvalidState {
                    server_id: server_id.to_string(),
                    status,
                    operation: "receive messages",
                });
            }
        };
        sandbox.handle_message(message).await
    }

    /// Run one health check cycle now
    #[tracing::instrument(skip(self))]
    pub async fn run_health_checks(&self) {
        self.inner.monitor.check_all().await;
    }

    /// Recent host events, newest first, optionally for one server only
    pub fn recent_events(&self, server_id: Option<&str>, limit: Option<usize>) -> Vec<LifecycleRecord> {
        match server_id {
            Some(server_id) => self.inner.log.server_events(server_id, limit),
            None => self.inner.log.all_events(limit),
        }
    }

    /// Subscribe to host events
    pub fn subscribe(&self) -> Subscription<HostEvent> {
        self.inner.events.subscribe()
    }

    /// Run `callback` for every host event until the listener is dropped
    pub fn on<F>(&self, callback: F) -> Listener
    where
        F: Fn(HostEvent) + Send + 'static,
    {
        self.inner.events.on(callback)
    }

    /// Stop every server, then the health monitor.
    ///
    /// Individual stop failures are logged and do not interrupt the
    /// shutdown. Anything still registered afterwards is torn down by force.
    /// Does nothing if the host is not initialized.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let was_initialized = {
            let _registry = lock(&self.inner.registry);
            self.inner.initialized.swap(false, Ordering::SeqCst)
        };
        if !was_initialized {
            tracing::debug!("Host not initialized, nothing to shut down");
            return;
        }
        tracing::info!("Shutting down server host");

        let server_ids: Vec<String> = lock(&self.inner.registry).keys().cloned().collect();
        let results =
            futures::future::join_all(server_ids.iter().map(|server_id| self.stop_instance(server_id, true))).await;
        for (server_id, result) in server_ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(server_id = %server_id, error = %e, "Error stopping server during shutdown");
            }
        }

        self.drain_remaining().await;
        self.inner.monitor.stop();
        tracing::info!("Server host shut down");
        self.emit(HostEvent::Shutdown);
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn emit(&self, event: HostEvent) {
        self.inner.log.record(event.clone());
        self.inner.events.emit(event);
    }

    fn admit(&self, server_id: &str, config: &ServerConfig) -> Result<()> {
        let denied = |reason: &str| Error::PermissionDenied {
            server_id: server_id.to_string(),
            reason: reason.to_string(),
        };
        let security = &self.inner.security;

        match config.server_type() {
            ServerType::Embedded => Ok(()),
            ServerType::Internal => {
                let manifest_ok = config
                    .manifest()
                    .is_some_and(|manifest| security.validate_plugin(manifest));
                if !manifest_ok {
                    return Err(denied("plugin manifest failed validation"));
                }
                if !security.check_permissions(server_id, config) {
                    return Err(denied("requested permissions are not allowed"));
                }
                Ok(())
            }
            ServerType::External => {
                if !security.check_permissions(server_id, config) {
                    return Err(denied("external processes are not allowed"));
                }
                Ok(())
            }
        }
    }

    /// Register `instance` in `Starting` state, or reject it
    fn reserve(&self, instance: &Arc<ServerInstance>) -> Result<()> {
        let server_id = instance.server_id();
        let mut registry = lock(&self.inner.registry);

        // Checked under the registry lock so shutdown cannot miss the entry
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        if registry.contains_key(server_id) {
            tracing::warn!("Server id already registered");
            return Err(Error::ServerAlreadyExists(server_id.to_string()));
        }
        if registry.len() >= self.inner.config.max_servers {
            tracing::warn!(max = self.inner.config.max_servers, "Server capacity reached");
            return Err(Error::CapacityExceeded {
                server_id: server_id.to_string(),
                max: self.inner.config.max_servers,
            });
        }

        instance.transition(ServerStatus::Starting)?;
        registry.insert(server_id.to_string(), Arc::clone(instance));
        Ok(())
    }

    fn is_registered(&self, instance: &Arc<ServerInstance>) -> bool {
        lock(&self.inner.registry)
            .get(instance.server_id())
            .is_some_and(|current| Arc::ptr_eq(current, instance))
    }

    fn deregister(&self, instance: &Arc<ServerInstance>) {
        let mut registry = lock(&self.inner.registry);
        let current = registry
            .get(instance.server_id())
            .is_some_and(|current| Arc::ptr_eq(current, instance));
        if current {
            registry.remove(instance.server_id());
            lock(&self.inner.resources).remove(instance.server_id());
        }
    }

    async fn start_instance(&self, server_id: &str, config: ServerConfig, restart_count: u32) -> Result<Arc<ServerInstance>> {
        validate_server_config(server_id, &config)?;
        self.admit(server_id, &config)?;

        let instance = Arc::new(ServerInstance::with_restart_count(server_id, config, restart_count));
        // Subscribe first so the relay sees every transition
        let changes = instance.subscribe();
        self.reserve(&instance)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sandbox = match self
            .inner
            .sandbox_factory
            .create(server_id, instance.config(), events_tx)
        {
            Ok(sandbox) => sandbox,
            Err(e) => {
                let error = Error::StartupFailed {
                    server_id: server_id.to_string(),
                    reason: e.to_string(),
                };
                self.abandon(&instance, None, &error).await;
                return Err(error);
            }
        };

        let timeout = self.inner.config.server_startup_timeout;
        let error = match time::timeout(timeout, sandbox.initialize()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(Error::StartupFailed {
                server_id: server_id.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Some(Error::Timeout(format!(
                "Server '{}' did not start within {:?}",
                server_id, timeout
            ))),
        };
        if let Some(error) = error {
            self.abandon(&instance, Some(sandbox), &error).await;
            return Err(error);
        }

        instance.attach(Arc::clone(&sandbox));
        // Shutdown may have drained the entry while the sandbox initialized
        if !self.promote(&instance) {
            let error = Error::StartupFailed {
                server_id: server_id.to_string(),
                reason: "host shut down during startup".to_string(),
            };
            self.abandon(&instance, instance.detach(), &error).await;
            return Err(error);
        }

        self.spawn_watcher(Arc::clone(&instance), changes, events_rx);
        Ok(instance)
    }

    /// Move a registered `Starting` instance to `Running` and announce it.
    ///
    /// Runs under the registry lock, so a concurrent drain either happens
    /// first (and this returns false) or sees the instance as `Running` and
    /// announced.
    fn promote(&self, instance: &Arc<ServerInstance>) -> bool {
        let registry = lock(&self.inner.registry);
        let current = registry
            .get(instance.server_id())
            .is_some_and(|current| Arc::ptr_eq(current, instance));
        if !current || instance.transition(ServerStatus::Running).is_err() {
            return false;
        }

        self.inner.monitor.register(Arc::clone(instance));
        self.emit(HostEvent::ServerStarted {
            server_id: instance.server_id().to_string(),
            name: instance.config().name.clone(),
            server_type: instance.server_type(),
        });
        true
    }

    /// Roll back a failed startup
    async fn abandon(&self, instance: &Arc<ServerInstance>, sandbox: Option<Arc<dyn Sandbox>>, error: &Error) {
        tracing::error!(server_id = %instance.server_id(), error = %error, "Server failed to start");
        if let Some(sandbox) = sandbox {
            let teardown = time::timeout(
                self.inner.config.server_shutdown_timeout,
                sandbox.terminate(TerminationMode::Forced),
            )
            .await;
            if !matches!(teardown, Ok(Ok(()))) {
                tracing::warn!(server_id = %instance.server_id(), "Failed to tear down sandbox after failed startup");
            }
        }
        if instance.status() == ServerStatus::Starting {
            let _ = instance.transition(ServerStatus::Stopped);
        }
        self.deregister(instance);
        self.emit(HostEvent::ServerError {
            server_id: instance.server_id().to_string(),
            error: error.to_string(),
        });
    }

    async fn stop_instance(&self, server_id: &str, graceful: bool) -> Result<()> {
        let instance = self
            .get_server(server_id)
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))?;

        if instance.transition(ServerStatus::Stopping).is_err() {
            let status = instance.status();
            tracing::warn!(status = %status, "Server cannot be stopped in its current state");
            return Err(Error::InvalidState {
                server_id: server_id.to_string(),
                status,
                operation: "stop",
            });
        }

        self.inner.monitor.unregister(server_id);
        let outcome = match instance.detach() {
            Some(sandbox) => self.teardown(server_id, sandbox, graceful).await,
            None => Ok(()),
        };

        let _ = instance.transition(ServerStatus::Stopped);
        self.deregister(&instance);
        lock(&self.inner.watchers).remove(server_id);

        if let Err(e) = &outcome {
            tracing::error!(server_id = %server_id, error = %e, "Failed to stop server cleanly");
            self.emit(HostEvent::ServerError {
                server_id: server_id.to_string(),
                error: e.to_string(),
            });
        } else {
            tracing::info!(server_id = %server_id, "Server stopped successfully");
        }
        self.emit(HostEvent::ServerStopped {
            server_id: server_id.to_string(),
        });
        outcome
    }

    async fn teardown(&self, server_id: &str, sandbox: Arc<dyn Sandbox>, graceful: bool) -> Result<()> {
        let timeout = self.inner.config.server_shutdown_timeout;

        if graceful {
            match time::timeout(timeout, sandbox.terminate(TerminationMode::Graceful)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => tracing::warn!(error = %e, "Graceful shutdown failed, forcing"),
                Err(_) => tracing::warn!(timeout = ?timeout, "Graceful shutdown timed out, forcing"),
            }
        }

        let shutdown_failed = |reason: String| Error::ShutdownFailed {
            server_id: server_id.to_string(),
            reason,
        };
        match time::timeout(timeout, sandbox.terminate(TerminationMode::Forced)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(shutdown_failed(e.to_string())),
            Err(_) => Err(shutdown_failed(format!("forced termination timed out after {:?}", timeout))),
        }
    }

    async fn restart_instance(
        &self,
        server_id: &str,
        reason: RestartReason,
        expected: Option<&Arc<ServerInstance>>,
    ) -> Result<Arc<ServerInstance>> {
        let current = self
            .get_server(server_id)
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))?;
        if expected.is_some_and(|expected| !Arc::ptr_eq(expected, &current)) {
            return Err(Error::Other(format!(
                "Server '{}' was replaced before it could be restarted",
                server_id
            )));
        }

        let config = current.config().clone();
        let restart_count = match reason {
            RestartReason::Explicit => 0,
            RestartReason::Crash => current.restart_count() + 1,
        };

        match self.stop_instance(server_id, true).await {
            Ok(()) => {}
            // The entry is gone either way
            Err(e @ Error::ShutdownFailed { .. }) => {
                tracing::warn!(error = %e, "Old instance did not shut down cleanly, restarting anyway")
            }
            Err(e) => return Err(e),
        }

        let instance = self.start_instance(server_id, config, restart_count).await?;
        tracing::info!(reason = ?reason, restart_count, "Server restarted");
        self.emit(HostEvent::ServerRestarted {
            server_id: server_id.to_string(),
            reason,
        });
        Ok(instance)
    }

    /// Relay an instance's status changes and sandbox events to the host
    fn spawn_watcher(
        &self,
        instance: Arc<ServerInstance>,
        mut changes: Subscription<StatusChange>,
        mut sandbox_events: SandboxEventReceiver,
    ) {
        let host: Weak<HostInner> = Arc::downgrade(&self.inner);
        let server_id = instance.server_id().to_string();

        // Held across the spawn so a racing stop cannot miss the handle
        let mut watchers = lock(&self.inner.watchers);
        let task = tokio::spawn(async move {
            let mut sandbox_open = true;
            loop {
                tokio::select! {
                    change = changes.recv() => {
                        let Some(change) = change else { break };
                        let Some(inner) = host.upgrade() else { break };
                        let host = ServerHost { inner };
                        host.emit(HostEvent::StatusChanged {
                            server_id: change.server_id,
                            status: change.status,
                            previous: change.previous,
                        });
                        match change.status {
                            ServerStatus::Crashed => host.handle_crash(&instance),
                            ServerStatus::Stopped => break,
                            _ => {}
                        }
                    }
                    event = sandbox_events.recv(), if sandbox_open => {
                        let Some(event) = event else {
                            sandbox_open = false;
                            continue;
                        };
                        let Some(inner) = host.upgrade() else { break };
                        ServerHost { inner }.handle_sandbox_event(&instance, event);
                    }
                }
            }
        });
        watchers.insert(server_id, task);
    }

    fn handle_sandbox_event(&self, instance: &Arc<ServerInstance>, event: SandboxEvent) {
        let server_id = instance.server_id();
        match event {
            SandboxEvent::Error(error) => {
                tracing::warn!(server_id = %server_id, error = %error, "Server reported an error");
                self.emit(HostEvent::ServerError {
                    server_id: server_id.to_string(),
                    error,
                });
            }
            SandboxEvent::Exited { code } => {
                if instance.mark_crashed().is_err() {
                    tracing::debug!(server_id = %server_id, status = %instance.status(), "Ignoring exit outside Running");
                    return;
                }
                tracing::error!(server_id = %server_id, code = ?code, "Server exited unexpectedly");
                self.emit(HostEvent::ServerError {
                    server_id: server_id.to_string(),
                    error: match code {
                        Some(code) => format!("Server exited unexpectedly with code {}", code),
                        None => "Server exited unexpectedly".to_string(),
                    },
                });
            }
            SandboxEvent::ResourceUsage(usage) => {
                if self.is_registered(instance) {
                    lock(&self.inner.resources).insert(server_id.to_string(), usage);
                }
            }
        }
    }

    fn handle_crash(&self, instance: &Arc<ServerInstance>) {
        let server_id = instance.server_id().to_string();
        let config = &self.inner.config;

        if !config.restart_on_crash || !self.is_initialized() {
            tracing::info!(server_id = %server_id, "Crashed server left for manual recovery");
            return;
        }
        if instance.restart_count() >= config.max_crash_restarts {
            tracing::error!(
                server_id = %server_id,
                restart_count = instance.restart_count(),
                "Crash restart limit reached"
            );
            self.emit(HostEvent::ServerError {
                server_id: server_id.clone(),
                error: format!(
                    "Server '{}' crashed {} times, not restarting",
                    server_id,
                    instance.restart_count() + 1
                ),
            });
            return;
        }

        let host = self.clone();
        let crashed = Arc::clone(instance);
        tokio::spawn(async move {
            tracing::info!(server_id = %server_id, "Restarting crashed server");
            if let Err(e) = host
                .restart_instance(&server_id, RestartReason::Crash, Some(&crashed))
                .await
            {
                tracing::error!(server_id = %server_id, error = %e, "Crash restart failed");
                host.emit(HostEvent::ServerError {
                    server_id: server_id.clone(),
                    error: e.to_string(),
                });
            }
        });
    }

    /// Force out whatever the per-server stops left behind
    async fn drain_remaining(&self) {
        let leftovers: Vec<(String, Arc<ServerInstance>)> = lock(&self.inner.registry).drain().collect();
        if leftovers.is_empty() {
            return;
        }
        tracing::warn!(count = leftovers.len(), "Forcing remaining servers down");

        for (server_id, instance) in leftovers {
            self.inner.monitor.unregister(&server_id);
            lock(&self.inner.resources).remove(&server_id);

            if let Some(sandbox) = instance.detach() {
                let teardown = time::timeout(
                    self.inner.config.server_shutdown_timeout,
                    sandbox.terminate(TerminationMode::Forced),
                )
                .await;
                if !matches!(teardown, Ok(Ok(()))) {
                    tracing::warn!(server_id = %server_id, "Forced teardown failed during shutdown");
                }
            }

            if matches!(instance.status(), ServerStatus::Running | ServerStatus::Crashed) {
                let _ = instance.transition(ServerStatus::Stopping);
            }
            let _ = instance.transition(ServerStatus::Stopped);
            if let Some(watcher) = lock(&self.inner.watchers).remove(&server_id) {
                watcher.abort();
            }
            self.emit(HostEvent::ServerStopped { server_id });
        }
    }
}
