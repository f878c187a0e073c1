use crate::client::ProtocolClient;
use crate::config::{ServerConfig, ServerType};
use crate::error::{Error, Result};
use crate::events::{EventBus, Subscription};
use crate::lock;
use crate::sandbox::Sandbox;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};

const STATUS_EVENT_CAPACITY: usize = 16;

/// Status of a hosted server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Not running; the initial and final state
    Stopped,
    /// Sandbox is initializing
    Starting,
    /// Server is up and receiving health checks
    Running,
    /// Server went away without being asked to
    Crashed,
    /// Teardown in progress
    Stopping,
}

impl ServerStatus {
    /// Whether the state machine has an edge from `self` to `to`.
    ///
    /// `Starting -> Stopped` is the startup rollback edge and
    /// `Crashed -> Stopping` lets a crashed server be torn down.
    pub fn can_transition_to(self, to: Self) -> bool {
        use ServerStatus::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Crashed, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Bookkeeping attached to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetadata {
    /// When the instance object was created
    pub created_at: DateTime<Utc>,
    /// Last time the instance entered `Running`
    pub started_at: Option<DateTime<Utc>>,
    /// Last time the instance entered `Stopped`
    pub stopped_at: Option<DateTime<Utc>>,
    /// Crash-driven restarts since the last explicit restart
    pub restart_count: u32,
}

/// Emitted by an instance on every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    /// Server id
    pub server_id: String,
    /// New status
    pub status: ServerStatus,
    /// Status before the transition
    pub previous: ServerStatus,
}

#[derive(Default)]
struct Handles {
    sandbox: Option<Arc<dyn Sandbox>>,
    protocol: Option<Arc<dyn ProtocolClient>>,
    pid: Option<u32>,
}

struct State {
    status: ServerStatus,
    metadata: InstanceMetadata,
    handles: Handles,
}

/// One hosted server.
///
/// Created by the host on start and dropped from the registry on stop. The
/// instance exclusively owns its sandbox and protocol handles; other
/// components only borrow clones of them for the duration of a call.
///
/// Only the host moves an instance along its state machine, with one
/// exception: [`ServerInstance::mark_crashed`] may be signalled by whatever
/// observes the server dying.
pub struct ServerInstance {
    server_id: String,
    config: ServerConfig,
    state: Mutex<State>,
    status_events: EventBus<StatusChange>,
}

impl ServerInstance {
    /// Create a stopped instance
    pub fn new(server_id: impl Into<String>, config: ServerConfig) -> Self {
        Self::with_restart_count(server_id, config, 0)
    }

    /// Create a stopped instance that continues a restart sequence
    pub fn with_restart_count(server_id: impl Into<String>, config: ServerConfig, restart_count: u32) -> Self {
        Self {
            server_id: server_id.into(),
            config,
            state: Mutex::new(State {
                status: ServerStatus::Stopped,
                metadata: InstanceMetadata {
                    created_at: Utc::now(),
                    started_at: None,
                    stopped_at: None,
                    restart_count,
                },
                handles: Handles::default(),
            }),
            status_events: EventBus::new(STATUS_EVENT_CAPACITY),
        }
    }

    /// The server id
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// The configuration the server was started with
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The server type
    pub fn server_type(&self) -> ServerType {
        self.config.server_type()
    }

    /// Current status
    pub fn status(&self) -> ServerStatus {
        lock(&self.state).status
    }

    /// Snapshot of the metadata
    pub fn metadata(&self) -> InstanceMetadata {
        lock(&self.state).metadata.clone()
    }

    /// Crash-driven restarts since the last explicit restart
    pub fn restart_count(&self) -> u32 {
        lock(&self.state).metadata.restart_count
    }

    /// OS process id, for process-backed servers
    pub fn pid(&self) -> Option<u32> {
        lock(&self.state).handles.pid
    }

    /// Protocol client used for pings and requests
    pub fn protocol(&self) -> Option<Arc<dyn ProtocolClient>> {
        lock(&self.state).handles.protocol.clone()
    }

    /// Subscribe to this instance's status changes
    pub fn subscribe(&self) -> Subscription<StatusChange> {
        self.status_events.subscribe()
    }

    /// Signal that the server died on its own.
    ///
    /// Only valid while `Running`. Anything else (including a server that is
    /// already being stopped) is rejected with `InvalidTransition`.
    pub fn mark_crashed(&self) -> Result<()> {
        self.transition(ServerStatus::Crashed).map(|_| ())
    }

    /// Move to `to`, stamping timestamps and notifying subscribers.
    ///
    /// Returns the previous status.
    pub(crate) fn transition(&self, to: ServerStatus) -> Result<ServerStatus> {
        let mut state = lock(&self.state);
        let previous = state.status;
        if !previous.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                server_id: self.server_id.clone(),
                from: previous,
                to,
            });
        }
        state.status = to;
        match to {
            ServerStatus::Running => state.metadata.started_at = Some(Utc::now()),
            ServerStatus::Stopped => state.metadata.stopped_at = Some(Utc::now()),
            _ => {}
        }

        tracing::debug!(server_id = %self.server_id, from = %previous, to = %to, "Status changed");
        // Published under the state lock so subscribers see transitions in order
        self.status_events.emit(StatusChange {
            server_id: self.server_id.clone(),
            status: to,
            previous,
        });
        Ok(previous)
    }

    pub(crate) fn attach(&self, sandbox: Arc<dyn Sandbox>) {
        let mut state = lock(&self.state);
        state.handles.protocol = sandbox.protocol();
        state.handles.pid = sandbox.pid();
        state.handles.sandbox = Some(sandbox);
    }

    pub(crate) fn sandbox(&self) -> Option<Arc<dyn Sandbox>> {
        lock(&self.state).handles.sandbox.clone()
    }

    /// Release every handle, returning the sandbox for teardown
    pub(crate) fn detach(&self) -> Option<Arc<dyn Sandbox>> {
        let mut state = lock(&self.state);
        state.handles.protocol = None;
        state.handles.pid = None;
        state.handles.sandbox.take()
    }
}

impl fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ServerInstance")
            .field("server_id", &self.server_id)
            .field("type", &self.config.server_type())
            .field("status", &state.status)
            .field("metadata", &state.metadata)
            .field("pid", &state.handles.pid)
            .finish()
    }
}
