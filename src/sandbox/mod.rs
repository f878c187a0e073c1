//! Isolation boundaries for hosted servers.
//!
//! The host depends only on the [`Sandbox`] trait: initialize, terminate,
//! route a message, and expose a protocol handle. What happens at runtime
//! (errors, unexpected exits, resource samples) flows back as
//! [`SandboxEvent`]s on the channel the [`SandboxFactory`] hands to every
//! sandbox it creates.
//!
//! Two implementations ship with the crate:
//!
//! * [`ProcessSandbox`] runs an external command and talks to it over stdio.
//! * [`InProcessSandbox`] runs an [`EmbeddedServer`] on a Tokio task.
//!
//! [`DefaultSandboxFactory`] picks between them by `ServerType`.
mod embedded;
mod process;

pub use embedded::{EmbeddedServer, InProcessSandbox};
pub use process::ProcessSandbox;

use crate::client::{McpClient, ProtocolClient};
use crate::config::{ServerConfig, ServerKind};
use crate::error::{Error, Result};
use crate::server::ResourceUsage;
use crate::transport::{JsonRpcMessage, JsonRpcResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, PoisonError};
use tokio::sync::mpsc;

/// How a sandbox should be torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    /// Ask the server to exit and wait for it
    Graceful,
    /// Kill it
    Forced,
}

/// Runtime signal from a sandbox to the host
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxEvent {
    /// The server reported an error but keeps running
    Error(String),
    /// The server went away without being terminated
    Exited {
        /// Exit code, when the server was a process that exited normally
        code: Option<i32>,
    },
    /// Fresh resource sample, replaces the previous one
    ResourceUsage(ResourceUsage),
}

/// Sending half of the sandbox event channel
pub type SandboxEventSender = mpsc::UnboundedSender<SandboxEvent>;

/// Receiving half of the sandbox event channel
pub type SandboxEventReceiver = mpsc::UnboundedReceiver<SandboxEvent>;

/// Isolation boundary around one hosted server
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Bring the server up. The host bounds this with its startup timeout.
    async fn initialize(&self) -> Result<()>;

    /// Tear the server down.
    ///
    /// A graceful call that is cancelled (for example by a timeout) must
    /// leave the sandbox in a state where a forced call still works.
    async fn terminate(&self, mode: TerminationMode) -> Result<()>;

    /// Route a JSON-RPC message to the server.
    ///
    /// Requests resolve to the server's response, notifications to `None`.
    async fn handle_message(&self, message: JsonRpcMessage) -> Result<Option<JsonRpcResponse>>;

    /// Protocol handle for health pings, once initialized
    fn protocol(&self) -> Option<Arc<dyn ProtocolClient>>;

    /// OS process id, if the server is a process
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Creates a sandbox for a server
pub trait SandboxFactory: Send + Sync {
    /// Create (but do not initialize) a sandbox for `server_id`.
    ///
    /// Runtime signals must be sent on `events`.
    fn create(&self, server_id: &str, config: &ServerConfig, events: SandboxEventSender) -> Result<Arc<dyn Sandbox>>;
}

/// Picks a sandbox by server type.
///
/// * External servers become a [`ProcessSandbox`].
/// * Embedded servers run the [`EmbeddedServer`] registered under the
///   config's `name`.
/// * Internal servers run the [`EmbeddedServer`] registered under their
///   manifest id.
///
/// # Examples
///
/// ```
/// use mcp_host::sandbox::{DefaultSandboxFactory, EmbeddedServer};
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use std::sync::Arc;
///
/// struct Notes;
///
/// #[async_trait]
/// impl EmbeddedServer for Notes {
///     async fn handle_request(&self, method: &str, _params: Option<Value>) -> mcp_host::Result<Value> {
///         Ok(json!({ "method": method }))
///     }
/// }
///
/// let factory = DefaultSandboxFactory::new();
/// factory.register_embedded("Notes", Arc::new(Notes));
/// ```
#[derive(Default)]
pub struct DefaultSandboxFactory {
    embedded: RwLock<HashMap<String, Arc<dyn EmbeddedServer>>>,
}

impl DefaultSandboxFactory {
    /// Create a factory with no embedded servers registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the implementation behind an embedded server name or an
    /// internal plugin's manifest id
    pub fn register_embedded(&self, key: impl Into<String>, server: Arc<dyn EmbeddedServer>) {
        self.embedded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), server);
    }

    fn embedded_server(&self, key: &str) -> Option<Arc<dyn EmbeddedServer>> {
        self.embedded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl SandboxFactory for DefaultSandboxFactory {
    fn create(&self, server_id: &str, config: &ServerConfig, events: SandboxEventSender) -> Result<Arc<dyn Sandbox>> {
        let key = match &config.kind {
            ServerKind::External { command, args, env } => {
                return Ok(Arc::new(ProcessSandbox::new(
                    server_id.to_string(),
                    command.clone(),
                    args.clone(),
                    env.clone(),
                    events,
                )));
            }
            ServerKind::Internal { manifest } => manifest.id.as_str(),
            ServerKind::Embedded => config.name.as_str(),
        };

        let server = self.embedded_server(key).ok_or_else(|| {
            Error::Sandbox(format!(
                "no embedded server registered as '{}' for server '{}'",
                key, server_id
            ))
        })?;
        Ok(Arc::new(InProcessSandbox::new(server_id.to_string(), server, events)))
    }
}

/// Forward a message through a protocol client
async fn route(client: &McpClient, message: JsonRpcMessage) -> Result<Option<JsonRpcResponse>> {
    match message {
        JsonRpcMessage::Request(request) => {
            let result = client.request(&request.method, request.params).await?;
            Ok(Some(JsonRpcResponse::success(request.id, result)))
        }
        JsonRpcMessage::Notification(notification) => {
            client.notify(&notification.method, notification.params).await?;
            Ok(None)
        }
        JsonRpcMessage::Response(_) => Err(Error::Sandbox(format!(
            "'{}' does not accept responses",
            client.name()
        ))),
    }
}
