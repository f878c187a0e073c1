//! Protocol clients for hosted servers.
//!
//! The host never interprets the resources/tools/prompts protocol itself.
//! It only needs a handle that can prove a server is alive (`ping`) and
//! forward a request on someone else's behalf. [`ProtocolClient`] is that
//! narrow surface; [`McpClient`] implements it over any [`Transport`].

use crate::error::{Error, Result};
use crate::transport::{JsonRpcNotification, JsonRpcRequest, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Protocol-level handle to one hosted server
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Liveness probe. Succeeds if the server answered.
    async fn ping(&self) -> Result<()>;

    /// Send a request and return its `result`
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value>;
}

/// A client for interacting with an MCP server.
///
/// # Examples
///
/// ```no_run
/// use mcp_host::client::{McpClient, ProtocolClient};
/// use mcp_host::transport::ChannelTransport;
///
/// # async fn example() -> mcp_host::Result<()> {
/// let (transport, _inbox) = ChannelTransport::pair("notes".to_string(), 16);
/// let client = McpClient::new("notes".to_string(), transport);
///
/// client.initialize().await?;
/// client.ping().await?;
/// let tools = client.request("tools/list", None).await?;
/// println!("{}", tools);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct McpClient {
    /// Server name for identification.
    name: String,
    /// Transport implementation for communication.
    transport: Arc<dyn Transport>,
}

impl McpClient {
    /// Creates a new MCP client with the specified name and transport.
    pub fn new(name: String, transport: impl Transport + 'static) -> Self {
        Self {
            name,
            transport: Arc::new(transport),
        }
    }

    /// Gets the name of the client (usually the same as the server name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Performs the MCP handshake.
    ///
    /// Sends `initialize`, then the `notifications/initialized`
    /// notification. Returns the server's `initialize` result.
    pub async fn initialize(&self) -> Result<Value> {
        let request = JsonRpcRequest::initialize(Uuid::new_v4().to_string(), &self.name);
        let response = self.transport.send_request(request).await?;
        self.transport
            .send_notification(JsonRpcNotification::initialized())
            .await?;
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Sends a notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.transport
            .send_notification(JsonRpcNotification::new(method, params))
            .await
    }

    /// Closes the underlying transport
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

#[async_trait]
impl ProtocolClient for McpClient {
    async fn ping(&self) -> Result<()> {
        let request = JsonRpcRequest::ping(Uuid::new_v4().to_string());
        self.transport.send_request(request).await.map(|_| ())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let request = JsonRpcRequest::new(Uuid::new_v4().to_string(), method, params);
        let response = self.transport.send_request(request).await?;
        response
            .result
            .ok_or_else(|| Error::Communication(format!("No result in response from '{}'", self.name)))
    }
}
