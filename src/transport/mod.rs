//! Transports carrying JSON-RPC between the host and a hosted server.
//!
//! [`StdioTransport`] speaks newline-delimited JSON over a child process's
//! pipes. [`ChannelTransport`] hands messages to an in-process server over a
//! Tokio channel.
mod channel;
mod json_rpc;
mod stdio;

pub use channel::{ChannelTransport, Envelope};
pub use json_rpc::{
    INTERNAL_ERROR, JSON_RPC_VERSION, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, MCP_PROTOCOL_VERSION,
};
pub use stdio::StdioTransport;

use crate::error::Result;
use async_trait::async_trait;

/// A bidirectional JSON-RPC channel to one server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the matching response.
    ///
    /// Error responses are returned as `Error::JsonRpc`.
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Send a notification; no response is expected
    async fn send_notification(&self, notification: JsonRpcNotification) -> Result<()>;

    /// Close the outgoing side. Pending requests fail.
    async fn close(&self) -> Result<()>;
}
