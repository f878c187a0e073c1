/// Error handling module for MCP Host.
///
/// This module defines the error types used throughout the library.
/// Every error that concerns a hosted server carries its server id so the
/// message alone identifies which server failed and which precondition was
/// violated.
///
/// # Example
///
/// ```
/// use mcp_host::error::{Error, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Operation succeeded"),
///         Err(Error::ServerAlreadyExists(id)) => println!("'{}' is already hosted", id),
///         Err(Error::CapacityExceeded { max, .. }) => println!("host is full ({} servers)", max),
///         Err(Error::Timeout(msg)) => println!("Operation timed out: {}", msg),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use crate::server::ServerStatus;
use thiserror::Error;

/// Errors that can occur in the mcp-host library.
#[derive(Error, Debug)]
pub enum Error {
    /// A server with the same id is already registered.
    ///
    /// Returned by `start_server` without touching the registry.
    #[error("Server '{0}' already exists")]
    ServerAlreadyExists(String),

    /// The registry already holds `max` servers.
    #[error("Cannot start server '{server_id}': maximum number of servers reached ({max})")]
    CapacityExceeded {
        /// Id of the server that was rejected
        server_id: String,
        /// Configured capacity
        max: usize,
    },

    /// No server is registered under the given id.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// A server operation was attempted before `initialize()`.
    #[error("Server host is not initialized")]
    NotInitialized,

    /// The server exists but its current status does not allow the operation.
    ///
    /// This error occurs when:
    /// - Stopping a server that is still starting
    /// - Stopping a server that is already being stopped
    #[error("Server '{server_id}' cannot {operation} while {status}")]
    InvalidState {
        /// Server id
        server_id: String,
        /// Status at the time of the call
        status: ServerStatus,
        /// Rejected operation
        operation: &'static str,
    },

    /// A state machine edge that does not exist was requested.
    #[error("Server '{server_id}': illegal transition from {from} to {to}")]
    InvalidTransition {
        /// Server id
        server_id: String,
        /// Current status
        from: ServerStatus,
        /// Requested status
        to: ServerStatus,
    },

    /// The sandbox could not be created or failed to initialize.
    ///
    /// The partially registered entry has been rolled back when this is
    /// returned.
    #[error("Server '{server_id}' failed to start: {reason}")]
    StartupFailed {
        /// Server id
        server_id: String,
        /// Underlying cause
        reason: String,
    },

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The security manager refused to admit the server.
    #[error("Server '{server_id}' was denied: {reason}")]
    PermissionDenied {
        /// Server id
        server_id: String,
        /// Why the server was rejected
        reason: String,
    },

    /// Forced teardown of a server failed.
    ///
    /// The server has still been removed from the registry when this is
    /// returned.
    #[error("Server '{server_id}' failed to shut down: {reason}")]
    ShutdownFailed {
        /// Server id
        server_id: String,
        /// Underlying cause
        reason: String,
    },

    /// Error raised by a sandbox implementation.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Error when spawning or signalling a server process.
    #[error("Server process error: {0}")]
    Process(String),

    /// Error in the JSON-RPC protocol.
    ///
    /// This error occurs when the server returns an error response.
    #[error("JSON-RPC error: {0}")]
    JsonRpc(String),

    /// Error in the transport layer.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Error in communication with the MCP server.
    ///
    /// This error occurs when:
    /// - The server doesn't respond
    /// - The response is malformed
    /// - The connection is lost
    #[error("Communication error: {0}")]
    Communication(String),

    /// Error in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Failed to parse configuration from a file or string.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration parsed but contains invalid values.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Any other error not covered by the above categories.
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for mcp-host operations.
pub type Result<T> = std::result::Result<T, Error>;
