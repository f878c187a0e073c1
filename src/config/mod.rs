//! Configuration module for MCP Host.
//!
//! This module holds the per-server configuration handed to
//! `ServerHost::start_server`, the host-wide settings, and the file format
//! that bundles both. Files can be JSON or YAML.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use mcp_host::config::{Config, validate_config};
//!
//! let config = Config::from_file("host.yaml").unwrap();
//! validate_config(&config).unwrap();
//! println!("Loaded configuration with {} servers", config.servers.len());
//! ```
//!
//! Creating a configuration programmatically:
//!
//! ```
//! use mcp_host::config::{HostConfig, PluginManifest, ServerConfig};
//! use std::time::Duration;
//!
//! let host = HostConfig {
//!     max_servers: 5,
//!     health_check_interval: Duration::from_secs(10),
//!     ..HostConfig::default()
//! };
//!
//! let manifest = PluginManifest {
//!     id: "kanban".to_string(),
//!     name: "Kanban".to_string(),
//!     version: "1.0.0".to_string(),
//!     permissions: vec!["workspace:read".to_string()],
//!     main: None,
//! };
//! let internal = ServerConfig::internal("Kanban", manifest);
//! assert_eq!(internal.version, "1.0.0");
//! ```
mod parser;
pub mod validator;

pub use parser::{Config, HostConfig, PluginManifest, ServerConfig, ServerKind, ServerType};
pub use validator::{validate_config, validate_host_config, validate_server_config};
