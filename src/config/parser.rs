use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// Kind of isolation a hosted server runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    /// Plugin-provided server, validated against its manifest
    Internal,
    /// Separate OS process spoken to over stdio
    External,
    /// Lightweight server running inside the host process
    Embedded,
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::External => write!(f, "external"),
            Self::Embedded => write!(f, "embedded"),
        }
    }
}

/// Manifest of the plugin that provides an internal server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin identifier, also used to look up the embedded implementation
    pub id: String,
    /// Human readable plugin name
    #[serde(default)]
    pub name: String,
    /// Plugin version
    pub version: String,
    /// Permissions the plugin requests
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Entry point inside the plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
}

/// Type-specific part of a [`ServerConfig`].
///
/// Serialized with an internal `type` tag so a server entry reads
/// `{"type": "external", "command": "...", "args": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerKind {
    /// Plugin-provided server
    Internal {
        /// Manifest checked by the security manager before start
        manifest: PluginManifest,
    },
    /// Child process server
    External {
        /// Command to execute. An absolute path or a command on the PATH.
        command: String,
        /// Command-line arguments
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables, combined with the current environment
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// In-process server
    Embedded,
}

/// Configuration for a single hosted server.
///
/// Immutable once the server starts; a restart reuses the same value.
///
/// # Examples
///
/// ```
/// use mcp_host::config::{ServerConfig, ServerType};
///
/// let config = ServerConfig::external("fetch", "uvx", vec!["mcp-server-fetch".to_string()])
///     .with_version("1.2.0");
/// assert_eq!(config.server_type(), ServerType::External);
///
/// let parsed: ServerConfig = serde_json::from_str(
///     r#"{"name": "notes", "version": "0.1.0", "type": "embedded"}"#,
/// ).unwrap();
/// assert_eq!(parsed.server_type(), ServerType::Embedded);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Display name of the server
    pub name: String,
    /// Server version
    #[serde(default = "default_version")]
    pub version: String,
    /// Type and type-specific fields
    #[serde(flatten)]
    pub kind: ServerKind,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

impl ServerConfig {
    /// Configuration for a plugin-provided server
    pub fn internal(name: impl Into<String>, manifest: PluginManifest) -> Self {
        Self {
            name: name.into(),
            version: manifest.version.clone(),
            kind: ServerKind::Internal { manifest },
        }
    }

    /// Configuration for a child process server
    pub fn external(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            kind: ServerKind::External {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
        }
    }

    /// Configuration for an in-process server
    pub fn embedded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            kind: ServerKind::Embedded,
        }
    }

    /// Replace the version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add an environment variable. Has no effect on non-external servers.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let ServerKind::External { env, .. } = &mut self.kind {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// The server's type
    pub fn server_type(&self) -> ServerType {
        match self.kind {
            ServerKind::Internal { .. } => ServerType::Internal,
            ServerKind::External { .. } => ServerType::External,
            ServerKind::Embedded => ServerType::Embedded,
        }
    }

    /// The plugin manifest, for internal servers
    pub fn manifest(&self) -> Option<&PluginManifest> {
        match &self.kind {
            ServerKind::Internal { manifest } => Some(manifest),
            _ => None,
        }
    }
}

/// Host-wide settings.
///
/// Durations are written in milliseconds in configuration files:
///
/// ```json
/// {
///   "maxServers": 20,
///   "serverStartupTimeout": 30000,
///   "serverShutdownTimeout": 10000,
///   "healthCheckInterval": 30000,
///   "healthCheckTimeout": 5000,
///   "restartOnCrash": true,
///   "maxCrashRestarts": 5
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    /// Maximum number of registered servers
    pub max_servers: usize,
    /// Upper bound for sandbox initialization
    #[serde(with = "duration_millis")]
    pub server_startup_timeout: Duration,
    /// Upper bound for graceful shutdown before forcing teardown
    #[serde(with = "duration_millis")]
    pub server_shutdown_timeout: Duration,
    /// Period of the health monitor
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,
    /// Upper bound for a single health ping
    #[serde(with = "duration_millis")]
    pub health_check_timeout: Duration,
    /// Restart servers that crash while running
    pub restart_on_crash: bool,
    /// Consecutive crash-driven restarts allowed before giving up
    pub max_crash_restarts: u32,
    /// Buffered events per subscriber before old ones are dropped
    pub event_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_servers: 20,
            server_startup_timeout: Duration::from_secs(30),
            server_shutdown_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            restart_on_crash: true,
            max_crash_restarts: 5,
            event_capacity: 256,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// A host configuration file.
///
/// # JSON Schema
///
/// ```json
/// {
///   "host": { "maxServers": 5, "restartOnCrash": true },
///   "servers": {
///     "fetch": {
///       "name": "Fetch",
///       "type": "external",
///       "command": "uvx",
///       "args": ["mcp-server-fetch"]
///     },
///     "notes": { "name": "Notes", "type": "embedded" }
///   }
/// }
/// ```
///
/// # Examples
///
/// ```no_run
/// use mcp_host::config::Config;
///
/// let config = Config::from_file("host.json").unwrap();
/// println!("{} servers configured", config.servers.len());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Host-wide settings
    #[serde(default)]
    pub host: HostConfig,
    /// Servers keyed by server id
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Config {
    /// Loads a configuration from a file path.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, everything else
    /// as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The file contents are not valid JSON/YAML
    /// * The document does not conform to the expected schema
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

        if is_yaml {
            Self::parse_yaml_str(&content)
        } else {
            Self::parse_from_str(&content)
        }
    }

    /// Parses a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid JSON or does not match
    /// the schema.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Parses a configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid YAML or does not match
    /// the schema.
    pub fn parse_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_durations_in_millis() {
        let config = Config::parse_from_str(
            r#"{
                "host": {
                    "maxServers": 3,
                    "serverStartupTimeout": 1500,
                    "restartOnCrash": false
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.host.max_servers, 3);
        assert_eq!(config.host.server_startup_timeout, Duration::from_millis(1500));
        assert!(!config.host.restart_on_crash);
        // untouched fields keep their defaults
        assert_eq!(config.host.server_shutdown_timeout, Duration::from_secs(10));
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_with_env_only_applies_to_external() {
        let config = ServerConfig::embedded("notes").with_env("DEBUG", "1");
        assert_eq!(config.kind, ServerKind::Embedded);

        let config = ServerConfig::external("fetch", "uvx", vec![]).with_env("DEBUG", "1");
        match config.kind {
            ServerKind::External { env, .. } => assert_eq!(env.get("DEBUG").map(String::as_str), Some("1")),
            other => panic!("unexpected kind {:?}", other),
        }
    }
}
