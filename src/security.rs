//! Admission checks run before a server is started.
//!
//! Internal servers must present a valid plugin manifest and pass the
//! permission check. External servers only go through the permission check.
//! Embedded servers are trusted.

use crate::config::{PluginManifest, ServerConfig, ServerKind};
use std::collections::HashSet;

/// Decides whether a server may be started
pub trait SecurityManager: Send + Sync {
    /// Whether a plugin manifest is well formed and trusted
    fn validate_plugin(&self, manifest: &PluginManifest) -> bool;

    /// Whether `server_id` may run with `config`
    fn check_permissions(&self, server_id: &str, config: &ServerConfig) -> bool;
}

/// Admits every server
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllSecurity;

impl SecurityManager for AllowAllSecurity {
    fn validate_plugin(&self, _manifest: &PluginManifest) -> bool {
        true
    }

    fn check_permissions(&self, _server_id: &str, _config: &ServerConfig) -> bool {
        true
    }
}

/// Allow-list based policy.
///
/// A manifest is valid when it has a non-empty id and a dotted numeric
/// version. An internal server passes the permission check when every
/// permission it requests is allow-listed; an external server passes when
/// spawning external processes is allowed.
///
/// # Examples
///
/// ```
/// use mcp_host::config::{PluginManifest, ServerConfig};
/// use mcp_host::security::{PermissionPolicy, SecurityManager};
///
/// let policy = PermissionPolicy::new()
///     .allow_permission("fs:read")
///     .allow_external_processes(false);
///
/// let manifest = PluginManifest {
///     id: "notes".to_string(),
///     name: "Notes".to_string(),
///     version: "1.0.0".to_string(),
///     permissions: vec!["fs:read".to_string()],
///     main: None,
/// };
/// let internal = ServerConfig::internal("Notes", manifest.clone());
/// assert!(policy.validate_plugin(&manifest));
/// assert!(policy.check_permissions("notes", &internal));
///
/// let external = ServerConfig::external("Fetch", "uvx", vec![]);
/// assert!(!policy.check_permissions("fetch", &external));
/// ```
#[derive(Debug, Clone, Default)]
pub struct PermissionPolicy {
    allowed_permissions: HashSet<String>,
    allow_external_processes: bool,
}

impl PermissionPolicy {
    /// Policy with nothing allowed
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow-list a permission
    pub fn allow_permission(mut self, permission: impl Into<String>) -> Self {
        self.allowed_permissions.insert(permission.into());
        self
    }

    /// Whether external servers may be spawned
    pub fn allow_external_processes(mut self, allow: bool) -> Self {
        self.allow_external_processes = allow;
        self
    }
}

fn is_dotted_version(version: &str) -> bool {
    !version.is_empty()
        && version
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

impl SecurityManager for PermissionPolicy {
    fn validate_plugin(&self, manifest: &PluginManifest) -> bool {
        !manifest.id.trim().is_empty() && is_dotted_version(&manifest.version)
    }

    fn check_permissions(&self, server_id: &str, config: &ServerConfig) -> bool {
        let allowed = match &config.kind {
            ServerKind::Internal { manifest } => manifest
                .permissions
                .iter()
                .all(|permission| self.allowed_permissions.contains(permission)),
            ServerKind::External { .. } => self.allow_external_processes,
            ServerKind::Embedded => true,
        };
        if !allowed {
            tracing::debug!(server_id = %server_id, server_type = %config.server_type(), "Permission check rejected server");
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(version: &str, permissions: &[&str]) -> PluginManifest {
        PluginManifest {
            id: "plugin".to_string(),
            name: "Plugin".to_string(),
            version: version.to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            main: None,
        }
    }

    #[test]
    fn test_manifest_version_must_be_numeric() {
        let policy = PermissionPolicy::new();
        assert!(policy.validate_plugin(&manifest("1.2.3", &[])));
        assert!(policy.validate_plugin(&manifest("2", &[])));
        assert!(!policy.validate_plugin(&manifest("", &[])));
        assert!(!policy.validate_plugin(&manifest("1..0", &[])));
        assert!(!policy.validate_plugin(&manifest("latest", &[])));
    }

    #[test]
    fn test_internal_permissions_must_be_allow_listed() {
        let policy = PermissionPolicy::new().allow_permission("net");
        let ok = ServerConfig::internal("P", manifest("1.0.0", &["net"]));
        let denied = ServerConfig::internal("P", manifest("1.0.0", &["net", "fs:write"]));

        assert!(policy.check_permissions("p", &ok));
        assert!(!policy.check_permissions("p", &denied));
        assert!(policy.check_permissions("e", &ServerConfig::embedded("E")));
    }

    #[test]
    fn test_external_processes_toggle() {
        let external = ServerConfig::external("X", "cat", vec![]);
        assert!(!PermissionPolicy::new().check_permissions("x", &external));
        assert!(
            PermissionPolicy::new()
                .allow_external_processes(true)
                .check_permissions("x", &external)
        );
        assert!(AllowAllSecurity.check_permissions("x", &external));
    }
}
