use crate::config::{Config, HostConfig, ServerConfig, ServerKind};
use crate::error::{Error, Result};

/// Validates a server configuration registered under `server_id`
pub fn validate_server_config(server_id: &str, config: &ServerConfig) -> Result<()> {
    if server_id.trim().is_empty() {
        return Err(Error::ConfigInvalid("Server id must not be empty".to_string()));
    }

    if config.name.trim().is_empty() {
        return Err(Error::ConfigInvalid(format!("Server '{}' has empty name", server_id)));
    }

    match &config.kind {
        ServerKind::External { command, .. } => {
            if command.trim().is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "Server '{}' has empty command",
                    server_id
                )));
            }
        }
        ServerKind::Internal { manifest } => {
            if manifest.id.trim().is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "Server '{}' has a manifest without id",
                    server_id
                )));
            }
            if manifest.version.trim().is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "Server '{}' has a manifest without version",
                    server_id
                )));
            }
        }
        ServerKind::Embedded => {}
    }

    Ok(())
}

/// Validates host-wide settings
pub fn validate_host_config(config: &HostConfig) -> Result<()> {
    if config.max_servers == 0 {
        return Err(Error::ConfigInvalid("maxServers must be at least 1".to_string()));
    }

    let durations = [
        ("serverStartupTimeout", config.server_startup_timeout),
        ("serverShutdownTimeout", config.server_shutdown_timeout),
        ("healthCheckInterval", config.health_check_interval),
        ("healthCheckTimeout", config.health_check_timeout),
    ];
    for (name, value) in durations {
        if value.is_zero() {
            return Err(Error::ConfigInvalid(format!("{} must be greater than zero", name)));
        }
    }

    if config.event_capacity == 0 {
        return Err(Error::ConfigInvalid("eventCapacity must be at least 1".to_string()));
    }

    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &Config) -> Result<()> {
    validate_host_config(&config.host)?;

    if config.servers.len() > config.host.max_servers {
        return Err(Error::ConfigInvalid(format!(
            "{} servers configured but maxServers is {}",
            config.servers.len(),
            config.host.max_servers
        )));
    }

    for (server_id, server) in &config.servers {
        validate_server_config(server_id, server)?;
    }

    Ok(())
}
