use crate::config::ServerType;
use crate::server::{ServerInstance, ServerStatus};
use serde::{Deserialize, Serialize};

/// Latest resource sample reported by a server's sandbox
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Resident memory in bytes
    pub memory_usage: u64,
    /// CPU usage as a fraction between 0 and 1
    pub cpu_usage: f64,
}

impl ResourceUsage {
    /// Build a sample, clamping `cpu_usage` into `0..=1`
    pub fn new(memory_usage: u64, cpu_usage: f64) -> Self {
        let cpu_usage = if cpu_usage.is_nan() { 0.0 } else { cpu_usage.clamp(0.0, 1.0) };
        Self {
            memory_usage,
            cpu_usage,
        }
    }
}

/// Registered servers per type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TypeCounts {
    /// Plugin-provided servers
    pub internal: usize,
    /// Child process servers
    pub external: usize,
    /// In-process servers
    pub embedded: usize,
}

impl TypeCounts {
    /// Sum over all types
    pub fn total(&self) -> usize {
        self.internal + self.external + self.embedded
    }

    fn count(&mut self, server_type: ServerType) {
        match server_type {
            ServerType::Internal => self.internal += 1,
            ServerType::External => self.external += 1,
            ServerType::Embedded => self.embedded += 1,
        }
    }
}

/// Aggregate view over the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    /// Registered servers in any status
    pub total_servers: usize,
    /// Servers currently `Running`
    pub running_servers: usize,
    /// Registered servers per type
    pub by_type: TypeCounts,
}

impl HostStats {
    /// Single pass over `instances`
    pub fn collect<'a>(instances: impl IntoIterator<Item = &'a ServerInstance>) -> Self {
        let mut stats = Self::default();
        for instance in instances {
            stats.total_servers += 1;
            if instance.status() == ServerStatus::Running {
                stats.running_servers += 1;
            }
            stats.by_type.count(instance.server_type());
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn test_cpu_usage_is_clamped() {
        assert_eq!(ResourceUsage::new(1, 1.7).cpu_usage, 1.0);
        assert_eq!(ResourceUsage::new(1, -0.2).cpu_usage, 0.0);
        assert_eq!(ResourceUsage::new(1, f64::NAN).cpu_usage, 0.0);
    }

    #[test]
    fn test_collect_counts_by_type() {
        let instances = [
            ServerInstance::new("a", ServerConfig::embedded("A")),
            ServerInstance::new("b", ServerConfig::embedded("B")),
            ServerInstance::new("c", ServerConfig::external("C", "cat", vec![])),
        ];
        let stats = HostStats::collect(instances.iter());

        assert_eq!(stats.total_servers, 3);
        assert_eq!(stats.running_servers, 0);
        assert_eq!(stats.by_type, TypeCounts { internal: 0, external: 1, embedded: 2 });
        assert_eq!(
            serde_json::to_value(stats.by_type).unwrap(),
            serde_json::json!({"Internal": 0, "External": 1, "Embedded": 2})
        );
    }
}
