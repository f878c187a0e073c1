use crate::events::HostEvent;
use crate::lock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default number of events kept
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// A host event and when it happened
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleRecord {
    /// The event
    #[serde(flatten)]
    pub event: HostEvent,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
}

/// Bounded history of host events, oldest dropped first
pub struct LifecycleLog {
    records: Mutex<VecDeque<LifecycleRecord>>,
    capacity: usize,
}

impl LifecycleLog {
    /// Create a log holding at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    /// Append an event
    pub fn record(&self, event: HostEvent) {
        let mut records = lock(&self.records);
        records.push_back(LifecycleRecord {
            event,
            timestamp: Utc::now(),
        });
        while records.len() > self.capacity {
            records.pop_front();
        }
    }

    /// Events concerning one server, newest first
    pub fn server_events(&self, server_id: &str, limit: Option<usize>) -> Vec<LifecycleRecord> {
        lock(&self.records)
            .iter()
            .rev()
            .filter(|record| record.event.server_id() == Some(server_id))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// All events, newest first
    pub fn all_events(&self, limit: Option<usize>) -> Vec<LifecycleRecord> {
        lock(&self.records)
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Number of events held
    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every event
    pub fn clear(&self) {
        lock(&self.records).clear();
    }
}

impl Default for LifecycleLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_events_newest_first() {
        let log = LifecycleLog::default();
        log.record(HostEvent::ServerStarted {
            server_id: "a".to_string(),
            name: "A".to_string(),
            server_type: crate::config::ServerType::Embedded,
        });
        log.record(HostEvent::ServerStarted {
            server_id: "b".to_string(),
            name: "B".to_string(),
            server_type: crate::config::ServerType::Embedded,
        });
        log.record(HostEvent::ServerStopped {
            server_id: "a".to_string(),
        });

        let events = log.server_events("a", None);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.name(), "server-stopped");
        assert_eq!(events[1].event.name(), "server-started");

        assert_eq!(log.all_events(Some(1)).len(), 1);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let log = LifecycleLog::new(2);
        log.record(HostEvent::Initialized);
        log.record(HostEvent::ServerStopped {
            server_id: "a".to_string(),
        });
        log.record(HostEvent::Shutdown);

        let events = log.all_events(None);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, HostEvent::Shutdown);
        assert_eq!(events[1].event.name(), "server-stopped");
    }
}
