//! Per-instance worker connection

use botfleet_connectors::WorkerEndpoint;
use botfleet_types::{InstanceId, StrategyKind};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// Last ping failed; one more failure marks the connection failed
    Degraded,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Degraded => "degraded",
            ConnectionStatus::Failed => "failed",
        }
    }

    /// Usable for strategy operations
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Degraded)
    }
}

/// Live control channel to one worker instance
#[derive(Debug)]
pub struct Connection {
    pub instance_id: InstanceId,
    pub endpoint: WorkerEndpoint,
    /// Strategy templates the worker reported at connect time
    pub supported_strategies: Vec<String>,
    pub connected_at: DateTime<Utc>,
    status: RwLock<ConnectionStatus>,
    attempts: AtomicU32,
    last_ping: RwLock<Option<DateTime<Utc>>>,
}

impl Connection {
    pub fn new(
        instance_id: &str,
        endpoint: WorkerEndpoint,
        supported_strategies: Vec<String>,
        attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.to_string(),
            endpoint,
            supported_strategies,
            connected_at: now,
            status: RwLock::new(ConnectionStatus::Connected),
            attempts: AtomicU32::new(attempts),
            last_ping: RwLock::new(Some(now)),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last_ping(&self) -> Option<DateTime<Utc>> {
        *self.last_ping.read()
    }

    /// True when the worker did not report its templates or lists `kind`
    pub fn supports(&self, kind: StrategyKind) -> bool {
        self.supported_strategies.is_empty()
            || self
                .supported_strategies
                .iter()
                .any(|s| s == kind.wire_name())
    }

    pub(crate) fn record_ping_success(&self) {
        *self.last_ping.write() = Some(Utc::now());
        *self.status.write() = ConnectionStatus::Connected;
    }

    /// Returns the new status
    pub(crate) fn record_ping_failure(&self) -> ConnectionStatus {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut status = self.status.write();
        *status = match *status {
            ConnectionStatus::Connected => ConnectionStatus::Degraded,
            _ => ConnectionStatus::Failed,
        };
        *status
    }

    pub(crate) fn mark_failed(&self) {
        *self.status.write() = ConnectionStatus::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(supported: Vec<String>) -> Connection {
        Connection::new("i-1", WorkerEndpoint::for_host("127.0.0.1", 18001), supported, 1)
    }

    #[test]
    fn test_ping_failures_degrade_then_fail() {
        let conn = connection(Vec::new());
        assert_eq!(conn.status(), ConnectionStatus::Connected);

        assert_eq!(conn.record_ping_failure(), ConnectionStatus::Degraded);
        assert!(conn.status().is_live());
        assert_eq!(conn.record_ping_failure(), ConnectionStatus::Failed);
        assert!(!conn.status().is_live());

        conn.record_ping_success();
        assert_eq!(conn.status(), ConnectionStatus::Connected);
        assert_eq!(conn.attempts(), 3);
    }

    #[test]
    fn test_supports_reported_templates() {
        let conn = connection(vec!["twap".to_string()]);
        assert!(conn.supports(StrategyKind::Twap));
        assert!(!conn.supports(StrategyKind::Grid));

        let unknown = connection(Vec::new());
        assert!(unknown.supports(StrategyKind::Grid));
    }
}
