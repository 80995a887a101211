//! Worker instance model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{InstanceId, StrategyId};

/// Instance lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Unhealthy,
    Stopped,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
        }
    }
}

/// Resource usage as last reported by the container runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

/// A worker process running inside the container runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub container_id: String,
    /// Worker REST base URL, e.g. `http://127.0.0.1:18001`
    pub api_url: String,
    /// Worker metrics stream URL, e.g. `ws://127.0.0.1:18001/ws`
    pub ws_url: String,
    pub status: InstanceStatus,
    pub resources: ResourceUsage,
    pub strategies: Vec<StrategyId>,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub recovery_attempts: u32,
    pub needs_manual_intervention: bool,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}

/// Provisioning request for a new instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Optional human name; generated from the id when absent
    pub name: Option<String>,
    /// Worker image override; the runtime default is used when absent
    pub image: Option<String>,
    /// Extra environment passed to the worker
    pub environment: HashMap<String, String>,
    /// CPU limit in cores; the runtime default is used when absent
    pub cpu_limit: Option<f64>,
    /// Memory limit in MiB; the runtime default is used when absent
    pub memory_limit_mb: Option<u64>,
}

/// Read-only view of instance health, implemented by the fleet manager
///
/// Lets the safety layer check placement targets without owning the fleet.
pub trait InstanceDirectory: Send + Sync {
    /// True when the instance exists and is `running`
    fn is_instance_healthy(&self, instance_id: &str) -> bool;

    /// Ids of all `running` instances
    fn running_instances(&self) -> Vec<InstanceId>;
}
