//! FLEET - Worker instance lifecycle
//!
//! Owns every worker container: provisions it, waits until the worker API
//! answers, watches its health and resources, recovers it when it drifts, and
//! keeps the fleet sized against the scaling policy.
//!
//! # Responsibilities
//! - Provision and remove instances (with rollback of partial containers)
//! - Health checks: container state, worker ping, resource usage
//! - Bounded recovery, then manual-intervention flagging
//! - Autoscaling and explicit scaling within policy bounds
//! - Load-based placement and strategy rebalancing

pub mod manager;
pub mod scaling;

use botfleet_bridge::BridgeError;
use botfleet_connectors::RuntimeError;
use botfleet_types::{InstanceId, ResourceUsage, Retryable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use manager::FleetManager;
pub use scaling::{desired_count, plan_moves, removal_order, InstanceLoad, PlannedMove};

/// Fleet errors
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Scale target {target} outside [{min}, {max}]")]
    InvalidTarget { target: usize, min: usize, max: usize },

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Instance {0} needs manual intervention")]
    ManualIntervention(String),
}

impl Retryable for FleetError {
    fn is_retryable(&self) -> bool {
        match self {
            FleetError::Runtime(e) => e.is_retryable(),
            FleetError::Bridge(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Reason an instance failed its health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIssue {
    ContainerNotRunning,
    ApiUnreachable,
    CpuExhausted,
    MemoryExhausted,
}

impl HealthIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthIssue::ContainerNotRunning => "container_not_running",
            HealthIssue::ApiUnreachable => "api_unreachable",
            HealthIssue::CpuExhausted => "cpu_exhausted",
            HealthIssue::MemoryExhausted => "memory_exhausted",
        }
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, HealthIssue::CpuExhausted | HealthIssue::MemoryExhausted)
    }
}

/// Result of checking one instance
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    pub instance_id: InstanceId,
    pub healthy: bool,
    pub issues: Vec<HealthIssue>,
    pub resources: ResourceUsage,
    pub checked_at: DateTime<Utc>,
}

/// Outcome of a scaling run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScaleReport {
    pub from: usize,
    pub to: usize,
    pub created: Vec<InstanceId>,
    pub removed: Vec<InstanceId>,
    /// Per-instance failures; scaling continues past them
    pub failures: Vec<String>,
}

impl ScaleReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of a rebalance run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebalanceReport {
    pub moved: Vec<PlannedMove>,
    pub failed: Vec<(PlannedMove, String)>,
}

/// Outcome of stopping every instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopReport {
    pub stopped: usize,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_follows_source_error() {
        let transient = FleetError::Runtime(RuntimeError::Timeout);
        assert!(transient.is_retryable());

        let bounds = FleetError::InvalidTarget {
            target: 12,
            min: 1,
            max: 10,
        };
        assert!(!bounds.is_retryable());
        assert_eq!(bounds.to_string(), "Scale target 12 outside [1, 10]");
    }

    #[test]
    fn test_resource_issues() {
        assert!(HealthIssue::CpuExhausted.is_resource());
        assert!(!HealthIssue::ApiUnreachable.is_resource());
    }
}
