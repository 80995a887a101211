//! Botfleet Types - Shared types for the strategy-worker fleet
//!
//! Data model shared by every component: instances, strategy definitions and
//! executions, metric samples, anomalies/alerts/adjustments, arbitrage
//! opportunities, shutdown plans, the event bus and the retry policy.

pub mod arbitrage;
pub mod events;
pub mod instance;
pub mod monitoring;
pub mod retry;
pub mod shutdown;
pub mod strategy;
pub mod tasks;

use serde::{Deserialize, Serialize};

pub use arbitrage::{ArbitrageOpportunity, OpportunityStatus};
pub use events::{EventBus, EventEnvelope, EventSink, FleetEvent, SinkError, SinkSubscription};
pub use instance::{Instance, InstanceConfig, InstanceDirectory, InstanceStatus, ResourceUsage};
pub use monitoring::{
    Adjustment, AdjustmentKind, Alert, AlertKind, Anomaly, AnomalyKind, MetricSample,
    SampleHistory,
};
pub use retry::{Attempted, Backoff, RetryPolicy, Retryable};
pub use shutdown::{
    ShutdownPlan, ShutdownReason, ShutdownResult, ShutdownState, ShutdownStep, ShutdownStepKind,
    ShutdownTrigger, StepResult,
};
pub use strategy::{
    ExecutionSettings, ExecutionStatus, ParamValue, PerformanceSnapshot, RiskLimits,
    StrategyDefinition, StrategyExecution, StrategyKind,
};
pub use tasks::spawn_periodic;

/// Instance identifier
pub type InstanceId = String;

/// Strategy identifier (platform side, stable across redeployments)
pub type StrategyId = String;

/// Severity shared by anomalies, alerts, violations and shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short random identifier with a prefix, e.g. `anomaly-3f2a9c1e`
pub fn short_id(prefix: &str) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &raw[..8])
}
