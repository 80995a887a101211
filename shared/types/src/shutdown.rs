//! Emergency shutdown plans and results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Severity;

/// What caused a shutdown request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownTrigger {
    RiskViolation,
    SystemError,
    Manual,
    PaperTradingDisabled,
}

impl ShutdownTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownTrigger::RiskViolation => "risk_violation",
            ShutdownTrigger::SystemError => "system_error",
            ShutdownTrigger::Manual => "manual",
            ShutdownTrigger::PaperTradingDisabled => "paper_trading_disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownReason {
    pub trigger: ShutdownTrigger,
    pub severity: Severity,
    pub description: String,
    pub initiated_by: String,
}

impl ShutdownReason {
    pub fn new(trigger: ShutdownTrigger, severity: Severity, description: &str) -> Self {
        Self {
            trigger,
            severity,
            description: description.to_string(),
            initiated_by: "system".to_string(),
        }
    }

    pub fn initiated_by(mut self, who: &str) -> Self {
        self.initiated_by = who.to_string();
        self
    }
}

/// Shutdown steps in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownStepKind {
    Notify,
    StopStrategies,
    CancelOrders,
    DisconnectInstances,
    StopInstances,
    UpdateSafetyStatus,
    GenerateReport,
}

impl ShutdownStepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownStepKind::Notify => "notify",
            ShutdownStepKind::StopStrategies => "stop_strategies",
            ShutdownStepKind::CancelOrders => "cancel_orders",
            ShutdownStepKind::DisconnectInstances => "disconnect_instances",
            ShutdownStepKind::StopInstances => "stop_instances",
            ShutdownStepKind::UpdateSafetyStatus => "update_safety_status",
            ShutdownStepKind::GenerateReport => "generate_report",
        }
    }
}

impl std::fmt::Display for ShutdownStepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownStep {
    pub kind: ShutdownStepKind,
    pub name: String,
    /// Lower runs first
    pub priority: u8,
    pub timeout: Duration,
    pub retryable: bool,
    /// A failed critical step fails the whole plan
    pub critical: bool,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownPlan {
    pub id: String,
    pub reason: ShutdownReason,
    /// Sorted by priority
    pub steps: Vec<ShutdownStep>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub kind: ShutdownStepKind,
    pub success: bool,
    pub duration: Duration,
    pub attempts: u32,
    pub error: Option<String>,
    /// Step-specific summary, e.g. "stopped 4/5 strategies"
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownResult {
    pub plan_id: String,
    pub reason: ShutdownReason,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub steps: Vec<StepResult>,
    pub errors: Vec<String>,
    pub cancelled: bool,
    pub simulated: bool,
    pub report: Option<String>,
}

impl ShutdownResult {
    pub fn duration(&self) -> Duration {
        (self.completed_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Shutdown coordinator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "step")]
pub enum ShutdownState {
    Idle,
    Planning,
    Executing(ShutdownStepKind),
    Completed,
    Failed,
    Cancelled,
}

impl ShutdownState {
    pub fn is_active(&self) -> bool {
        matches!(self, ShutdownState::Planning | ShutdownState::Executing(_))
    }
}
