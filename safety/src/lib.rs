//! SAFETY - Risk gatekeeper
//!
//! Fleet-level deployments go through here before they reach a worker, and
//! anything that runs away gets stopped.
//!
//! # Responsibilities
//! - Fail-closed pre-deployment validation (paper trading, ceilings, target health)
//! - Risk levels from drawdown, fill rate and latency
//! - Forced stop on critical risk
//! - Rolling safety score and violation log
//! - Deployment halt after an emergency shutdown

pub mod monitor;
pub mod risk;

use botfleet_bridge::BridgeError;
use botfleet_types::{Retryable, Severity, StrategyId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use monitor::SafetyMonitor;
pub use risk::{assess, apply_penalty, weight_of};

/// Description of the violation recorded when paper trading is switched off
pub const PAPER_TRADING_DISABLED: &str = "paper trading disabled";

/// Safety errors
#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("Paper trading is disabled; live deployments are not allowed")]
    PaperTradingDisabled,

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Target instance is not healthy: {0}")]
    InstanceUnhealthy(String),

    #[error("Deployments halted: {0}")]
    Halted(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

impl Retryable for SafetyError {
    fn is_retryable(&self) -> bool {
        match self {
            SafetyError::Bridge(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// A recorded breach of the safety envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyViolation {
    pub id: String,
    pub strategy_id: Option<StrategyId>,
    pub severity: Severity,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// Risk of one execution at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    pub strategy_id: StrategyId,
    /// `None` when every measure is inside its threshold
    pub level: Option<Severity>,
    pub reasons: Vec<String>,
    /// The level rose since the previous assessment
    pub escalated: bool,
    pub force_stopped: bool,
}

/// Read-only snapshot of the safety state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub score: f64,
    pub paper_trading_enabled: bool,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub violations: usize,
}
