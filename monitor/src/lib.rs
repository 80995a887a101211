//! MONITOR - Strategy performance monitor
//!
//! Subscribes to each strategy's live metrics stream, keeps a bounded sample
//! history and reacts to what it sees.
//!
//! # Responsibilities
//! - Ingest metric samples in arrival order (stream, with polling fallback)
//! - Baseline anomaly detection with severity-graded cooldowns
//! - Absolute-threshold alerts with suppression and auto-resolve
//! - Rule-driven automatic adjustments executed through the bridge

pub mod alerts;
pub mod detector;
pub mod monitor;
pub mod rules;

use botfleet_bridge::BridgeError;
use botfleet_types::Retryable;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use alerts::{breaches, AlertBook, AlertChanges, Breach};
pub use detector::{detect, Cooldowns, Finding};
pub use monitor::StrategyMonitor;
pub use rules::{AdjustmentRule, RuleAction, RuleTable, RuleTrigger, Signal};

/// Monitor errors
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Strategy not monitored: {0}")]
    NotMonitored(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Invalid adjustment: {0}")]
    InvalidAdjustment(String),
}

impl Retryable for MonitorError {
    fn is_retryable(&self) -> bool {
        match self {
            MonitorError::Bridge(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// State of a strategy's metrics stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Connected,
    /// Stream lost; samples come from polling
    Degraded,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Connected => "connected",
            StreamState::Degraded => "degraded",
        }
    }
}
