//! COORDINATOR - Multi-exchange coordination
//!
//! Places strategies across exchanges, trades price discrepancies between
//! them and moves work off exchanges that stop answering.
//!
//! # Responsibilities
//! - Coordinate one logical strategy across several exchanges, all or nothing
//! - Detect arbitrage and execute it with re-validated, concurrently deployed legs
//! - Fail over legs to a healthy fallback exchange, or pause them
//! - Rebalance the portfolio toward target allocations

pub mod arbitrage;
pub mod coordinator;
pub mod rebalance;

use botfleet_bridge::BridgeError;
use botfleet_connectors::OracleError;
use botfleet_types::{InstanceId, StrategyDefinition, StrategyId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use arbitrage::{find_opportunities, leg_definitions, order_size, revalidate};
pub use coordinator::MultiExchangeCoordinator;
pub use rebalance::{plan_rebalance, OrderSide, RebalanceOrder};

/// Coordinator errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinatorError {
    #[error("Exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    #[error("Coordination failed: {0}")]
    Coordination(String),

    #[error("Opportunity rejected: {0}")]
    Rejected(String),

    #[error("No connected instance available")]
    NoInstance,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Market data error: {0}")]
    Oracle(#[from] OracleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossStatus {
    Active,
    /// At least one leg lost its exchange with nowhere to go
    Paused,
    Stopped,
    Failed,
}

/// One exchange's share of a cross-exchange strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyLeg {
    pub exchange: String,
    pub strategy_id: StrategyId,
    pub instance_id: InstanceId,
    pub definition: StrategyDefinition,
}

/// Aggregate record of a strategy spread over several exchanges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossExchangeStrategy {
    pub id: String,
    pub name: String,
    pub legs: Vec<StrategyLeg>,
    pub status: CrossStatus,
    pub created_at: DateTime<Utc>,
}

impl CrossExchangeStrategy {
    pub fn exchanges(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.legs.iter().map(|l| l.exchange.as_str()).collect();
        names.dedup();
        names
    }
}

/// What failover did with one leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FailoverAction {
    Migrated {
        cross_id: String,
        strategy_id: StrategyId,
        new_strategy_id: StrategyId,
        to: String,
    },
    Paused {
        cross_id: String,
        strategy_id: StrategyId,
    },
    Failed {
        cross_id: String,
        strategy_id: StrategyId,
        error: String,
    },
}
