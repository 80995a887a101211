//! Strategy definitions and executions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{InstanceId, StrategyId};

/// Strategy kinds understood by the workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    PureMarketMaking,
    AvellanedaMarketMaking,
    CrossExchangeMarketMaking,
    Arbitrage,
    Twap,
    Grid,
}

impl StrategyKind {
    /// Name used by the worker wire format
    pub fn wire_name(&self) -> &'static str {
        match self {
            StrategyKind::PureMarketMaking => "pure_market_making",
            StrategyKind::AvellanedaMarketMaking => "avellaneda_market_making",
            StrategyKind::CrossExchangeMarketMaking => "cross_exchange_market_making",
            StrategyKind::Arbitrage => "arbitrage",
            StrategyKind::Twap => "twap",
            StrategyKind::Grid => "grid",
        }
    }
}

/// Opaque strategy parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Flag(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// Per-strategy risk limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Maximum position size in base units
    pub max_position_size: f64,
    /// Maximum loss per day in quote units
    pub max_daily_loss: f64,
    pub max_open_orders: u32,
    /// Maximum slippage as a fraction (0.01 = 1%)
    pub max_slippage: f64,
    pub max_leverage: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size: 1.0,
            max_daily_loss: 100.0,
            max_open_orders: 10,
            max_slippage: 0.005,
            max_leverage: 1.0,
        }
    }
}

/// Execution settings handed to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Seconds between order refreshes
    pub order_refresh_time: f64,
    pub order_amount: f64,
    pub paper_trading: bool,
    pub simulation_mode: bool,
    pub kill_switch_enabled: bool,
    /// Loss fraction that trips the worker-side kill switch
    pub kill_switch_rate: Option<f64>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            order_refresh_time: 30.0,
            order_amount: 0.01,
            paper_trading: false,
            simulation_mode: false,
            kill_switch_enabled: true,
            kill_switch_rate: Some(0.05),
        }
    }
}

impl ExecutionSettings {
    /// Both simulation flags are stamped
    pub fn is_simulated(&self) -> bool {
        self.paper_trading && self.simulation_mode
    }
}

/// Declarative description of what a worker should trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub id: StrategyId,
    pub name: String,
    pub kind: StrategyKind,
    pub exchange: String,
    pub trading_pair: String,
    pub parameters: BTreeMap<String, ParamValue>,
    pub risk_limits: RiskLimits,
    pub execution: ExecutionSettings,
}

impl StrategyDefinition {
    pub fn new(id: &str, kind: StrategyKind, exchange: &str, trading_pair: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            exchange: exchange.to_string(),
            trading_pair: trading_pair.to_string(),
            parameters: BTreeMap::new(),
            risk_limits: RiskLimits::default(),
            execution: ExecutionSettings::default(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_risk_limits(mut self, limits: RiskLimits) -> Self {
        self.risk_limits = limits;
        self
    }

    pub fn with_execution(mut self, execution: ExecutionSettings) -> Self {
        self.execution = execution;
        self
    }

    /// Copy of this definition moved to another exchange under a new identity
    pub fn relocated(&self, new_id: &str, exchange: &str) -> Self {
        let mut def = self.clone();
        def.id = new_id.to_string();
        def.exchange = exchange.to_string();
        def
    }
}

/// Execution status; `Stopped` and `Error` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Active,
    Paused,
    Stopped,
    Error,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Stopped | ExecutionStatus::Error)
    }
}

/// Live performance of a running strategy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub trades: u64,
    pub volume: f64,
    pub pnl: f64,
    pub latency_ms: f64,
    pub fill_rate: f64,
    /// Drawdown as a fraction of peak equity (0.2 = 20%)
    pub drawdown: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Runtime record of a deployed strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyExecution {
    pub id: StrategyId,
    pub definition: StrategyDefinition,
    pub instance_id: InstanceId,
    /// Strategy id assigned by the worker
    pub worker_strategy_id: String,
    pub status: ExecutionStatus,
    pub performance: PerformanceSnapshot,
    pub started_at: DateTime<Utc>,
}

impl StrategyExecution {
    pub fn is_active(&self) -> bool {
        self.status == ExecutionStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_builder() {
        let def = StrategyDefinition::new("s1", StrategyKind::PureMarketMaking, "binance", "BTC-USDT")
            .with_parameter("bid_spread", 0.001)
            .with_parameter("inventory_skew_enabled", true);

        assert_eq!(def.parameters.len(), 2);
        assert_eq!(def.parameters["bid_spread"].as_f64(), Some(0.001));
        assert!(!def.execution.is_simulated());
    }

    #[test]
    fn test_relocated_keeps_parameters() {
        let def = StrategyDefinition::new("s1", StrategyKind::Twap, "binance", "ETH-USDT")
            .with_parameter("side", "buy");
        let moved = def.relocated("s1-fo", "kraken");

        assert_eq!(moved.id, "s1-fo");
        assert_eq!(moved.exchange, "kraken");
        assert_eq!(moved.parameters, def.parameters);
    }

    #[test]
    fn test_param_value_untagged() {
        let json = r#"{"a": 1.5, "b": "x", "c": true}"#;
        let params: BTreeMap<String, ParamValue> = serde_json::from_str(json).unwrap();
        assert_eq!(params["a"], ParamValue::Number(1.5));
        assert_eq!(params["b"], ParamValue::Text("x".into()));
        assert_eq!(params["c"], ParamValue::Flag(true));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Stopped.is_terminal());
        assert!(ExecutionStatus::Error.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
    }
}
