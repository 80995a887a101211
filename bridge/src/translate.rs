//! Definition checks and translation to the worker wire format

use botfleet_config::PlatformLimits;
use botfleet_connectors::{WorkerRiskLimits, WorkerStrategyConfig};
use botfleet_types::{ParamValue, StrategyDefinition};
use std::collections::BTreeMap;

/// Check a definition against the platform ceilings.
/// Returns every problem found; empty means the definition is deployable.
pub fn check_definition(
    definition: &StrategyDefinition,
    limits: &PlatformLimits,
    require_simulation: bool,
) -> Vec<String> {
    let mut errors = Vec::new();
    let risk = &definition.risk_limits;

    if definition.exchange.trim().is_empty() {
        errors.push("exchange is required".to_string());
    }
    if definition.trading_pair.trim().is_empty() {
        errors.push("trading pair is required".to_string());
    }

    if risk.max_position_size <= 0.0 {
        errors.push("max_position_size must be positive".to_string());
    } else if risk.max_position_size > limits.max_position_size {
        errors.push(format!(
            "max_position_size {} exceeds platform limit {}",
            risk.max_position_size, limits.max_position_size
        ));
    }
    if risk.max_daily_loss > limits.max_daily_loss {
        errors.push(format!(
            "max_daily_loss {} exceeds platform limit {}",
            risk.max_daily_loss, limits.max_daily_loss
        ));
    }
    if risk.max_open_orders > limits.max_open_orders {
        errors.push(format!(
            "max_open_orders {} exceeds platform limit {}",
            risk.max_open_orders, limits.max_open_orders
        ));
    }
    if risk.max_slippage > limits.max_slippage {
        errors.push(format!(
            "max_slippage {} exceeds platform limit {}",
            risk.max_slippage, limits.max_slippage
        ));
    }
    if risk.max_leverage > limits.max_leverage {
        errors.push(format!(
            "max_leverage {} exceeds platform limit {}",
            risk.max_leverage, limits.max_leverage
        ));
    }

    let execution = &definition.execution;
    if execution.order_amount <= 0.0 {
        errors.push("order_amount must be positive".to_string());
    } else if risk.max_position_size > 0.0 && execution.order_amount > risk.max_position_size {
        errors.push(format!(
            "order_amount {} exceeds max_position_size {}",
            execution.order_amount, risk.max_position_size
        ));
    }
    if execution.order_refresh_time <= 0.0 {
        errors.push("order_refresh_time must be positive".to_string());
    }
    if require_simulation && !execution.is_simulated() {
        errors.push("paper_trading and simulation_mode must both be enabled".to_string());
    }

    errors
}

/// Merge updated parameters into a definition.
/// `order_refresh_time` and `order_amount` update the execution settings.
pub fn merge_parameters(
    definition: &StrategyDefinition,
    updates: &BTreeMap<String, ParamValue>,
) -> StrategyDefinition {
    let mut merged = definition.clone();
    for (key, value) in updates {
        match (key.as_str(), value.as_f64()) {
            ("order_refresh_time", Some(v)) => merged.execution.order_refresh_time = v,
            ("order_amount", Some(v)) => merged.execution.order_amount = v,
            _ => {
                merged.parameters.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Translate an internal definition into the worker's strategy config
pub fn to_worker_config(definition: &StrategyDefinition) -> WorkerStrategyConfig {
    let risk = &definition.risk_limits;
    let execution = &definition.execution;

    WorkerStrategyConfig {
        strategy: definition.kind.wire_name().to_string(),
        name: definition.id.clone(),
        exchange: definition.exchange.to_lowercase(),
        market: definition.trading_pair.to_uppercase(),
        parameters: definition.parameters.clone(),
        risk_limits: WorkerRiskLimits {
            max_position_size: risk.max_position_size,
            max_daily_loss: risk.max_daily_loss,
            max_open_orders: risk.max_open_orders,
            max_slippage: risk.max_slippage,
            max_leverage: risk.max_leverage,
        },
        order_refresh_time: execution.order_refresh_time,
        order_amount: execution.order_amount,
        paper_trading: execution.paper_trading,
        simulation_mode: execution.simulation_mode,
        kill_switch_enabled: execution.kill_switch_enabled,
        kill_switch_rate: execution.kill_switch_rate,
    }
}
