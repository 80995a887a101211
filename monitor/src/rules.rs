//! Automatic adjustment rules
//!
//! Rules are checked in table order against the signals of one pass; the
//! first rule that matches any signal decides the single adjustment made for
//! that strategy.

use botfleet_types::{AdjustmentKind, AnomalyKind, ParamValue, Severity, StrategyDefinition};
use std::collections::BTreeMap;

/// Something observed about a strategy during a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Anomaly { kind: AnomalyKind, severity: Severity },
    WorkerError { severity: Severity },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTrigger {
    /// Any anomaly at critical severity
    CriticalAnomaly,
    /// An anomaly of one kind
    Anomaly(AnomalyKind),
    /// A worker error event at critical severity
    CriticalWorkerError,
}

impl RuleTrigger {
    pub fn matches(&self, signal: &Signal) -> bool {
        match (self, signal) {
            (RuleTrigger::CriticalAnomaly, Signal::Anomaly { severity, .. }) => {
                *severity == Severity::Critical
            }
            (RuleTrigger::Anomaly(want), Signal::Anomaly { kind, .. }) => want == kind,
            (RuleTrigger::CriticalWorkerError, Signal::WorkerError { severity }) => {
                *severity == Severity::Critical
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleAction {
    Pause,
    Stop,
    Restart,
    /// Multiply the order refresh interval
    ScaleOrderRefresh(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdjustmentRule {
    pub name: &'static str,
    pub trigger: RuleTrigger,
    pub action: RuleAction,
}

/// A concrete adjustment derived from a rule
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAdjustment {
    pub kind: AdjustmentKind,
    pub parameters: Option<BTreeMap<String, ParamValue>>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleTable {
    rules: Vec<AdjustmentRule>,
}

impl RuleTable {
    pub fn new(rules: Vec<AdjustmentRule>) -> Self {
        Self { rules }
    }

    /// Pause on critical anomalies, slow down on latency, stop on critical worker errors
    pub fn standard(refresh_time_multiplier: f64) -> Self {
        Self::new(vec![
            AdjustmentRule {
                name: "critical_anomaly",
                trigger: RuleTrigger::CriticalAnomaly,
                action: RuleAction::Pause,
            },
            AdjustmentRule {
                name: "high_latency",
                trigger: RuleTrigger::Anomaly(AnomalyKind::HighLatency),
                action: RuleAction::ScaleOrderRefresh(refresh_time_multiplier),
            },
            AdjustmentRule {
                name: "critical_worker_error",
                trigger: RuleTrigger::CriticalWorkerError,
                action: RuleAction::Stop,
            },
        ])
    }

    pub fn rules(&self) -> &[AdjustmentRule] {
        &self.rules
    }

    /// First rule, in table order, matched by any of `signals`
    pub fn select(&self, signals: &[Signal]) -> Option<&AdjustmentRule> {
        self.rules
            .iter()
            .find(|rule| signals.iter().any(|s| rule.trigger.matches(s)))
    }
}

/// Turn a rule into the adjustment to apply to `definition`
pub fn plan(rule: &AdjustmentRule, definition: &StrategyDefinition) -> PlannedAdjustment {
    let reason = format!("rule {}", rule.name);
    match rule.action {
        RuleAction::Pause => PlannedAdjustment {
            kind: AdjustmentKind::Pause,
            parameters: None,
            reason,
        },
        RuleAction::Stop => PlannedAdjustment {
            kind: AdjustmentKind::Stop,
            parameters: None,
            reason,
        },
        RuleAction::Restart => PlannedAdjustment {
            kind: AdjustmentKind::Restart,
            parameters: None,
            reason,
        },
        RuleAction::ScaleOrderRefresh(factor) => {
            let refresh = definition.execution.order_refresh_time * factor;
            let mut parameters = BTreeMap::new();
            parameters.insert("order_refresh_time".to_string(), ParamValue::Number(refresh));
            PlannedAdjustment {
                kind: AdjustmentKind::ParameterUpdate,
                parameters: Some(parameters),
                reason,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botfleet_types::StrategyKind;

    fn anomaly(kind: AnomalyKind, severity: Severity) -> Signal {
        Signal::Anomaly { kind, severity }
    }

    #[test]
    fn test_critical_anomaly_wins_over_latency() {
        let table = RuleTable::standard(1.5);
        let signals = [
            anomaly(AnomalyKind::HighLatency, Severity::High),
            anomaly(AnomalyKind::HighErrorRate, Severity::Critical),
        ];
        assert_eq!(table.select(&signals).map(|r| r.action), Some(RuleAction::Pause));
    }

    #[test]
    fn test_latency_scales_refresh_time() {
        let table = RuleTable::standard(1.5);
        let rule = table
            .select(&[anomaly(AnomalyKind::HighLatency, Severity::High)])
            .unwrap();
        let def = StrategyDefinition::new("s1", StrategyKind::Grid, "binance", "BTC-USDT");

        let planned = plan(rule, &def);
        assert_eq!(planned.kind, AdjustmentKind::ParameterUpdate);
        assert_eq!(
            planned.parameters.unwrap()["order_refresh_time"].as_f64(),
            Some(45.0)
        );
    }

    #[test]
    fn test_unmatched_signals_select_nothing() {
        let table = RuleTable::standard(1.5);
        assert!(table
            .select(&[anomaly(AnomalyKind::LowFillRate, Severity::Medium)])
            .is_none());
        assert!(table
            .select(&[Signal::WorkerError { severity: Severity::High }])
            .is_none());
        assert_eq!(
            table
                .select(&[Signal::WorkerError { severity: Severity::Critical }])
                .map(|r| r.action),
            Some(RuleAction::Stop)
        );
    }

    #[test]
    fn test_custom_table_order_is_respected() {
        let table = RuleTable::new(vec![
            AdjustmentRule {
                name: "restart_on_latency",
                trigger: RuleTrigger::Anomaly(AnomalyKind::HighLatency),
                action: RuleAction::Restart,
            },
            AdjustmentRule {
                name: "critical_anomaly",
                trigger: RuleTrigger::CriticalAnomaly,
                action: RuleAction::Pause,
            },
        ]);
        let signals = [
            anomaly(AnomalyKind::HighErrorRate, Severity::Critical),
            anomaly(AnomalyKind::HighLatency, Severity::High),
        ];
        assert_eq!(table.select(&signals).map(|r| r.name), Some("restart_on_latency"));
    }
}
