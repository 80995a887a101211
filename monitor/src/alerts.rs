//! Absolute-threshold alerts
//!
//! An unresolved alert of a kind suppresses re-raising that kind for the
//! same strategy; it resolves on its own once the latest sample is back
//! inside the threshold.

use botfleet_config::MonitorConfig;
use botfleet_types::{short_id, Alert, AlertKind, MetricSample, Severity, StrategyId};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// A threshold crossed by one sample
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub kind: AlertKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

/// Thresholds crossed by `sample`, in a fixed kind order
pub fn breaches(sample: &MetricSample, config: &MonitorConfig) -> Vec<Breach> {
    let mut out = Vec::new();

    if sample.latency_ms > config.max_latency_ms {
        let severity = if sample.latency_ms > config.max_latency_ms * 2.0 {
            Severity::High
        } else {
            Severity::Medium
        };
        out.push(Breach {
            kind: AlertKind::Latency,
            severity,
            title: "High latency".to_string(),
            message: format!(
                "latency {:.0}ms above {:.0}ms",
                sample.latency_ms, config.max_latency_ms
            ),
        });
    }

    if sample.fill_rate < config.min_fill_rate {
        out.push(Breach {
            kind: AlertKind::FillRate,
            severity: Severity::Medium,
            title: "Low fill rate".to_string(),
            message: format!(
                "fill rate {:.2} below {:.2}",
                sample.fill_rate, config.min_fill_rate
            ),
        });
    }

    if sample.slippage > config.max_slippage {
        out.push(Breach {
            kind: AlertKind::Slippage,
            severity: Severity::High,
            title: "High slippage".to_string(),
            message: format!(
                "slippage {:.4} above {:.4}",
                sample.slippage, config.max_slippage
            ),
        });
    }

    if sample.error_count > 0 {
        out.push(Breach {
            kind: AlertKind::Errors,
            severity: Severity::High,
            title: "Worker errors".to_string(),
            message: format!("{} errors reported", sample.error_count),
        });
    }

    out
}

/// What one evaluation changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertChanges {
    pub raised: Vec<Alert>,
    pub resolved: Vec<Alert>,
}

/// Alerts across all strategies, oldest first
#[derive(Debug, Default)]
pub struct AlertBook {
    alerts: VecDeque<Alert>,
    capacity: usize,
}

impl AlertBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            alerts: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn open_mut(&mut self, strategy_id: &str, kind: AlertKind) -> Option<&mut Alert> {
        self.alerts
            .iter_mut()
            .find(|a| !a.resolved && a.strategy_id == strategy_id && a.kind == kind)
    }

    fn push(&mut self, alert: Alert) {
        if self.alerts.len() >= self.capacity {
            // Drop the oldest resolved alert first, open ones only when nothing else is left
            match self.alerts.iter().position(|a| a.resolved) {
                Some(pos) => {
                    self.alerts.remove(pos);
                }
                None => {
                    self.alerts.pop_front();
                }
            }
        }
        self.alerts.push_back(alert);
    }

    /// Raise new breaches and auto-resolve cleared ones for `strategy_id`
    pub fn evaluate(
        &mut self,
        strategy_id: &StrategyId,
        sample: &MetricSample,
        config: &MonitorConfig,
        now: DateTime<Utc>,
    ) -> AlertChanges {
        let current = breaches(sample, config);
        let mut changes = AlertChanges::default();

        for kind in [
            AlertKind::Latency,
            AlertKind::FillRate,
            AlertKind::Slippage,
            AlertKind::Errors,
        ] {
            let breach = current.iter().find(|b| b.kind == kind);
            match (breach, self.open_mut(strategy_id, kind)) {
                (Some(_), Some(_)) => {}
                (Some(breach), None) => {
                    let alert = Alert {
                        id: short_id("alert"),
                        strategy_id: strategy_id.clone(),
                        kind,
                        severity: breach.severity,
                        title: breach.title.clone(),
                        message: breach.message.clone(),
                        triggered_at: now,
                        acknowledged: false,
                        resolved: false,
                    };
                    self.push(alert.clone());
                    changes.raised.push(alert);
                }
                (None, Some(open)) => {
                    open.resolved = true;
                    changes.resolved.push(open.clone());
                }
                (None, None) => {}
            }
        }

        changes
    }

    pub fn acknowledge(&mut self, alert_id: &str) -> bool {
        match self.alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Resolve by hand; returns the alert when it was open
    pub fn resolve(&mut self, alert_id: &str) -> Option<Alert> {
        let alert = self
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id && !a.resolved)?;
        alert.resolved = true;
        Some(alert.clone())
    }

    /// Close every open alert of a strategy that is no longer watched
    pub fn resolve_strategy(&mut self, strategy_id: &str) -> Vec<Alert> {
        self.alerts
            .iter_mut()
            .filter(|a| !a.resolved && a.strategy_id == strategy_id)
            .map(|a| {
                a.resolved = true;
                a.clone()
            })
            .collect()
    }

    pub fn all(&self) -> Vec<Alert> {
        self.alerts.iter().cloned().collect()
    }

    pub fn active(&self) -> Vec<Alert> {
        self.alerts.iter().filter(|a| !a.resolved).cloned().collect()
    }
}
