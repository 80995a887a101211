//! Metric samples, anomalies, alerts and adjustments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::{ParamValue, Severity, StrategyId};

/// One metrics observation for a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub strategy_id: StrategyId,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub fill_rate: f64,
    pub slippage: f64,
    pub pnl: f64,
    pub error_count: u32,
    pub risk_exposure: f64,
    pub volume: f64,
    pub trades: u64,
    pub drawdown: f64,
}

impl MetricSample {
    /// Sample with neutral values, for building test and fallback data
    pub fn new(strategy_id: &str, latency_ms: f64, fill_rate: f64, slippage: f64) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            timestamp: Utc::now(),
            latency_ms,
            fill_rate,
            slippage,
            pnl: 0.0,
            error_count: 0,
            risk_exposure: 0.0,
            volume: 0.0,
            trades: 0,
            drawdown: 0.0,
        }
    }

    pub fn with_errors(mut self, error_count: u32) -> Self {
        self.error_count = error_count;
        self
    }
}

/// Bounded, append-only sample history; oldest samples are evicted first
#[derive(Debug, Clone)]
pub struct SampleHistory {
    samples: VecDeque<MetricSample>,
    capacity: usize,
}

impl SampleHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: MetricSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&MetricSample> {
        self.samples.back()
    }

    pub fn oldest(&self) -> Option<&MetricSample> {
        self.samples.front()
    }

    /// The last `n` samples, oldest first
    pub fn recent(&self, n: usize) -> Vec<&MetricSample> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricSample> {
        self.samples.iter()
    }
}

/// Relative-deviation anomaly types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    HighLatency,
    LowFillRate,
    HighSlippage,
    HighErrorRate,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::HighLatency => "high_latency",
            AnomalyKind::LowFillRate => "low_fill_rate",
            AnomalyKind::HighSlippage => "high_slippage",
            AnomalyKind::HighErrorRate => "high_error_rate",
        }
    }
}

/// A deviation from a strategy's own recent baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub strategy_id: StrategyId,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    pub threshold: f64,
    pub actual: f64,
    pub resolved: bool,
}

/// Absolute-threshold alert types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Latency,
    FillRate,
    Slippage,
    Errors,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Latency => "latency",
            AlertKind::FillRate => "fill_rate",
            AlertKind::Slippage => "slippage",
            AlertKind::Errors => "errors",
        }
    }
}

/// A threshold breach on the latest sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub strategy_id: StrategyId,
    pub kind: AlertKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub resolved: bool,
}

/// Adjustment actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    ParameterUpdate,
    Pause,
    Stop,
    Restart,
}

impl AdjustmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentKind::ParameterUpdate => "parameter_update",
            AdjustmentKind::Pause => "pause",
            AdjustmentKind::Stop => "stop",
            AdjustmentKind::Restart => "restart",
        }
    }
}

/// Audit record of an action taken against a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub strategy_id: StrategyId,
    pub kind: AdjustmentKind,
    pub parameters: Option<BTreeMap<String, ParamValue>>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub automatic: bool,
    pub succeeded: bool,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(i: usize) -> MetricSample {
        MetricSample::new("s1", i as f64, 0.9, 0.001)
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = SampleHistory::new(1000);
        for i in 0..1100 {
            history.push(sample(i));
        }

        assert_eq!(history.len(), 1000);
        assert_eq!(history.oldest().unwrap().latency_ms, 100.0);
        assert_eq!(history.latest().unwrap().latency_ms, 1099.0);
    }

    #[test]
    fn test_recent_is_oldest_first() {
        let mut history = SampleHistory::new(10);
        for i in 0..5 {
            history.push(sample(i));
        }

        let recent: Vec<f64> = history.recent(3).iter().map(|s| s.latency_ms).collect();
        assert_eq!(recent, vec![2.0, 3.0, 4.0]);
        assert_eq!(history.recent(50).len(), 5);
    }

    proptest! {
        #[test]
        fn prop_history_never_exceeds_capacity(capacity in 1usize..200, pushes in 0usize..600) {
            let mut history = SampleHistory::new(capacity);
            for i in 0..pushes {
                history.push(sample(i));
            }
            prop_assert_eq!(history.len(), pushes.min(capacity));
            if pushes > 0 {
                prop_assert_eq!(history.latest().unwrap().latency_ms, (pushes - 1) as f64);
            }
        }
    }
}
