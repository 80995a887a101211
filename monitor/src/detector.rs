//! Baseline anomaly detection
//!
//! The baseline is the mean of the last `baseline_window` samples before the
//! newest one. Detection needs at least `min_baseline_samples` of them; the
//! error-rate check looks at the last `baseline_window` samples including the
//! newest.

use botfleet_config::MonitorConfig;
use botfleet_types::{AnomalyKind, MetricSample, SampleHistory, Severity};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// A condition flagged on the newest sample
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub threshold: f64,
    pub actual: f64,
}

pub fn severity_of(kind: AnomalyKind) -> Severity {
    match kind {
        AnomalyKind::HighLatency => Severity::High,
        AnomalyKind::LowFillRate => Severity::Medium,
        AnomalyKind::HighSlippage => Severity::High,
        AnomalyKind::HighErrorRate => Severity::Critical,
    }
}

fn finding(kind: AnomalyKind, threshold: f64, actual: f64) -> Finding {
    Finding {
        kind,
        severity: severity_of(kind),
        threshold,
        actual,
    }
}

fn mean(samples: &[&MetricSample], field: impl Fn(&MetricSample) -> f64) -> f64 {
    samples.iter().map(|s| field(s)).sum::<f64>() / samples.len() as f64
}

/// Evaluate the newest sample against the strategy's own baseline
pub fn detect(history: &SampleHistory, config: &MonitorConfig) -> Vec<Finding> {
    let Some(latest) = history.latest() else {
        return Vec::new();
    };
    let mut findings = Vec::new();

    let window = config.baseline_window.max(1);
    let with_latest = history.recent(window + 1);
    let baseline = &with_latest[..with_latest.len() - 1];
    let baseline = &baseline[baseline.len().saturating_sub(window)..];

    if baseline.len() >= config.min_baseline_samples.max(1) {
        let latency = mean(baseline, |s| s.latency_ms);
        let fill_rate = mean(baseline, |s| s.fill_rate);
        let slippage = mean(baseline, |s| s.slippage);

        let latency_limit = latency * config.latency_multiplier;
        if latency > 0.0 && latest.latency_ms > latency_limit {
            findings.push(finding(AnomalyKind::HighLatency, latency_limit, latest.latency_ms));
        }

        let fill_floor = fill_rate - config.fill_rate_deviation;
        if latest.fill_rate < fill_floor {
            findings.push(finding(AnomalyKind::LowFillRate, fill_floor, latest.fill_rate));
        }

        let slippage_limit = slippage * config.slippage_multiplier;
        if slippage > 0.0 && latest.slippage > slippage_limit {
            findings.push(finding(AnomalyKind::HighSlippage, slippage_limit, latest.slippage));
        }
    }

    let erroring = history
        .recent(window)
        .iter()
        .filter(|s| s.error_count > 0)
        .count();
    if erroring >= config.error_sample_threshold.max(1) {
        findings.push(finding(
            AnomalyKind::HighErrorRate,
            config.error_sample_threshold as f64,
            erroring as f64,
        ));
    }

    findings
}

/// How long a flagged kind stays quiet, by severity
pub fn cooldown(severity: Severity, config: &MonitorConfig) -> Duration {
    let secs = match severity {
        Severity::Low => config.cooldown_low_secs,
        Severity::Medium => config.cooldown_medium_secs,
        Severity::High => config.cooldown_high_secs,
        Severity::Critical => config.cooldown_critical_secs,
    };
    Duration::seconds(secs as i64)
}

/// Last time each anomaly kind was raised for one strategy
#[derive(Debug, Clone, Default)]
pub struct Cooldowns {
    raised: HashMap<AnomalyKind, DateTime<Utc>>,
}

impl Cooldowns {
    /// True when `finding` may be raised at `now`; records it if so
    pub fn admit(&mut self, finding: &Finding, now: DateTime<Utc>, config: &MonitorConfig) -> bool {
        if let Some(last) = self.raised.get(&finding.kind) {
            if now - *last < cooldown(finding.severity, config) {
                return false;
            }
        }
        self.raised.insert(finding.kind, now);
        true
    }
}
