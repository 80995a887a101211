//! Risk levels and score arithmetic

use botfleet_config::SafetyConfig;
use botfleet_types::{PerformanceSnapshot, Severity};

/// Risk level of a performance snapshot, with the reasons behind it.
///
/// Drawdown grades medium/high/critical; a fill-rate or latency breach lifts
/// the level to at least medium. Fill rate is only judged once trades exist.
pub fn assess(performance: &PerformanceSnapshot, config: &SafetyConfig) -> (Option<Severity>, Vec<String>) {
    let mut level = None;
    let mut reasons = Vec::new();

    let drawdown = performance.drawdown;
    let drawdown_level = if drawdown > config.drawdown_critical {
        Some(Severity::Critical)
    } else if drawdown > config.drawdown_high {
        Some(Severity::High)
    } else if drawdown > config.drawdown_medium {
        Some(Severity::Medium)
    } else {
        None
    };
    if let Some(severity) = drawdown_level {
        reasons.push(format!("drawdown {:.1}%", drawdown * 100.0));
        level = Some(severity);
    }

    if performance.trades > 0 && performance.fill_rate < config.min_fill_rate {
        reasons.push(format!(
            "fill rate {:.2} below {:.2}",
            performance.fill_rate, config.min_fill_rate
        ));
        level = level.max(Some(Severity::Medium));
    }

    if performance.latency_ms > config.max_latency_ms {
        reasons.push(format!(
            "latency {:.0}ms above {:.0}ms",
            performance.latency_ms, config.max_latency_ms
        ));
        level = level.max(Some(Severity::Medium));
    }

    (level, reasons)
}

pub fn weight_of(severity: Severity, config: &SafetyConfig) -> f64 {
    match severity {
        Severity::Low => config.weight_low,
        Severity::Medium => config.weight_medium,
        Severity::High => config.weight_high,
        Severity::Critical => config.weight_critical,
    }
}

/// Score after one violation; never below zero
pub fn apply_penalty(score: f64, severity: Severity, config: &SafetyConfig) -> f64 {
    (score - weight_of(severity, config)).max(0.0)
}
