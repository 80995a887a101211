//! Trigger decisions, plan construction and the run report

use botfleet_config::ShutdownConfig;
use botfleet_types::{
    short_id, Severity, ShutdownPlan, ShutdownReason, ShutdownStep, ShutdownStepKind,
    ShutdownTrigger, StepResult,
};
use chrono::Utc;
use std::fmt::Write;
use std::time::Duration;

/// Whether `reason` should start an automatic shutdown
pub fn should_trigger(reason: &ShutdownReason, config: &ShutdownConfig) -> bool {
    if !config.auto_shutdown_enabled {
        return false;
    }
    match reason.trigger {
        ShutdownTrigger::RiskViolation => config.trigger_on_risk_violation,
        ShutdownTrigger::SystemError => config.trigger_on_system_error,
        ShutdownTrigger::Manual => config.trigger_on_manual,
        ShutdownTrigger::PaperTradingDisabled => config.trigger_on_paper_trading_disabled,
    }
}

fn step(
    kind: ShutdownStepKind,
    priority: u8,
    retryable: bool,
    critical: bool,
    config: &ShutdownConfig,
) -> ShutdownStep {
    ShutdownStep {
        kind,
        name: kind.as_str().replace('_', " "),
        priority,
        timeout: Duration::from_secs(config.step_timeout_secs.max(1)),
        retryable,
        critical,
        max_attempts: if retryable { config.max_retries.max(1) } else { 1 },
    }
}

/// Steps for `reason`, sorted by priority. Instances are only stopped for
/// critical reasons.
pub fn build_plan(reason: &ShutdownReason, config: &ShutdownConfig) -> ShutdownPlan {
    use ShutdownStepKind::*;

    let mut steps = vec![
        step(Notify, 1, false, false, config),
        step(StopStrategies, 2, true, true, config),
        step(CancelOrders, 3, true, true, config),
        step(DisconnectInstances, 4, true, false, config),
        step(UpdateSafetyStatus, 6, false, true, config),
        step(GenerateReport, 7, false, false, config),
    ];
    if reason.severity == Severity::Critical {
        steps.push(step(StopInstances, 5, true, true, config));
    }
    steps.sort_by_key(|s| s.priority);

    ShutdownPlan {
        id: short_id("shutdown"),
        reason: reason.clone(),
        steps,
        created_at: Utc::now(),
    }
}

/// Plain-text summary of a run
pub fn render_report(plan: &ShutdownPlan, results: &[StepResult], simulated: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Emergency shutdown {}{}",
        plan.id,
        if simulated { " (simulated)" } else { "" }
    );
    let _ = writeln!(
        out,
        "reason: {} [{}] {}",
        plan.reason.trigger.as_str(),
        plan.reason.severity,
        plan.reason.description
    );
    let _ = writeln!(out, "initiated by: {}", plan.reason.initiated_by);

    for result in results {
        let _ = write!(
            out,
            "  {:<22} {} attempts={} {}ms",
            result.kind.as_str(),
            if result.success { "ok" } else { "FAILED" },
            result.attempts,
            result.duration.as_millis()
        );
        if let Some(detail) = &result.detail {
            let _ = write!(out, " - {}", detail);
        }
        if let Some(error) = &result.error {
            let _ = write!(out, " - {}", error);
        }
        out.push('\n');
    }

    let skipped = plan.steps.len().saturating_sub(results.len());
    if skipped > 0 {
        let _ = writeln!(out, "  {} step(s) not run", skipped);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(trigger: ShutdownTrigger, severity: Severity) -> ShutdownReason {
        ShutdownReason::new(trigger, severity, "drawdown limit breached")
    }

    #[test]
    fn test_trigger_flags() {
        let config = ShutdownConfig {
            trigger_on_manual: false,
            ..Default::default()
        };
        assert!(should_trigger(&reason(ShutdownTrigger::RiskViolation, Severity::High), &config));
        assert!(!should_trigger(&reason(ShutdownTrigger::Manual, Severity::Critical), &config));

        let disabled = ShutdownConfig {
            auto_shutdown_enabled: false,
            ..Default::default()
        };
        assert!(!should_trigger(&reason(ShutdownTrigger::SystemError, Severity::Critical), &disabled));
    }

    #[test]
    fn test_plan_order_without_instance_stop() {
        let plan = build_plan(&reason(ShutdownTrigger::RiskViolation, Severity::High), &ShutdownConfig::default());
        let kinds: Vec<ShutdownStepKind> = plan.steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ShutdownStepKind::Notify,
                ShutdownStepKind::StopStrategies,
                ShutdownStepKind::CancelOrders,
                ShutdownStepKind::DisconnectInstances,
                ShutdownStepKind::UpdateSafetyStatus,
                ShutdownStepKind::GenerateReport,
            ]
        );
    }

    #[test]
    fn test_critical_plan_stops_instances_after_disconnect() {
        let plan = build_plan(&reason(ShutdownTrigger::SystemError, Severity::Critical), &ShutdownConfig::default());
        assert_eq!(plan.steps.len(), 7);
        assert_eq!(plan.steps[4].kind, ShutdownStepKind::StopInstances);
        assert!(plan.steps.windows(2).all(|w| w[0].priority < w[1].priority));
    }

    #[test]
    fn test_non_retryable_steps_get_one_attempt() {
        let plan = build_plan(&reason(ShutdownTrigger::Manual, Severity::Low), &ShutdownConfig::default());
        let notify = &plan.steps[0];
        assert!(!notify.retryable);
        assert_eq!(notify.max_attempts, 1);
        assert_eq!(plan.steps[1].max_attempts, 3);
        assert_eq!(plan.steps[0].name, "notify");
        assert_eq!(plan.steps[1].name, "stop strategies");
    }

    #[test]
    fn test_report_lists_steps_and_skips() {
        let plan = build_plan(&reason(ShutdownTrigger::Manual, Severity::High), &ShutdownConfig::default());
        let results = vec![StepResult {
            kind: ShutdownStepKind::Notify,
            success: true,
            duration: Duration::from_millis(3),
            attempts: 1,
            error: None,
            detail: Some("operators notified".into()),
        }];

        let report = render_report(&plan, &results, true);
        assert!(report.contains("(simulated)"));
        assert!(report.contains("notify"));
        assert!(report.contains("operators notified"));
        assert!(report.contains("5 step(s) not run"));
    }
}
