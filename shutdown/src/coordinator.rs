//! Emergency shutdown state machine

use crate::plan::{build_plan, render_report, should_trigger};
use crate::ShutdownError;
use botfleet_bridge::BridgeRegistry;
use botfleet_config::ShutdownConfig;
use botfleet_fleet::FleetManager;
use botfleet_metrics::ShutdownMetrics;
use botfleet_safety::SafetyMonitor;
use botfleet_types::{
    EventBus, FleetEvent, RetryPolicy, Retryable, Severity, ShutdownPlan, ShutdownReason,
    ShutdownResult, ShutdownState, ShutdownStep, ShutdownStepKind, ShutdownTrigger, StepResult,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

/// Clears the single-flight flag however the run ends
struct InFlight<'a> {
    flag: &'a AtomicBool,
    metrics: &'a ShutdownMetrics,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        self.metrics.in_progress.set(0);
    }
}

/// State of one run, readable after a force timeout
struct Run {
    plan: ShutdownPlan,
    simulated: bool,
    results: Mutex<Vec<StepResult>>,
    report: Mutex<Option<String>>,
}

/// Emergency shutdown coordinator
pub struct EmergencyShutdownCoordinator {
    bridge: Arc<BridgeRegistry>,
    fleet: Arc<FleetManager>,
    safety: Arc<SafetyMonitor>,
    config: ShutdownConfig,
    in_progress: AtomicBool,
    cancel_requested: AtomicBool,
    state: Mutex<ShutdownState>,
    current_plan: Mutex<Option<String>>,
    history: Mutex<VecDeque<ShutdownResult>>,
    events: EventBus,
    metrics: Arc<ShutdownMetrics>,
}

impl EmergencyShutdownCoordinator {
    pub fn new(
        bridge: Arc<BridgeRegistry>,
        fleet: Arc<FleetManager>,
        safety: Arc<SafetyMonitor>,
        config: ShutdownConfig,
        events: EventBus,
        metrics: Arc<ShutdownMetrics>,
    ) -> Self {
        info!(
            "SHUTDOWN: Armed (auto={}, force timeout {}s)",
            config.auto_shutdown_enabled, config.force_timeout_secs
        );
        Self {
            bridge,
            fleet,
            safety,
            config,
            in_progress: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            state: Mutex::new(ShutdownState::Idle),
            current_plan: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            events,
            metrics,
        }
    }

    pub fn should_trigger(&self, reason: &ShutdownReason) -> bool {
        should_trigger(reason, &self.config)
    }

    /// Shut the fleet down for `reason`
    pub async fn execute(&self, reason: ShutdownReason) -> Result<ShutdownResult, ShutdownError> {
        self.run(reason, false).await
    }

    /// Rehearse the full procedure; each step only sleeps
    pub async fn test(&self) -> Result<ShutdownResult, ShutdownError> {
        let reason = ShutdownReason::new(
            ShutdownTrigger::Manual,
            Severity::Critical,
            "shutdown procedure test",
        )
        .initiated_by("test");
        self.run(reason, true).await
    }

    /// Stop after the current step. Completed steps are not undone.
    pub fn cancel(&self) -> Result<(), ShutdownError> {
        let plan_id = {
            let mut state = self.state.lock();
            if !matches!(*state, ShutdownState::Executing(_)) {
                return Err(ShutdownError::NotExecuting);
            }
            *state = ShutdownState::Cancelled;
            self.cancel_requested.store(true, Ordering::SeqCst);
            self.current_plan.lock().clone().unwrap_or_default()
        };

        warn!(plan_id = %plan_id, "SHUTDOWN: Cancellation requested, stopping after current step");
        self.events.publish(FleetEvent::ShutdownCancelled { plan_id });
        Ok(())
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock()
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Past runs, oldest first
    pub fn history(&self) -> Vec<ShutdownResult> {
        self.history.lock().iter().cloned().collect()
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn run(&self, reason: ShutdownReason, simulated: bool) -> Result<ShutdownResult, ShutdownError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("SHUTDOWN: Request refused, already in progress");
            return Err(ShutdownError::AlreadyInProgress);
        }
        let _in_flight = InFlight {
            flag: &self.in_progress,
            metrics: &self.metrics,
        };
        self.metrics.in_progress.set(1);
        self.cancel_requested.store(false, Ordering::SeqCst);
        *self.state.lock() = ShutdownState::Planning;

        let plan = build_plan(&reason, &self.config);
        *self.current_plan.lock() = Some(plan.id.clone());
        if simulated {
            info!(plan_id = %plan.id, steps = plan.steps.len(), "SHUTDOWN: Rehearsing shutdown procedure");
        } else {
            error!(
                plan_id = %plan.id,
                trigger = reason.trigger.as_str(),
                severity = %reason.severity,
                "SHUTDOWN: EMERGENCY SHUTDOWN - {}",
                reason.description
            );
        }
        self.events.publish(FleetEvent::ShutdownInitiated {
            plan_id: plan.id.clone(),
            reason: reason.clone(),
            simulated,
        });

        let run = Run {
            plan,
            simulated,
            results: Mutex::new(Vec::new()),
            report: Mutex::new(None),
        };
        let started_at = Utc::now();
        let force = Duration::from_secs(self.config.force_timeout_secs.max(1));
        let timed_out = timeout(force, self.run_steps(&run)).await.is_err();
        if timed_out {
            error!(plan_id = %run.plan.id, "SHUTDOWN: Force timeout after {:?}, terminating", force);
        }

        let steps = run.results.lock().clone();
        let cancelled = self.cancel_requested.load(Ordering::SeqCst);
        let mut errors: Vec<String> = steps
            .iter()
            .filter_map(|s| s.error.as_ref().map(|e| format!("{}: {}", s.kind, e)))
            .collect();
        if timed_out {
            errors.push(format!("force timeout after {}s", force.as_secs()));
        }
        let success = !timed_out
            && !cancelled
            && steps.len() == run.plan.steps.len()
            && steps.iter().all(|s| s.success);

        let report = run
            .report
            .lock()
            .clone()
            .or_else(|| Some(render_report(&run.plan, &steps, simulated)));
        let result = ShutdownResult {
            plan_id: run.plan.id.clone(),
            reason,
            success,
            started_at,
            completed_at: Utc::now(),
            steps,
            errors,
            cancelled,
            simulated,
            report,
        };

        let final_state = if cancelled {
            ShutdownState::Cancelled
        } else if success {
            ShutdownState::Completed
        } else {
            ShutdownState::Failed
        };
        {
            let mut history = self.history.lock();
            if history.len() >= self.config.history_size.max(1) {
                history.pop_front();
            }
            history.push_back(result.clone());
        }
        // History is written first so a finished state always has its result
        *self.state.lock() = final_state;
        *self.current_plan.lock() = None;

        let outcome = match final_state {
            ShutdownState::Completed => "completed",
            ShutdownState::Cancelled => "cancelled",
            _ => "failed",
        };
        self.metrics.runs.with_label_values(&[outcome]).inc();

        info!(
            plan_id = %result.plan_id,
            success = result.success,
            duration_ms = result.duration().as_millis() as u64,
            "SHUTDOWN: Run {}",
            outcome
        );
        self.events.publish(FleetEvent::ShutdownCompleted {
            result: Box::new(result.clone()),
        });
        Ok(result)
    }

    async fn run_steps(&self, run: &Run) {
        for step in &run.plan.steps {
            if self.cancel_requested.load(Ordering::SeqCst) {
                info!(plan_id = %run.plan.id, "SHUTDOWN: Cancelled before {}", step.kind);
                break;
            }
            *self.state.lock() = ShutdownState::Executing(step.kind);

            let result = self.run_step(step, run).await;
            if !result.success {
                self.metrics
                    .step_failures
                    .with_label_values(&[step.kind.as_str()])
                    .inc();
                if step.critical {
                    error!(
                        plan_id = %run.plan.id,
                        step = step.kind.as_str(),
                        "SHUTDOWN: Critical step failed, continuing: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                } else {
                    warn!(
                        plan_id = %run.plan.id,
                        step = step.kind.as_str(),
                        "SHUTDOWN: Step failed: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            self.metrics
                .step_duration
                .with_label_values(&[step.kind.as_str()])
                .observe(result.duration.as_secs_f64());
            self.events.publish(FleetEvent::ShutdownStepCompleted {
                plan_id: run.plan.id.clone(),
                step: step.kind,
                success: result.success,
                attempts: result.attempts,
            });
            run.results.lock().push(result);
        }
    }

    async fn run_step(&self, step: &ShutdownStep, run: &Run) -> StepResult {
        let started = Instant::now();
        let policy = RetryPolicy::exponential(
            step.max_attempts,
            Duration::from_millis(self.config.retry_delay_ms),
            step.timeout,
        );

        let attempted = policy
            .execute(|attempt| async move {
                if attempt > 1 {
                    info!(step = step.kind.as_str(), attempt, "SHUTDOWN: Retrying step");
                }
                match timeout(step.timeout, self.perform(step.kind, run)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ShutdownError::StepTimeout(step.kind)),
                }
            })
            .await;

        let (success, detail, error) = match attempted.result {
            Ok(detail) => (true, Some(detail), None),
            Err(e) => (false, None, Some(e.to_string())),
        };
        StepResult {
            kind: step.kind,
            success,
            duration: started.elapsed(),
            attempts: attempted.attempts,
            error,
            detail,
        }
    }

    /// One attempt of one step; returns a short summary
    async fn perform(&self, kind: ShutdownStepKind, run: &Run) -> Result<String, ShutdownError> {
        if run.simulated {
            sleep(Duration::from_millis(self.config.simulated_step_delay_ms)).await;
            if kind == ShutdownStepKind::GenerateReport {
                let results = run.results.lock().clone();
                *run.report.lock() = Some(render_report(&run.plan, &results, true));
            }
            return Ok("simulated".to_string());
        }

        match kind {
            ShutdownStepKind::Notify => {
                let reason = &run.plan.reason;
                let message = format!(
                    "emergency shutdown ({}) by {}: {}",
                    reason.trigger.as_str(),
                    reason.initiated_by,
                    reason.description
                );
                error!(plan_id = %run.plan.id, "SHUTDOWN: Notifying operators: {}", message);
                self.events.publish(FleetEvent::OperatorNotified {
                    plan_id: run.plan.id.clone(),
                    severity: reason.severity,
                    message,
                });
                Ok("operator notification published".to_string())
            }
            ShutdownStepKind::StopStrategies => self.stop_strategies(&run.plan).await,
            ShutdownStepKind::CancelOrders => self.cancel_orders().await,
            ShutdownStepKind::DisconnectInstances => {
                let report = self.bridge.disconnect_all().await;
                if report.is_complete() {
                    Ok(format!("disconnected {} instances", report.disconnected))
                } else {
                    Err(ShutdownError::Step {
                        step: kind,
                        message: report.errors.join("; "),
                        retryable: true,
                    })
                }
            }
            ShutdownStepKind::StopInstances => {
                let report = self.fleet.stop_all_instances().await;
                if report.errors.is_empty() {
                    Ok(format!("stopped {} instances", report.stopped))
                } else {
                    Err(ShutdownError::Step {
                        step: kind,
                        message: report.errors.join("; "),
                        retryable: true,
                    })
                }
            }
            ShutdownStepKind::UpdateSafetyStatus => {
                self.safety.halt(&format!(
                    "emergency shutdown {}: {}",
                    run.plan.id, run.plan.reason.description
                ));
                Ok("deployments halted".to_string())
            }
            ShutdownStepKind::GenerateReport => {
                let results = run.results.lock().clone();
                let report = render_report(&run.plan, &results, false);
                info!(plan_id = %run.plan.id, "SHUTDOWN: Report\n{}", report);
                let lines = report.lines().count();
                *run.report.lock() = Some(report);
                Ok(format!("report generated ({} lines)", lines))
            }
        }
    }

    async fn stop_strategies(&self, plan: &ShutdownPlan) -> Result<String, ShutdownError> {
        let live: Vec<_> = self
            .bridge
            .executions()
            .into_iter()
            .filter(|e| !e.status.is_terminal())
            .collect();
        let total = live.len();
        let reason = format!("emergency shutdown: {}", plan.reason.description);

        let mut errors = Vec::new();
        let mut retryable = false;
        for execution in live {
            if let Err(e) = self.bridge.stop(&execution.id, &reason).await {
                retryable |= e.is_retryable();
                errors.push(format!("{}: {}", execution.id, e));
            }
        }

        if errors.is_empty() {
            Ok(format!("stopped {} strategies", total))
        } else {
            Err(ShutdownError::Step {
                step: ShutdownStepKind::StopStrategies,
                message: format!(
                    "stopped {}/{}: {}",
                    total - errors.len(),
                    total,
                    errors.join("; ")
                ),
                retryable,
            })
        }
    }

    async fn cancel_orders(&self) -> Result<String, ShutdownError> {
        let reachable: Vec<_> = self
            .bridge
            .executions()
            .into_iter()
            .filter(|e| self.bridge.is_connected(&e.instance_id))
            .collect();

        let mut cancelled = 0u32;
        let mut errors = Vec::new();
        let mut retryable = false;
        for execution in &reachable {
            match self.bridge.cancel_orders(&execution.id).await {
                Ok(n) => cancelled += n,
                Err(e) => {
                    retryable |= e.is_retryable();
                    errors.push(format!("{}: {}", execution.id, e));
                }
            }
        }

        if errors.is_empty() {
            Ok(format!(
                "cancelled {} orders across {} strategies",
                cancelled,
                reachable.len()
            ))
        } else {
            Err(ShutdownError::Step {
                step: ShutdownStepKind::CancelOrders,
                message: errors.join("; "),
                retryable,
            })
        }
    }
}
