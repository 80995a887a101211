//! Safety monitor

use crate::risk::{apply_penalty, assess};
use crate::{RiskAssessment, SafetyError, SafetyStatus, SafetyViolation, PAPER_TRADING_DISABLED};
use botfleet_bridge::{check_definition, BridgeRegistry};
use botfleet_config::{PlatformLimits, SafetyConfig};
use botfleet_metrics::SafetyMetrics;
use botfleet_types::{
    short_id, spawn_periodic, EventBus, FleetEvent, InstanceDirectory, Severity,
    StrategyDefinition, StrategyExecution, StrategyId,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const STARTING_SCORE: f64 = 100.0;

/// Safety monitor
pub struct SafetyMonitor {
    bridge: Arc<BridgeRegistry>,
    directory: Arc<dyn InstanceDirectory>,
    config: SafetyConfig,
    limits: PlatformLimits,
    paper_trading: AtomicBool,
    is_halted: AtomicBool,
    halt_reason: Mutex<Option<String>>,
    score: Mutex<f64>,
    violations: Mutex<VecDeque<SafetyViolation>>,
    /// Last assessed level per strategy; violations are recorded on escalation
    levels: DashMap<StrategyId, Severity>,
    events: EventBus,
    metrics: Arc<SafetyMetrics>,
}

impl SafetyMonitor {
    pub fn new(
        bridge: Arc<BridgeRegistry>,
        directory: Arc<dyn InstanceDirectory>,
        config: SafetyConfig,
        limits: PlatformLimits,
        events: EventBus,
        metrics: Arc<SafetyMetrics>,
    ) -> Self {
        info!("SAFETY: Risk gatekeeper online with limits: {:?}", limits);
        if !config.paper_trading_enabled {
            warn!("SAFETY: Paper trading disabled, every deployment will be rejected");
        }
        metrics.safety_score.set(STARTING_SCORE);

        Self {
            bridge,
            directory,
            paper_trading: AtomicBool::new(config.paper_trading_enabled),
            is_halted: AtomicBool::new(false),
            halt_reason: Mutex::new(None),
            score: Mutex::new(STARTING_SCORE),
            violations: Mutex::new(VecDeque::new()),
            levels: DashMap::new(),
            config,
            limits,
            events,
            metrics,
        }
    }

    // ========================================================================
    // Pre-deployment
    // ========================================================================

    /// Check a definition for deployment on `instance_id`.
    /// Returns the definition stamped for simulated execution.
    pub fn validate_deployment(
        &self,
        definition: &StrategyDefinition,
        instance_id: &str,
    ) -> Result<StrategyDefinition, SafetyError> {
        let result = self.check(definition, instance_id);
        if let Err(e) = &result {
            self.metrics.rejected_deployments.inc();
            warn!(
                strategy_id = %definition.id,
                instance_id,
                "SAFETY: Deployment rejected: {}",
                e
            );
        }
        result
    }

    fn check(
        &self,
        definition: &StrategyDefinition,
        instance_id: &str,
    ) -> Result<StrategyDefinition, SafetyError> {
        if self.is_halted.load(Ordering::SeqCst) {
            let reason = self
                .halt_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "emergency shutdown".to_string());
            return Err(SafetyError::Halted(reason));
        }
        if !self.paper_trading.load(Ordering::SeqCst) {
            return Err(SafetyError::PaperTradingDisabled);
        }

        // Flags are stamped below, so they are not required here
        let errors = check_definition(definition, &self.limits, false);
        if !errors.is_empty() {
            return Err(SafetyError::Validation(errors));
        }

        if !self.directory.is_instance_healthy(instance_id) {
            return Err(SafetyError::InstanceUnhealthy(instance_id.to_string()));
        }

        let mut stamped = definition.clone();
        stamped.execution.paper_trading = true;
        stamped.execution.simulation_mode = true;
        Ok(stamped)
    }

    /// Validate, then deploy through the bridge
    pub async fn deploy(
        &self,
        definition: &StrategyDefinition,
        instance_id: &str,
    ) -> Result<StrategyExecution, SafetyError> {
        let stamped = self.validate_deployment(definition, instance_id)?;
        Ok(self.bridge.deploy(instance_id, stamped).await?)
    }

    // ========================================================================
    // Live risk
    // ========================================================================

    /// Assess one execution; critical risk stops it immediately
    pub async fn monitor_execution(&self, execution: &StrategyExecution) -> RiskAssessment {
        let (level, reasons) = assess(&execution.performance, &self.config);
        let previous = self.levels.get(&execution.id).map(|l| *l);
        let escalated = level > previous;

        match level {
            Some(l) => {
                self.levels.insert(execution.id.clone(), l);
            }
            None => {
                self.levels.remove(&execution.id);
            }
        }

        if let (true, Some(severity)) = (escalated, level) {
            self.record_violation(
                Some(&execution.id),
                severity,
                &format!("risk level {}: {}", severity, reasons.join(", ")),
            );
        }

        let mut force_stopped = false;
        if level == Some(Severity::Critical) && execution.is_active() {
            force_stopped = self.force_stop(&execution.id, &reasons).await;
        }

        RiskAssessment {
            strategy_id: execution.id.clone(),
            level,
            reasons,
            escalated,
            force_stopped,
        }
    }

    async fn force_stop(&self, strategy_id: &str, reasons: &[String]) -> bool {
        let reason = format!("critical risk: {}", reasons.join(", "));
        match self.bridge.stop(strategy_id, &reason).await {
            Ok(()) => {
                error!(strategy_id, "SAFETY: Strategy force-stopped ({})", reason);
                self.metrics.force_stops.inc();
                self.events.publish(FleetEvent::StrategyForceStopped {
                    strategy_id: strategy_id.to_string(),
                    reason,
                });
                true
            }
            Err(e) => {
                error!(strategy_id, "SAFETY: Force stop failed: {}", e);
                false
            }
        }
    }

    /// Assess every active execution
    pub async fn monitor_all(&self) -> Vec<RiskAssessment> {
        let executions = self.bridge.executions();
        self.levels
            .retain(|id, _| executions.iter().any(|e| &e.id == id && e.is_active()));

        let mut assessments = Vec::new();
        for execution in executions.iter().filter(|e| e.is_active()) {
            assessments.push(self.monitor_execution(execution).await);
        }
        assessments
    }

    // ========================================================================
    // Score and violations
    // ========================================================================

    /// Log a violation and lower the score by its severity weight
    pub fn record_violation(
        &self,
        strategy_id: Option<&str>,
        severity: Severity,
        description: &str,
    ) -> SafetyViolation {
        let violation = SafetyViolation {
            id: short_id("violation"),
            strategy_id: strategy_id.map(str::to_string),
            severity,
            description: description.to_string(),
            timestamp: Utc::now(),
        };

        let score = {
            let mut score = self.score.lock();
            *score = apply_penalty(*score, severity, &self.config);
            *score
        };
        {
            let mut log = self.violations.lock();
            if log.len() >= self.config.violation_log_size.max(1) {
                log.pop_front();
            }
            log.push_back(violation.clone());
        }

        warn!(
            strategy_id = ?strategy_id,
            severity = %severity,
            score,
            "SAFETY: Violation: {}",
            description
        );
        self.metrics.safety_score.set(score);
        self.metrics
            .violations
            .with_label_values(&[severity.as_str()])
            .inc();
        self.events.publish(FleetEvent::SafetyViolation {
            violation_id: violation.id.clone(),
            strategy_id: violation.strategy_id.clone(),
            severity,
            description: violation.description.clone(),
        });
        violation
    }

    pub fn score(&self) -> f64 {
        *self.score.lock()
    }

    /// Violations, oldest first
    pub fn violations(&self) -> Vec<SafetyViolation> {
        self.violations.lock().iter().cloned().collect()
    }

    pub fn status(&self) -> SafetyStatus {
        SafetyStatus {
            score: self.score(),
            paper_trading_enabled: self.is_paper_trading(),
            halted: self.is_halted(),
            halt_reason: self.halt_reason.lock().clone(),
            violations: self.violations.lock().len(),
        }
    }

    // ========================================================================
    // Switches
    // ========================================================================

    pub fn is_paper_trading(&self) -> bool {
        self.paper_trading.load(Ordering::SeqCst)
    }

    /// Turning paper trading off is itself recorded as a violation
    pub fn set_paper_trading(&self, enabled: bool) {
        let was = self.paper_trading.swap(enabled, Ordering::SeqCst);
        if was == enabled {
            return;
        }
        if enabled {
            info!("SAFETY: Paper trading enabled");
        } else {
            self.record_violation(None, Severity::High, PAPER_TRADING_DISABLED);
        }
    }

    /// Reject every deployment until [`resume`](Self::resume)
    pub fn halt(&self, reason: &str) {
        error!("SAFETY: DEPLOYMENTS HALTED - {}", reason);
        *self.halt_reason.lock() = Some(reason.to_string());
        self.is_halted.store(true, Ordering::SeqCst);
        self.metrics.halted.set(1);
    }

    pub fn resume(&self) {
        info!("SAFETY: Resuming deployments");
        self.is_halted.store(false, Ordering::SeqCst);
        *self.halt_reason.lock() = None;
        self.metrics.halted.set(0);
    }

    pub fn is_halted(&self) -> bool {
        self.is_halted.load(Ordering::SeqCst)
    }

    pub fn spawn_monitor_loop(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let safety = self.clone();
        let period = Duration::from_secs(self.config.monitor_interval_secs.max(1));
        spawn_periodic("safety", period, shutdown, move || {
            let safety = safety.clone();
            async move {
                safety.monitor_all().await;
            }
        })
    }
}
