//! Strategy monitor
//!
//! One session per monitored strategy. Stream events for a strategy are
//! handled by a single task, so its samples land in arrival order. Detection,
//! alerting and polling run as independent periodic passes over the sessions.

use crate::alerts::{AlertBook, AlertChanges};
use crate::detector::{detect, Cooldowns};
use crate::rules::{plan, PlannedAdjustment, RuleTable, Signal};
use crate::{MonitorError, StreamState};
use botfleet_bridge::{BridgeError, BridgeRegistry};
use botfleet_config::MonitorConfig;
use botfleet_connectors::{
    MetricsSubscription, StreamEvent, StreamFrame, StreamStatus, WorkerErrorEvent, WorkerMetrics,
};
use botfleet_metrics::MonitorMetrics;
use botfleet_types::{
    short_id, spawn_periodic, Adjustment, AdjustmentKind, Alert, Anomaly, EventBus, FleetEvent,
    InstanceId, MetricSample, ParamValue, PerformanceSnapshot, SampleHistory, Severity,
    StrategyDefinition, StrategyId,
};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Session {
    instance_id: InstanceId,
    definition: StrategyDefinition,
    state: StreamState,
    history: SampleHistory,
    cooldowns: Cooldowns,
    received: u64,
    /// Value of `received` at the last detection pass
    evaluated: u64,
    task: Option<JoinHandle<()>>,
}

fn sample_from(strategy_id: &str, metrics: &WorkerMetrics) -> MetricSample {
    MetricSample {
        strategy_id: strategy_id.to_string(),
        timestamp: Utc::now(),
        latency_ms: metrics.latency_ms,
        fill_rate: metrics.fill_rate,
        slippage: metrics.slippage,
        pnl: metrics.pnl,
        error_count: metrics.error_count,
        risk_exposure: metrics.risk_exposure,
        volume: metrics.volume,
        trades: metrics.trades,
        drawdown: metrics.drawdown,
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, capacity: usize) {
    if queue.len() >= capacity.max(1) {
        queue.pop_front();
    }
    queue.push_back(item);
}

/// Strategy monitor
pub struct StrategyMonitor {
    bridge: Arc<BridgeRegistry>,
    config: MonitorConfig,
    rules: RuleTable,
    sessions: DashMap<StrategyId, Session>,
    anomalies: Mutex<VecDeque<Anomaly>>,
    alerts: Mutex<AlertBook>,
    adjustments: Mutex<VecDeque<Adjustment>>,
    events: EventBus,
    metrics: Arc<MonitorMetrics>,
}

impl StrategyMonitor {
    pub fn new(
        bridge: Arc<BridgeRegistry>,
        config: MonitorConfig,
        events: EventBus,
        metrics: Arc<MonitorMetrics>,
    ) -> Self {
        info!("MONITOR: Initializing strategy monitor");
        info!(
            "MONITOR: Baseline window {} (min {}), auto-adjust {}",
            config.baseline_window, config.min_baseline_samples, config.auto_adjust
        );

        Self {
            bridge,
            rules: RuleTable::standard(config.refresh_time_multiplier),
            sessions: DashMap::new(),
            anomalies: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(AlertBook::new(config.history_size)),
            adjustments: Mutex::new(VecDeque::new()),
            config,
            events,
            metrics,
        }
    }

    pub fn with_rules(mut self, rules: RuleTable) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Start watching a deployed strategy. Idempotent; a strategy whose stream
    /// cannot be opened is still monitored in degraded (polling) mode.
    pub async fn start_monitoring(
        self: &Arc<Self>,
        strategy_id: &str,
        instance_id: &str,
        definition: StrategyDefinition,
    ) -> Result<StreamState, MonitorError> {
        if self.bridge.execution(strategy_id).is_none() {
            return Err(BridgeError::NotFound(strategy_id.to_string()).into());
        }

        match self.sessions.entry(strategy_id.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().state),
            Entry::Vacant(slot) => {
                slot.insert(Session {
                    instance_id: instance_id.to_string(),
                    definition,
                    state: StreamState::Degraded,
                    history: SampleHistory::new(self.config.history_size),
                    cooldowns: Cooldowns::default(),
                    received: 0,
                    evaluated: 0,
                    task: None,
                });
            }
        }
        self.metrics
            .monitored_strategies
            .set(self.sessions.len() as i64);

        let state = self.attach_stream(strategy_id).await;
        info!(
            strategy_id,
            instance_id,
            stream = state.as_str(),
            "MONITOR: Monitoring started"
        );
        Ok(state)
    }

    /// Stop watching a strategy; open alerts for it are resolved
    pub fn stop_monitoring(&self, strategy_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(strategy_id) else {
            return false;
        };
        if let Some(task) = session.task {
            task.abort();
        }

        let resolved = self.alerts.lock().resolve_strategy(strategy_id);
        for alert in resolved {
            self.events.publish(FleetEvent::AlertResolved {
                alert_id: alert.id,
                strategy_id: strategy_id.to_string(),
            });
        }

        self.metrics
            .stream_status
            .remove_label_values(&[strategy_id])
            .ok();
        self.metrics
            .monitored_strategies
            .set(self.sessions.len() as i64);
        info!(strategy_id, "MONITOR: Monitoring stopped");
        true
    }

    /// Point an existing session at a redeployed execution. History and
    /// cooldowns are kept; returns None when the strategy is not monitored.
    pub async fn rebind(
        self: &Arc<Self>,
        strategy_id: &str,
        instance_id: &str,
        definition: StrategyDefinition,
    ) -> Option<StreamState> {
        {
            let mut session = self.sessions.get_mut(strategy_id)?;
            session.instance_id = instance_id.to_string();
            session.definition = definition;
        }
        let state = self.attach_stream(strategy_id).await;
        debug!(strategy_id, instance_id, stream = state.as_str(), "session rebound");
        Some(state)
    }

    /// (Re)open the metrics stream of a session, replacing any previous one
    async fn attach_stream(self: &Arc<Self>, strategy_id: &str) -> StreamState {
        let subscription = self.bridge.subscribe_metrics(strategy_id).await;

        let Some(mut session) = self.sessions.get_mut(strategy_id) else {
            return StreamState::Degraded;
        };
        if let Some(previous) = session.task.take() {
            previous.abort();
        }
        session.state = match subscription {
            Ok(subscription) => {
                session.task = Some(self.spawn_ingest(strategy_id, subscription));
                StreamState::Connected
            }
            Err(e) => {
                warn!(strategy_id, "MONITOR: Metrics stream unavailable, polling: {}", e);
                StreamState::Degraded
            }
        };
        let state = session.state;
        drop(session);

        self.set_stream_gauge(strategy_id, state);
        state
    }

    fn spawn_ingest(
        self: &Arc<Self>,
        strategy_id: &str,
        mut subscription: MetricsSubscription,
    ) -> JoinHandle<()> {
        let monitor: Weak<Self> = Arc::downgrade(self);
        let strategy_id = strategy_id.to_string();

        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.handle_stream_event(&strategy_id, event).await;
            }
            subscription.close();
            if let Some(monitor) = monitor.upgrade() {
                monitor.set_stream_state(&strategy_id, StreamState::Degraded);
            }
            debug!(strategy_id = %strategy_id, "metrics stream ended");
        })
    }

    async fn handle_stream_event(self: &Arc<Self>, strategy_id: &str, event: StreamEvent) {
        match event {
            StreamEvent::Frame(StreamFrame::MetricsUpdate(metrics)) => {
                if let Err(e) = self.ingest(sample_from(strategy_id, &metrics)) {
                    debug!(strategy_id, "dropping sample: {}", e);
                }
            }
            StreamEvent::Frame(StreamFrame::Error(error)) => {
                self.handle_worker_error(strategy_id, error).await;
            }
            StreamEvent::Frame(StreamFrame::OrderUpdate(order)) => {
                debug!(strategy_id, order_id = %order.order_id, status = %order.status, "order update");
            }
            StreamEvent::Frame(StreamFrame::TradeUpdate(trade)) => {
                debug!(strategy_id, trade_id = %trade.trade_id, price = trade.price, "trade update");
            }
            StreamEvent::Status(StreamStatus::Connected) => {
                self.set_stream_state(strategy_id, StreamState::Connected);
            }
            StreamEvent::Status(StreamStatus::Connecting) => {}
            StreamEvent::Status(status) => {
                warn!(strategy_id, ?status, "MONITOR: Metrics stream degraded");
                self.set_stream_state(strategy_id, StreamState::Degraded);
            }
            StreamEvent::DecodeError(message) => {
                warn!(strategy_id, "MONITOR: Undecodable frame: {}", message);
            }
        }
    }

    fn set_stream_state(&self, strategy_id: &str, state: StreamState) {
        let changed = match self.sessions.get_mut(strategy_id) {
            Some(mut session) if session.state != state => {
                session.state = state;
                true
            }
            _ => false,
        };
        if changed {
            self.set_stream_gauge(strategy_id, state);
        }
    }

    fn set_stream_gauge(&self, strategy_id: &str, state: StreamState) {
        let value = match state {
            StreamState::Connected => 1,
            StreamState::Degraded => 0,
        };
        self.metrics
            .stream_status
            .with_label_values(&[strategy_id])
            .set(value);
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Append a sample and mirror it into the execution's performance record
    pub fn ingest(&self, sample: MetricSample) -> Result<(), MonitorError> {
        let strategy_id = sample.strategy_id.clone();
        let snapshot = PerformanceSnapshot {
            trades: sample.trades,
            volume: sample.volume,
            pnl: sample.pnl,
            latency_ms: sample.latency_ms,
            fill_rate: sample.fill_rate,
            drawdown: sample.drawdown,
            updated_at: Some(sample.timestamp),
        };

        {
            let mut session = self
                .sessions
                .get_mut(&strategy_id)
                .ok_or_else(|| MonitorError::NotMonitored(strategy_id.clone()))?;
            session.history.push(sample);
            session.received += 1;
        }

        self.bridge.record_performance(&strategy_id, snapshot);
        self.metrics.samples_ingested.inc();
        Ok(())
    }

    /// Poll worker metrics for sessions without a live stream; returns how
    /// many samples were collected. A session whose stream task has ended is
    /// resubscribed.
    pub async fn collect_metrics(self: &Arc<Self>) -> usize {
        let degraded: Vec<(StrategyId, bool)> = self
            .sessions
            .iter()
            .filter(|s| s.state == StreamState::Degraded)
            .map(|s| {
                let stream_gone = s.task.as_ref().map_or(true, |t| t.is_finished());
                (s.key().clone(), stream_gone)
            })
            .collect();

        let mut collected = 0;
        for (strategy_id, stream_gone) in degraded {
            match self.bridge.get_metrics(&strategy_id).await {
                Ok(metrics) => {
                    if self.ingest(sample_from(&strategy_id, &metrics)).is_ok() {
                        collected += 1;
                    }
                }
                Err(e) => {
                    debug!(strategy_id = %strategy_id, "metrics poll failed: {}", e);
                    continue;
                }
            }
            if stream_gone {
                self.attach_stream(&strategy_id).await;
            }
        }
        collected
    }

    // ========================================================================
    // Anomalies
    // ========================================================================

    /// Run detection on every session with new samples; returns the anomalies
    /// raised in this pass. Raised anomalies feed the adjustment rules.
    pub async fn run_anomaly_detection(self: &Arc<Self>) -> Vec<Anomaly> {
        let now = Utc::now();
        let mut raised = Vec::new();

        for strategy_id in self.monitored_strategies() {
            let found: Vec<Anomaly> = {
                let Some(mut guard) = self.sessions.get_mut(&strategy_id) else {
                    continue;
                };
                let session = &mut *guard;
                if session.received == session.evaluated {
                    continue;
                }
                session.evaluated = session.received;

                let mut found = Vec::new();
                for finding in detect(&session.history, &self.config) {
                    if !session.cooldowns.admit(&finding, now, &self.config) {
                        continue;
                    }
                    found.push(Anomaly {
                        id: short_id("anomaly"),
                        strategy_id: strategy_id.clone(),
                        kind: finding.kind,
                        severity: finding.severity,
                        detected_at: now,
                        threshold: finding.threshold,
                        actual: finding.actual,
                        resolved: false,
                    });
                }
                found
            };

            if found.is_empty() {
                continue;
            }

            for anomaly in &found {
                warn!(
                    strategy_id = %strategy_id,
                    kind = anomaly.kind.as_str(),
                    severity = %anomaly.severity,
                    threshold = anomaly.threshold,
                    actual = anomaly.actual,
                    "MONITOR: Anomaly detected"
                );
                self.metrics
                    .anomalies
                    .with_label_values(&[anomaly.kind.as_str(), anomaly.severity.as_str()])
                    .inc();
                push_bounded(
                    &mut *self.anomalies.lock(),
                    anomaly.clone(),
                    self.config.history_size,
                );
                self.events.publish(FleetEvent::AnomalyDetected {
                    anomaly: anomaly.clone(),
                });
            }

            if self.config.auto_adjust {
                let signals: Vec<Signal> = found
                    .iter()
                    .map(|a| Signal::Anomaly {
                        kind: a.kind,
                        severity: a.severity,
                    })
                    .collect();
                self.adjust_automatically(&strategy_id, &signals).await;
            }

            raised.extend(found);
        }

        raised
    }

    pub fn anomalies(&self, strategy_id: Option<&str>) -> Vec<Anomaly> {
        self.anomalies
            .lock()
            .iter()
            .filter(|a| strategy_id.map_or(true, |id| a.strategy_id == id))
            .cloned()
            .collect()
    }

    pub fn resolve_anomaly(&self, anomaly_id: &str) -> bool {
        match self
            .anomalies
            .lock()
            .iter_mut()
            .find(|a| a.id == anomaly_id && !a.resolved)
        {
            Some(anomaly) => {
                anomaly.resolved = true;
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Alerts
    // ========================================================================

    /// Evaluate the latest sample of every session against the thresholds
    pub fn run_alert_evaluation(&self) -> AlertChanges {
        let now = Utc::now();
        let mut changes = AlertChanges::default();

        for strategy_id in self.monitored_strategies() {
            let Some(latest) = self
                .sessions
                .get(&strategy_id)
                .and_then(|s| s.history.latest().cloned())
            else {
                continue;
            };

            let pass = self
                .alerts
                .lock()
                .evaluate(&strategy_id, &latest, &self.config, now);

            for alert in &pass.raised {
                warn!(
                    strategy_id = %strategy_id,
                    kind = alert.kind.as_str(),
                    severity = %alert.severity,
                    "MONITOR: Alert: {}",
                    alert.message
                );
                self.metrics
                    .alerts
                    .with_label_values(&[alert.kind.as_str(), alert.severity.as_str()])
                    .inc();
                self.events.publish(FleetEvent::AlertTriggered {
                    alert: alert.clone(),
                });
            }
            for alert in &pass.resolved {
                info!(strategy_id = %strategy_id, alert_id = %alert.id, "MONITOR: Alert resolved");
                self.events.publish(FleetEvent::AlertResolved {
                    alert_id: alert.id.clone(),
                    strategy_id: strategy_id.clone(),
                });
            }

            changes.raised.extend(pass.raised);
            changes.resolved.extend(pass.resolved);
        }

        changes
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().all()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().active()
    }

    pub fn acknowledge_alert(&self, alert_id: &str) -> bool {
        self.alerts.lock().acknowledge(alert_id)
    }

    pub fn resolve_alert(&self, alert_id: &str) -> bool {
        let resolved = self.alerts.lock().resolve(alert_id);
        match resolved {
            Some(alert) => {
                self.events.publish(FleetEvent::AlertResolved {
                    alert_id: alert.id,
                    strategy_id: alert.strategy_id,
                });
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Adjustments
    // ========================================================================

    /// React to an error frame pushed by the worker
    pub async fn handle_worker_error(self: &Arc<Self>, strategy_id: &str, error: WorkerErrorEvent) {
        warn!(
            strategy_id,
            severity = %error.severity,
            code = ?error.code,
            "MONITOR: Worker error: {}",
            error.message
        );
        self.events.publish(FleetEvent::MonitorError {
            strategy_id: strategy_id.to_string(),
            severity: error.severity,
            message: error.message.clone(),
        });

        if self.config.auto_adjust {
            self.adjust_automatically(strategy_id, &[Signal::WorkerError {
                severity: error.severity,
            }])
            .await;
        }
    }

    /// Apply the first matching rule; only active strategies are adjusted
    async fn adjust_automatically(
        self: &Arc<Self>,
        strategy_id: &str,
        signals: &[Signal],
    ) -> Option<Adjustment> {
        let rule = self.rules.select(signals)?.clone();

        let active = self
            .bridge
            .execution(strategy_id)
            .map(|e| e.is_active())
            .unwrap_or(false);
        if !active {
            debug!(strategy_id, rule = rule.name, "skipping adjustment, strategy not active");
            return None;
        }

        let definition = self.sessions.get(strategy_id)?.definition.clone();
        self.apply(strategy_id, plan(&rule, &definition), true)
            .await
            .ok()
    }

    /// Operator-requested adjustment
    pub async fn adjust(
        self: &Arc<Self>,
        strategy_id: &str,
        kind: AdjustmentKind,
        parameters: Option<BTreeMap<String, ParamValue>>,
        reason: &str,
    ) -> Result<Adjustment, MonitorError> {
        if !self.sessions.contains_key(strategy_id) {
            return Err(MonitorError::NotMonitored(strategy_id.to_string()));
        }
        let planned = PlannedAdjustment {
            kind,
            parameters,
            reason: reason.to_string(),
        };
        self.apply(strategy_id, planned, false).await
    }

    /// Execute through the bridge and record the outcome; failures are not retried
    async fn apply(
        self: &Arc<Self>,
        strategy_id: &str,
        planned: PlannedAdjustment,
        automatic: bool,
    ) -> Result<Adjustment, MonitorError> {
        let outcome = self.execute(strategy_id, &planned).await;

        let adjustment = Adjustment {
            strategy_id: strategy_id.to_string(),
            kind: planned.kind,
            parameters: planned.parameters,
            reason: planned.reason,
            timestamp: Utc::now(),
            automatic,
            succeeded: outcome.is_ok(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        };
        push_bounded(
            &mut *self.adjustments.lock(),
            adjustment.clone(),
            self.config.history_size,
        );
        let label = if adjustment.succeeded { "applied" } else { "failed" };
        self.metrics
            .adjustments
            .with_label_values(&[adjustment.kind.as_str(), label])
            .inc();

        match outcome {
            Ok(()) => {
                info!(
                    strategy_id,
                    kind = adjustment.kind.as_str(),
                    automatic,
                    "MONITOR: Adjustment applied ({})",
                    adjustment.reason
                );
                self.events.publish(FleetEvent::AdjustmentApplied {
                    adjustment: adjustment.clone(),
                });

                match adjustment.kind {
                    // Redeployed under a new worker id
                    AdjustmentKind::ParameterUpdate => {
                        self.attach_stream(strategy_id).await;
                    }
                    AdjustmentKind::Stop => {
                        self.stop_monitoring(strategy_id);
                    }
                    AdjustmentKind::Pause | AdjustmentKind::Restart => {}
                }
                Ok(adjustment)
            }
            Err(e) => {
                warn!(
                    strategy_id,
                    kind = adjustment.kind.as_str(),
                    "MONITOR: Adjustment failed: {}",
                    e
                );
                self.events.publish(FleetEvent::AdjustmentFailed {
                    adjustment: adjustment.clone(),
                });
                self.events.publish(FleetEvent::MonitorError {
                    strategy_id: strategy_id.to_string(),
                    severity: Severity::High,
                    message: format!("{} adjustment failed: {}", adjustment.kind.as_str(), e),
                });
                Err(e)
            }
        }
    }

    async fn execute(&self, strategy_id: &str, planned: &PlannedAdjustment) -> Result<(), MonitorError> {
        match planned.kind {
            AdjustmentKind::ParameterUpdate => {
                let parameters = planned
                    .parameters
                    .as_ref()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        MonitorError::InvalidAdjustment(
                            "parameter update without parameters".to_string(),
                        )
                    })?;
                let execution = self.bridge.modify(strategy_id, parameters).await?;
                if let Some(mut session) = self.sessions.get_mut(strategy_id) {
                    session.definition = execution.definition;
                }
            }
            AdjustmentKind::Pause => self.bridge.pause(strategy_id, &planned.reason).await?,
            AdjustmentKind::Stop => self.bridge.stop(strategy_id, &planned.reason).await?,
            AdjustmentKind::Restart => self.bridge.restart(strategy_id).await?,
        }
        Ok(())
    }

    pub fn adjustments(&self, strategy_id: Option<&str>) -> Vec<Adjustment> {
        self.adjustments
            .lock()
            .iter()
            .filter(|a| strategy_id.map_or(true, |id| a.strategy_id == id))
            .cloned()
            .collect()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_monitoring(&self, strategy_id: &str) -> bool {
        self.sessions.contains_key(strategy_id)
    }

    /// Monitored strategy ids, sorted
    pub fn monitored_strategies(&self) -> Vec<StrategyId> {
        let mut ids: Vec<StrategyId> = self.sessions.iter().map(|s| s.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn stream_state(&self, strategy_id: &str) -> Option<StreamState> {
        self.sessions.get(strategy_id).map(|s| s.state)
    }

    pub fn instance_of(&self, strategy_id: &str) -> Option<InstanceId> {
        self.sessions.get(strategy_id).map(|s| s.instance_id.clone())
    }

    /// Sample history, oldest first
    pub fn history(&self, strategy_id: &str) -> Vec<MetricSample> {
        self.sessions
            .get(strategy_id)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ========================================================================
    // Loops
    // ========================================================================

    pub fn spawn_anomaly_loop(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.clone();
        let period = Duration::from_secs(self.config.anomaly_interval_secs.max(1));
        spawn_periodic("anomaly_detection", period, shutdown, move || {
            let monitor = monitor.clone();
            async move {
                monitor.run_anomaly_detection().await;
            }
        })
    }

    pub fn spawn_alert_loop(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.clone();
        let period = Duration::from_secs(self.config.alert_interval_secs.max(1));
        spawn_periodic("alert_evaluation", period, shutdown, move || {
            let monitor = monitor.clone();
            async move {
                monitor.run_alert_evaluation();
            }
        })
    }

    pub fn spawn_collection_loop(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.clone();
        let period = Duration::from_secs(self.config.collection_interval_secs.max(1));
        spawn_periodic("metrics_collection", period, shutdown, move || {
            let monitor = monitor.clone();
            async move {
                monitor.collect_metrics().await;
            }
        })
    }
}
