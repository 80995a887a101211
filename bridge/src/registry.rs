//! Bridge registry - connections and strategy executions

use botfleet_config::{BackoffKind, BridgeConfig, PlatformLimits};
use botfleet_connectors::{
    MetricsSubscription, WorkerApi, WorkerEndpoint, WorkerError, WorkerMetrics,
    WorkerStrategyConfig,
};
use botfleet_metrics::BridgeMetrics;
use botfleet_types::{
    EventBus, ExecutionStatus, FleetEvent, InstanceId, ParamValue, PerformanceSnapshot,
    RetryPolicy, StrategyDefinition, StrategyExecution, StrategyId,
};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::translate::{check_definition, merge_parameters, to_worker_config};
use crate::BridgeError;

/// Retry policy described by the bridge configuration
pub fn retry_policy(config: &BridgeConfig) -> RetryPolicy {
    let delay = Duration::from_millis(config.retry_delay_ms);
    match config.backoff {
        BackoffKind::Fixed => RetryPolicy::fixed(config.retry_attempts, delay),
        BackoffKind::Exponential => RetryPolicy::exponential(
            config.retry_attempts,
            delay,
            Duration::from_millis(config.max_retry_delay_ms),
        ),
    }
}

/// Outcome of disconnecting every instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisconnectReport {
    pub disconnected: usize,
    pub errors: Vec<String>,
}

impl DisconnectReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Capacity slot held while a connection is being established
struct SlotGuard<'a> {
    slots: &'a AtomicUsize,
    committed: bool,
}

impl SlotGuard<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.slots.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Strategy id held for the length of one deployment
struct DeployGuard<'a> {
    deploying: &'a DashMap<StrategyId, ()>,
    strategy_id: StrategyId,
}

impl Drop for DeployGuard<'_> {
    fn drop(&mut self) {
        self.deploying.remove(&self.strategy_id);
    }
}

/// Registry of worker connections and the strategies deployed through them
pub struct BridgeRegistry {
    worker: Arc<dyn WorkerApi>,
    config: BridgeConfig,
    limits: PlatformLimits,
    retry: RetryPolicy,
    connections: DashMap<InstanceId, Arc<Connection>>,
    connect_locks: DashMap<InstanceId, Arc<AsyncMutex<()>>>,
    /// Open connections plus connects in flight
    slots: AtomicUsize,
    executions: DashMap<StrategyId, StrategyExecution>,
    /// Ids with a deployment in flight
    deploying: DashMap<StrategyId, ()>,
    events: EventBus,
    metrics: Arc<BridgeMetrics>,
}

impl BridgeRegistry {
    pub fn new(
        worker: Arc<dyn WorkerApi>,
        config: BridgeConfig,
        limits: PlatformLimits,
        events: EventBus,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        tracing::info!(
            "BRIDGE: Initialized (max {} connections, {} attempts)",
            config.max_connections,
            config.retry_attempts
        );
        Self {
            worker,
            retry: retry_policy(&config),
            config,
            limits,
            connections: DashMap::new(),
            connect_locks: DashMap::new(),
            slots: AtomicUsize::new(0),
            executions: DashMap::new(),
            deploying: DashMap::new(),
            events,
            metrics,
        }
    }

    /// Override the retry policy from the configuration
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn limits(&self) -> &PlatformLimits {
        &self.limits
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Connect to an instance. Returns the existing connection without
    /// probing when one is already live.
    pub async fn connect(
        &self,
        instance_id: &str,
        endpoint: WorkerEndpoint,
    ) -> Result<Arc<Connection>, BridgeError> {
        if let Some(existing) = self.live_connection(instance_id) {
            return Ok(existing);
        }

        let lock = self
            .connect_locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _connecting = lock.lock().await;

        if let Some(existing) = self.live_connection(instance_id) {
            return Ok(existing);
        }

        // A failed connection is replaced in place
        if self.connections.remove(instance_id).is_some() {
            self.slots.fetch_sub(1, Ordering::SeqCst);
            debug!(instance_id, "replacing failed connection");
        }

        let slot = self.reserve_slot()?;
        let probed = timeout(self.config.connect_timeout(), self.probe(&endpoint)).await;

        match probed {
            Ok(Ok(supported)) => {
                let connection = Arc::new(Connection::new(instance_id, endpoint, supported, 1));
                self.connections
                    .insert(instance_id.to_string(), connection.clone());
                slot.commit();
                self.metrics
                    .connections
                    .set(self.slots.load(Ordering::SeqCst) as i64);
                info!(instance_id, "BRIDGE: Connected to worker");
                Ok(connection)
            }
            Ok(Err(e)) => {
                warn!(instance_id, "BRIDGE: Connect failed: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!(instance_id, "BRIDGE: Connect timed out");
                Err(BridgeError::Timeout(format!("connecting to {}", instance_id)))
            }
        }
    }

    fn reserve_slot(&self) -> Result<SlotGuard<'_>, BridgeError> {
        let max = self.config.max_connections;
        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                (open < max).then_some(open + 1)
            })
            .map_err(BridgeError::Capacity)?;
        Ok(SlotGuard {
            slots: &self.slots,
            committed: false,
        })
    }

    /// Single readiness probe: health, then the supported templates
    async fn probe(&self, endpoint: &WorkerEndpoint) -> Result<Vec<String>, BridgeError> {
        let health = self.worker.health(endpoint).await?;
        if !health.is_healthy() {
            return Err(BridgeError::Connection(format!(
                "worker reported status {}",
                health.status
            )));
        }

        match self.worker.detailed_health(endpoint).await {
            Ok(detail) => Ok(detail.supported_strategies),
            Err(e) => {
                debug!("detailed health unavailable: {}", e);
                Ok(Vec::new())
            }
        }
    }

    /// Ping a connected worker; returns the round-trip time
    pub async fn ping(&self, instance_id: &str) -> Result<Duration, BridgeError> {
        let connection = self
            .connection(instance_id)
            .ok_or_else(|| BridgeError::NotConnected(instance_id.to_string()))?;

        let started = Instant::now();
        let outcome = timeout(
            self.config.request_timeout(),
            self.worker.health(&connection.endpoint),
        )
        .await;

        let error = match outcome {
            Ok(Ok(report)) if report.is_healthy() => {
                connection.record_ping_success();
                return Ok(started.elapsed());
            }
            Ok(Ok(report)) => BridgeError::Connection(format!("worker reported status {}", report.status)),
            Ok(Err(e)) => e.into(),
            Err(_) => BridgeError::Timeout(format!("ping {}", instance_id)),
        };

        let status = connection.record_ping_failure();
        warn!(instance_id, status = status.as_str(), "BRIDGE: Ping failed: {}", error);
        Err(error)
    }

    /// Connection in any status
    pub fn connection(&self, instance_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(instance_id).map(|c| c.value().clone())
    }

    fn live_connection(&self, instance_id: &str) -> Option<Arc<Connection>> {
        self.connection(instance_id)
            .filter(|c| c.status().is_live())
    }

    pub fn is_connected(&self, instance_id: &str) -> bool {
        self.live_connection(instance_id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn endpoint_for(&self, instance_id: &str) -> Result<WorkerEndpoint, BridgeError> {
        self.live_connection(instance_id)
            .map(|c| c.endpoint.clone())
            .ok_or_else(|| BridgeError::NotConnected(instance_id.to_string()))
    }

    /// Drop the connection to an instance. Strategies still active on it are
    /// stopped first; the connection is removed even when that fails.
    pub async fn disconnect(&self, instance_id: &str) -> Result<(), BridgeError> {
        let Some((_, connection)) = self.connections.remove(instance_id) else {
            return Err(BridgeError::NotConnected(instance_id.to_string()));
        };
        self.slots.fetch_sub(1, Ordering::SeqCst);
        self.connect_locks.remove(instance_id);
        connection.mark_failed();
        self.metrics
            .connections
            .set(self.slots.load(Ordering::SeqCst) as i64);

        let mut errors = Vec::new();
        for execution in self.executions_on(instance_id) {
            if execution.status != ExecutionStatus::Active {
                continue;
            }
            let stopped = timeout(
                self.config.request_timeout(),
                self.worker
                    .stop_strategy(&connection.endpoint, &execution.worker_strategy_id),
            )
            .await;
            match stopped {
                Ok(Ok(())) => self.set_status(&execution.id, ExecutionStatus::Stopped),
                Ok(Err(e)) => {
                    self.set_status(&execution.id, ExecutionStatus::Error);
                    errors.push(format!("{}: {}", execution.id, e));
                }
                Err(_) => {
                    self.set_status(&execution.id, ExecutionStatus::Error);
                    errors.push(format!("{}: stop timed out", execution.id));
                }
            }
        }
        self.refresh_active();

        info!(instance_id, "BRIDGE: Disconnected");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::Connection(errors.join("; ")))
        }
    }

    /// Disconnect every instance; unreachable instances are reported, not fatal
    pub async fn disconnect_all(&self) -> DisconnectReport {
        let ids: Vec<InstanceId> = self.connections.iter().map(|c| c.key().clone()).collect();
        let mut report = DisconnectReport::default();

        for id in ids {
            match self.disconnect(&id).await {
                Ok(()) => report.disconnected += 1,
                Err(BridgeError::NotConnected(_)) => {}
                Err(e) => {
                    report.disconnected += 1;
                    report.errors.push(format!("{}: {}", id, e));
                }
            }
        }

        info!(
            "BRIDGE: Disconnected {} instances ({} errors)",
            report.disconnected,
            report.errors.len()
        );
        report
    }

    // ========================================================================
    // Deployment
    // ========================================================================

    /// Validate, translate, submit and start a strategy on an instance
    pub async fn deploy(
        &self,
        instance_id: &str,
        definition: StrategyDefinition,
    ) -> Result<StrategyExecution, BridgeError> {
        let connection = self
            .live_connection(instance_id)
            .ok_or_else(|| BridgeError::NotConnected(instance_id.to_string()))?;

        let mut errors = check_definition(
            &definition,
            &self.limits,
            self.config.require_simulation_flags,
        );
        if !connection.supports(definition.kind) {
            errors.push(format!(
                "worker does not support {}",
                definition.kind.wire_name()
            ));
        }
        // Held until the execution is recorded, so a concurrent deploy of the
        // same id sees either the reservation or the live execution
        let reservation = self.reserve_deploy(&definition.id);
        if reservation.is_none() {
            errors.push(format!("strategy {} is already being deployed", definition.id));
        } else if self
            .executions
            .get(&definition.id)
            .map(|e| !e.status.is_terminal())
            .unwrap_or(false)
        {
            errors.push(format!("strategy {} is already deployed", definition.id));
        }
        if !errors.is_empty() {
            self.metrics.deployments.with_label_values(&["rejected"]).inc();
            return Err(BridgeError::Validation(errors));
        }

        let config = to_worker_config(&definition);
        let submitted = timeout(
            self.config.deploy_timeout(),
            self.submit(&connection.endpoint, &config),
        )
        .await;

        let worker_strategy_id = match submitted {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                let outcome = if matches!(e, BridgeError::Validation(_)) {
                    "rejected"
                } else {
                    "failed"
                };
                self.metrics.deployments.with_label_values(&[outcome]).inc();
                warn!(strategy_id = %definition.id, instance_id, "BRIDGE: Deploy failed: {}", e);
                return Err(e);
            }
            Err(_) => {
                self.metrics.deployments.with_label_values(&["failed"]).inc();
                return Err(BridgeError::Timeout(format!("deploying {}", definition.id)));
            }
        };

        let execution = StrategyExecution {
            id: definition.id.clone(),
            instance_id: instance_id.to_string(),
            worker_strategy_id,
            status: ExecutionStatus::Active,
            performance: PerformanceSnapshot::default(),
            started_at: Utc::now(),
            definition,
        };
        self.executions
            .insert(execution.id.clone(), execution.clone());
        self.metrics.deployments.with_label_values(&["success"]).inc();
        self.refresh_active();

        info!(
            strategy_id = %execution.id,
            instance_id,
            worker_strategy_id = %execution.worker_strategy_id,
            "BRIDGE: Strategy deployed"
        );
        self.events.publish(FleetEvent::StrategyDeployed {
            strategy_id: execution.id.clone(),
            instance_id: instance_id.to_string(),
            exchange: execution.definition.exchange.clone(),
            trading_pair: execution.definition.trading_pair.clone(),
        });
        Ok(execution)
    }

    fn reserve_deploy(&self, strategy_id: &str) -> Option<DeployGuard<'_>> {
        match self.deploying.entry(strategy_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(DeployGuard {
                    deploying: &self.deploying,
                    strategy_id: strategy_id.to_string(),
                })
            }
        }
    }

    /// Worker-side validate, create and start
    async fn submit(
        &self,
        endpoint: &WorkerEndpoint,
        config: &WorkerStrategyConfig,
    ) -> Result<String, BridgeError> {
        let worker = &self.worker;

        let validation = self
            .with_retry("validate", move |_| worker.validate_strategy(endpoint, config))
            .await?;
        if !validation.valid {
            let errors = if validation.errors.is_empty() {
                vec!["worker rejected the strategy".to_string()]
            } else {
                validation.errors
            };
            return Err(BridgeError::Validation(errors));
        }

        let id = self
            .with_retry("create", move |_| worker.create_strategy(endpoint, config))
            .await?;

        let worker_id = id.as_str();
        if let Err(e) = self
            .with_retry("start", move |_| worker.start_strategy(endpoint, worker_id))
            .await
        {
            if let Err(stop) = worker.stop_strategy(endpoint, worker_id).await {
                debug!("cleanup of unstarted strategy {} failed: {}", worker_id, stop);
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Run a worker call under the retry policy, recording latency and retries
    async fn with_retry<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, BridgeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, WorkerError>>,
    {
        let started = Instant::now();
        let outcome = self.retry.execute(op).await;

        self.metrics
            .request_latency
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());
        if outcome.attempts > 1 {
            self.metrics
                .retries
                .with_label_values(&[operation])
                .inc_by(u64::from(outcome.attempts - 1));
        }
        outcome.result.map_err(BridgeError::from)
    }

    // ========================================================================
    // Strategy operations
    // ========================================================================

    fn require(&self, strategy_id: &str) -> Result<StrategyExecution, BridgeError> {
        self.execution(strategy_id)
            .ok_or_else(|| BridgeError::NotFound(strategy_id.to_string()))
    }

    async fn stop_on_worker(&self, execution: &StrategyExecution) -> Result<(), BridgeError> {
        let endpoint = self.endpoint_for(&execution.instance_id)?;
        let worker = &self.worker;
        let endpoint = &endpoint;
        let worker_id = execution.worker_strategy_id.as_str();
        self.with_retry("stop", move |_| worker.stop_strategy(endpoint, worker_id))
            .await
    }

    async fn start_on_worker(&self, execution: &StrategyExecution) -> Result<(), BridgeError> {
        let endpoint = self.endpoint_for(&execution.instance_id)?;
        let worker = &self.worker;
        let endpoint = &endpoint;
        let worker_id = execution.worker_strategy_id.as_str();
        self.with_retry("start", move |_| worker.start_strategy(endpoint, worker_id))
            .await
    }

    /// Stop a strategy; stopping a terminal strategy is a no-op
    pub async fn stop(&self, strategy_id: &str, reason: &str) -> Result<(), BridgeError> {
        if self.halt(strategy_id, reason).await? {
            self.publish_stopped(strategy_id, reason);
        }
        Ok(())
    }

    /// Stop on the worker and mark the execution stopped without publishing.
    /// Returns false when it was already terminal.
    async fn halt(&self, strategy_id: &str, reason: &str) -> Result<bool, BridgeError> {
        let execution = self.require(strategy_id)?;
        if execution.status.is_terminal() {
            return Ok(false);
        }
        // A paused strategy is already stopped on the worker
        if execution.status == ExecutionStatus::Active {
            self.stop_on_worker(&execution).await?;
        }

        self.set_status(strategy_id, ExecutionStatus::Stopped);
        self.refresh_active();
        info!(strategy_id, "BRIDGE: Strategy stopped ({})", reason);
        Ok(true)
    }

    fn publish_stopped(&self, strategy_id: &str, reason: &str) {
        self.events.publish(FleetEvent::StrategyStopped {
            strategy_id: strategy_id.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Pause an active strategy; the worker stops it but the execution is kept
    pub async fn pause(&self, strategy_id: &str, reason: &str) -> Result<(), BridgeError> {
        let execution = self.require(strategy_id)?;
        match execution.status {
            ExecutionStatus::Paused => return Ok(()),
            ExecutionStatus::Active => {}
            status => {
                return Err(BridgeError::Validation(vec![format!(
                    "cannot pause strategy in status {:?}",
                    status
                )]))
            }
        }

        self.stop_on_worker(&execution).await?;
        self.set_status(strategy_id, ExecutionStatus::Paused);
        self.refresh_active();
        info!(strategy_id, "BRIDGE: Strategy paused ({})", reason);
        self.events.publish(FleetEvent::StrategyPaused {
            strategy_id: strategy_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Resume a paused strategy
    pub async fn resume(&self, strategy_id: &str) -> Result<(), BridgeError> {
        let execution = self.require(strategy_id)?;
        match execution.status {
            ExecutionStatus::Active => return Ok(()),
            ExecutionStatus::Paused => {}
            status => {
                return Err(BridgeError::Validation(vec![format!(
                    "cannot resume strategy in status {:?}",
                    status
                )]))
            }
        }

        self.start_on_worker(&execution).await?;
        self.set_status(strategy_id, ExecutionStatus::Active);
        self.refresh_active();
        info!(strategy_id, "BRIDGE: Strategy resumed");
        self.events.publish(FleetEvent::StrategyResumed {
            strategy_id: strategy_id.to_string(),
        });
        Ok(())
    }

    /// Stop and start a strategy on the same worker
    pub async fn restart(&self, strategy_id: &str) -> Result<(), BridgeError> {
        let execution = self.require(strategy_id)?;
        if execution.status.is_terminal() {
            return Err(BridgeError::Validation(vec![format!(
                "strategy {} is not running",
                strategy_id
            )]));
        }
        if execution.status == ExecutionStatus::Active {
            self.stop_on_worker(&execution).await?;
        }
        self.start_on_worker(&execution).await?;
        self.set_status(strategy_id, ExecutionStatus::Active);
        self.refresh_active();
        info!(strategy_id, "BRIDGE: Strategy restarted");
        self.events.publish(FleetEvent::StrategyResumed {
            strategy_id: strategy_id.to_string(),
        });
        Ok(())
    }

    /// Redeploy a strategy with merged parameters under the same id.
    /// The merged definition is checked before the running one is stopped.
    pub async fn modify(
        &self,
        strategy_id: &str,
        updates: &BTreeMap<String, ParamValue>,
    ) -> Result<StrategyExecution, BridgeError> {
        let execution = self.require(strategy_id)?;
        let merged = merge_parameters(&execution.definition, updates);

        let errors = check_definition(&merged, &self.limits, self.config.require_simulation_flags);
        if !errors.is_empty() {
            return Err(BridgeError::Validation(errors));
        }

        // A successful retune is announced by the redeploy alone, so the
        // strategy keeps its identity for anyone watching the event bus
        let halted = self.halt(strategy_id, "parameter update").await?;
        match self.deploy(&execution.instance_id, merged).await {
            Ok(redeployed) => Ok(redeployed),
            Err(e) => {
                if halted {
                    self.publish_stopped(strategy_id, &format!("parameter update failed: {}", e));
                }
                Err(e)
            }
        }
    }

    /// Move a strategy to another instance by stop-then-redeploy.
    /// A failed redeploy leaves the strategy stopped, never duplicated.
    pub async fn relocate(
        &self,
        strategy_id: &str,
        target_instance: &str,
    ) -> Result<StrategyExecution, BridgeError> {
        let execution = self.require(strategy_id)?;
        if execution.instance_id == target_instance {
            return Ok(execution);
        }
        if !self.is_connected(target_instance) {
            return Err(BridgeError::NotConnected(target_instance.to_string()));
        }

        self.stop(strategy_id, &format!("relocating to {}", target_instance))
            .await?;
        let moved = self
            .deploy(target_instance, execution.definition.clone())
            .await?;

        self.events.publish(FleetEvent::StrategyMigrated {
            strategy_id: strategy_id.to_string(),
            new_strategy_id: moved.id.clone(),
            from: execution.instance_id.clone(),
            to: target_instance.to_string(),
        });
        Ok(moved)
    }

    /// Cancel open orders; returns how many were cancelled
    pub async fn cancel_orders(&self, strategy_id: &str) -> Result<u32, BridgeError> {
        let execution = self.require(strategy_id)?;
        let endpoint = self.endpoint_for(&execution.instance_id)?;
        let worker = &self.worker;
        let endpoint = &endpoint;
        let worker_id = execution.worker_strategy_id.as_str();
        self.with_retry("cancel_orders", move |_| worker.cancel_orders(endpoint, worker_id))
            .await
    }

    pub async fn get_metrics(&self, strategy_id: &str) -> Result<WorkerMetrics, BridgeError> {
        let execution = self.require(strategy_id)?;
        let endpoint = self.endpoint_for(&execution.instance_id)?;
        let worker = &self.worker;
        let endpoint = &endpoint;
        let worker_id = execution.worker_strategy_id.as_str();
        self.with_retry("metrics", move |_| worker.strategy_metrics(endpoint, worker_id))
            .await
    }

    /// Open the worker's live metrics stream for a strategy
    pub async fn subscribe_metrics(&self, strategy_id: &str) -> Result<MetricsSubscription, BridgeError> {
        let execution = self.require(strategy_id)?;
        let endpoint = self.endpoint_for(&execution.instance_id)?;
        Ok(self
            .worker
            .subscribe_metrics(&endpoint, &execution.worker_strategy_id)
            .await?)
    }

    // ========================================================================
    // Execution records
    // ========================================================================

    pub fn record_performance(&self, strategy_id: &str, performance: PerformanceSnapshot) -> bool {
        match self.executions.get_mut(strategy_id) {
            Some(mut execution) => {
                execution.performance = performance;
                true
            }
            None => false,
        }
    }

    fn set_status(&self, strategy_id: &str, status: ExecutionStatus) {
        if let Some(mut execution) = self.executions.get_mut(strategy_id) {
            execution.status = status;
        }
    }

    fn refresh_active(&self) {
        let active = self.executions.iter().filter(|e| e.is_active()).count();
        self.metrics.active_strategies.set(active as i64);
    }

    pub fn execution(&self, strategy_id: &str) -> Option<StrategyExecution> {
        self.executions.get(strategy_id).map(|e| e.value().clone())
    }

    pub fn executions(&self) -> Vec<StrategyExecution> {
        let mut all: Vec<StrategyExecution> =
            self.executions.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn executions_on(&self, instance_id: &str) -> Vec<StrategyExecution> {
        self.executions()
            .into_iter()
            .filter(|e| e.instance_id == instance_id)
            .collect()
    }

    /// Active and paused strategies on an instance
    pub fn active_count(&self, instance_id: &str) -> usize {
        self.executions
            .iter()
            .filter(|e| e.instance_id == instance_id && !e.status.is_terminal())
            .count()
    }
}
