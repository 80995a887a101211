//! In-memory fakes of every external collaborator
//!
//! Enabled for downstream tests through the `testing` feature.

use async_trait::async_trait;
use botfleet_types::{EventEnvelope, EventSink, SinkError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::oracle::{BalanceProvider, OracleError, PriceOracle};
use crate::probe::{ExchangeProbe, ProbeError};
use crate::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerState, ContainerStats, RuntimeError,
};
use crate::stream::{MetricsSubscription, StreamEvent, StreamFrame};
use crate::worker::{
    DetailedHealth, HealthReport, ValidationResponse, WorkerApi, WorkerEndpoint, WorkerError,
    WorkerMetrics, WorkerOrder, WorkerStrategy, WorkerStrategyConfig,
};

// ============================================================================
// Container runtime
// ============================================================================

struct FakeContainer {
    spec: ContainerSpec,
    state: ContainerState,
    stats: ContainerStats,
    restarts: u32,
}

/// Container runtime that keeps containers in memory
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicU32,
    image_present: Mutex<bool>,
    pulls: AtomicU32,
    fail_create: Mutex<bool>,
    fail_start: Mutex<bool>,
    removed: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let runtime = Self::default();
        *runtime.image_present.lock() = true;
        runtime
    }

    pub fn without_image(self) -> Self {
        *self.image_present.lock() = false;
        self
    }

    pub fn set_fail_create(&self, fail: bool) {
        *self.fail_create.lock() = fail;
    }

    pub fn set_fail_start(&self, fail: bool) {
        *self.fail_start.lock() = fail;
    }

    pub fn set_stats(&self, container_id: &str, stats: ContainerStats) {
        if let Some(c) = self.containers.lock().get_mut(container_id) {
            c.stats = stats;
        }
    }

    /// Apply the same stats to every container
    pub fn set_all_stats(&self, stats: ContainerStats) {
        for c in self.containers.lock().values_mut() {
            c.stats = stats.clone();
        }
    }

    pub fn set_state(&self, container_id: &str, state: ContainerState) {
        if let Some(c) = self.containers.lock().get_mut(container_id) {
            c.state = state;
        }
    }

    /// Add a managed container directly, as if left over from a previous run
    pub fn seed(&self, spec: ContainerSpec, state: ContainerState) -> String {
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.containers.lock().insert(
            id.clone(),
            FakeContainer {
                spec,
                state,
                stats: ContainerStats::default(),
                restarts: 0,
            },
        );
        id
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn running_count(&self) -> usize {
        self.containers
            .lock()
            .values()
            .filter(|c| c.state == ContainerState::Running)
            .count()
    }

    pub fn pulls(&self) -> u32 {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn restarts(&self, container_id: &str) -> u32 {
        self.containers
            .lock()
            .get(container_id)
            .map(|c| c.restarts)
            .unwrap_or(0)
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    fn info(id: &str, c: &FakeContainer) -> ContainerInfo {
        let mut labels = c.spec.labels.clone();
        labels.insert(crate::runtime::MANAGED_LABEL.to_string(), "true".to_string());
        ContainerInfo {
            id: id.to_string(),
            name: c.spec.name.clone(),
            state: c.state,
            labels,
            host_port: Some(c.spec.host_port),
        }
    }

    fn with_container<T>(
        &self,
        container_id: &str,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T, RuntimeError> {
        self.containers
            .lock()
            .get_mut(container_id)
            .map(f)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
        Ok(*self.image_present.lock())
    }

    async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        *self.image_present.lock() = true;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        if *self.fail_create.lock() {
            return Err(RuntimeError::Api {
                status: 500,
                message: "create failed".to_string(),
            });
        }
        Ok(self.seed(spec.clone(), ContainerState::Created))
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        if *self.fail_start.lock() {
            return Err(RuntimeError::Api {
                status: 500,
                message: "start failed".to_string(),
            });
        }
        self.with_container(container_id, |c| c.state = ContainerState::Running)
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.with_container(container_id, |c| c.state = ContainerState::Exited)
    }

    async fn restart(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.with_container(container_id, |c| {
            c.state = ContainerState::Running;
            c.restarts += 1;
        })
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.containers
            .lock()
            .remove(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        self.removed.lock().push(container_id.to_string());
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo, RuntimeError> {
        self.with_container(container_id, |c| Self::info(container_id, c))
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats, RuntimeError> {
        self.with_container(container_id, |c| c.stats.clone())
    }

    async fn list_managed(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let mut list: Vec<ContainerInfo> = self
            .containers
            .lock()
            .iter()
            .map(|(id, c)| Self::info(id, c))
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }
}

// ============================================================================
// Worker API
// ============================================================================

#[derive(Debug, Clone)]
pub struct FakeStrategy {
    pub api_url: String,
    pub config: WorkerStrategyConfig,
    pub running: bool,
}

/// Worker API backed by in-memory strategies
#[derive(Default)]
pub struct FakeWorker {
    health_calls: AtomicUsize,
    unreachable: Mutex<HashSet<String>>,
    rejected_exchanges: Mutex<HashSet<String>>,
    transient_failures: AtomicU32,
    fail_stop: Mutex<bool>,
    next_id: AtomicU32,
    strategies: Mutex<HashMap<String, FakeStrategy>>,
    created: Mutex<Vec<WorkerStrategyConfig>>,
    validations: AtomicUsize,
    stop_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    metrics: Mutex<HashMap<String, WorkerMetrics>>,
    streams: Mutex<HashMap<String, mpsc::Sender<StreamEvent>>>,
}

impl FakeWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call against `api_url` fails with a connection error
    pub fn set_unreachable(&self, api_url: &str, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(api_url.to_string());
        } else {
            set.remove(api_url);
        }
    }

    /// Validation rejects definitions for `exchange`
    pub fn reject_exchange(&self, exchange: &str) {
        self.rejected_exchanges.lock().insert(exchange.to_string());
    }

    /// The next `n` create calls fail with a retryable error
    pub fn fail_next_creates(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_stop(&self, fail: bool) {
        *self.fail_stop.lock() = fail;
    }

    pub fn set_metrics(&self, worker_strategy_id: &str, metrics: WorkerMetrics) {
        self.metrics
            .lock()
            .insert(worker_strategy_id.to_string(), metrics);
    }

    /// Push a frame to the live subscription of a strategy
    pub async fn push_frame(&self, worker_strategy_id: &str, frame: StreamFrame) -> bool {
        let sender = self.streams.lock().get(worker_strategy_id).cloned();
        match sender {
            Some(tx) => tx.send(StreamEvent::Frame(frame)).await.is_ok(),
            None => false,
        }
    }

    pub async fn push_event(&self, worker_strategy_id: &str, event: StreamEvent) -> bool {
        let sender = self.streams.lock().get(worker_strategy_id).cloned();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn validations(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<WorkerStrategyConfig> {
        self.created.lock().clone()
    }

    pub fn running_count(&self) -> usize {
        self.strategies.lock().values().filter(|s| s.running).count()
    }

    pub fn strategy(&self, worker_strategy_id: &str) -> Option<FakeStrategy> {
        self.strategies.lock().get(worker_strategy_id).cloned()
    }

    pub fn is_running(&self, worker_strategy_id: &str) -> bool {
        self.strategy(worker_strategy_id)
            .map(|s| s.running)
            .unwrap_or(false)
    }

    fn reachable(&self, endpoint: &WorkerEndpoint) -> Result<(), WorkerError> {
        if self.unreachable.lock().contains(&endpoint.api_url) {
            return Err(WorkerError::Connection(format!(
                "connection refused: {}",
                endpoint.api_url
            )));
        }
        Ok(())
    }

    fn set_running(&self, strategy_id: &str, running: bool) -> Result<(), WorkerError> {
        self.strategies
            .lock()
            .get_mut(strategy_id)
            .map(|s| s.running = running)
            .ok_or_else(|| WorkerError::NotFound(format!("/strategies/{}", strategy_id)))
    }
}

#[async_trait]
impl WorkerApi for FakeWorker {
    async fn health(&self, endpoint: &WorkerEndpoint) -> Result<HealthReport, WorkerError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        self.reachable(endpoint)?;
        Ok(HealthReport {
            status: "ok".to_string(),
            version: Some("fake".to_string()),
            uptime_secs: None,
        })
    }

    async fn detailed_health(&self, endpoint: &WorkerEndpoint) -> Result<DetailedHealth, WorkerError> {
        self.reachable(endpoint)?;
        let active = self
            .strategies
            .lock()
            .values()
            .filter(|s| s.running && s.api_url == endpoint.api_url)
            .count() as u32;
        Ok(DetailedHealth {
            status: "ok".to_string(),
            components: Default::default(),
            active_strategies: active,
            supported_strategies: vec![
                "pure_market_making".to_string(),
                "avellaneda_market_making".to_string(),
                "cross_exchange_market_making".to_string(),
                "arbitrage".to_string(),
                "twap".to_string(),
                "grid".to_string(),
            ],
        })
    }

    async fn validate_strategy(
        &self,
        endpoint: &WorkerEndpoint,
        config: &WorkerStrategyConfig,
    ) -> Result<ValidationResponse, WorkerError> {
        self.reachable(endpoint)?;
        self.validations.fetch_add(1, Ordering::SeqCst);
        if self.rejected_exchanges.lock().contains(&config.exchange) {
            return Ok(ValidationResponse {
                valid: false,
                errors: vec![format!("unsupported exchange: {}", config.exchange)],
            });
        }
        Ok(ValidationResponse {
            valid: true,
            errors: Vec::new(),
        })
    }

    async fn create_strategy(
        &self,
        endpoint: &WorkerEndpoint,
        config: &WorkerStrategyConfig,
    ) -> Result<String, WorkerError> {
        self.reachable(endpoint)?;
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(WorkerError::Connection("connection reset".to_string()));
        }

        let id = format!("wrk-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.strategies.lock().insert(
            id.clone(),
            FakeStrategy {
                api_url: endpoint.api_url.clone(),
                config: config.clone(),
                running: false,
            },
        );
        self.created.lock().push(config.clone());
        Ok(id)
    }

    async fn get_strategy(
        &self,
        endpoint: &WorkerEndpoint,
        strategy_id: &str,
    ) -> Result<WorkerStrategy, WorkerError> {
        self.reachable(endpoint)?;
        let strategy = self
            .strategy(strategy_id)
            .ok_or_else(|| WorkerError::NotFound(format!("/strategies/{}", strategy_id)))?;
        Ok(WorkerStrategy {
            id: strategy_id.to_string(),
            status: if strategy.running { "running" } else { "stopped" }.to_string(),
            config: serde_json::to_value(&strategy.config).ok(),
        })
    }

    async fn start_strategy(&self, endpoint: &WorkerEndpoint, strategy_id: &str) -> Result<(), WorkerError> {
        self.reachable(endpoint)?;
        self.set_running(strategy_id, true)
    }

    async fn stop_strategy(&self, endpoint: &WorkerEndpoint, strategy_id: &str) -> Result<(), WorkerError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.reachable(endpoint)?;
        if *self.fail_stop.lock() {
            return Err(WorkerError::Http {
                status: 409,
                message: "strategy busy".to_string(),
            });
        }
        self.set_running(strategy_id, false)
    }

    async fn strategy_metrics(
        &self,
        endpoint: &WorkerEndpoint,
        strategy_id: &str,
    ) -> Result<WorkerMetrics, WorkerError> {
        self.reachable(endpoint)?;
        Ok(self
            .metrics
            .lock()
            .get(strategy_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn strategy_orders(
        &self,
        endpoint: &WorkerEndpoint,
        _strategy_id: &str,
    ) -> Result<Vec<WorkerOrder>, WorkerError> {
        self.reachable(endpoint)?;
        Ok(Vec::new())
    }

    async fn cancel_orders(&self, endpoint: &WorkerEndpoint, _strategy_id: &str) -> Result<u32, WorkerError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.reachable(endpoint)?;
        Ok(0)
    }

    async fn subscribe_metrics(
        &self,
        endpoint: &WorkerEndpoint,
        strategy_id: &str,
    ) -> Result<MetricsSubscription, WorkerError> {
        self.reachable(endpoint)?;
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        self.streams.lock().insert(strategy_id.to_string(), event_tx);
        Ok(MetricsSubscription::new(event_rx, shutdown_tx))
    }
}

// ============================================================================
// Market data and probes
// ============================================================================

/// Fixed prices and balances
#[derive(Default)]
pub struct StaticOracle {
    prices: Mutex<HashMap<(String, String), f64>>,
    balances: Mutex<HashMap<String, HashMap<String, f64>>>,
}

impl StaticOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, exchange: &str, trading_pair: &str, price: f64) {
        self.prices
            .lock()
            .insert((exchange.to_string(), trading_pair.to_string()), price);
    }

    pub fn set_balance(&self, exchange: &str, asset: &str, amount: f64) {
        self.balances
            .lock()
            .entry(exchange.to_string())
            .or_default()
            .insert(asset.to_string(), amount);
    }
}

#[async_trait]
impl PriceOracle for StaticOracle {
    async fn price(&self, exchange: &str, trading_pair: &str) -> Result<f64, OracleError> {
        self.prices
            .lock()
            .get(&(exchange.to_string(), trading_pair.to_string()))
            .copied()
            .ok_or_else(|| OracleError::NotFound(format!("{}/{}", exchange, trading_pair)))
    }
}

#[async_trait]
impl BalanceProvider for StaticOracle {
    async fn balances(&self, exchange: &str) -> Result<HashMap<String, f64>, OracleError> {
        Ok(self.balances.lock().get(exchange).cloned().unwrap_or_default())
    }
}

/// Probe whose answers are set by the test
#[derive(Default)]
pub struct ScriptedProbe {
    down: Mutex<HashSet<String>>,
    latency: Mutex<HashMap<String, Duration>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, exchange: &str, down: bool) {
        let mut set = self.down.lock();
        if down {
            set.insert(exchange.to_string());
        } else {
            set.remove(exchange);
        }
    }

    pub fn set_latency(&self, exchange: &str, latency: Duration) {
        self.latency.lock().insert(exchange.to_string(), latency);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeProbe for ScriptedProbe {
    async fn probe(&self, exchange: &str) -> Result<Duration, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.lock().contains(exchange) {
            return Err(ProbeError::Unreachable(exchange.to_string()));
        }
        Ok(self
            .latency
            .lock()
            .get(exchange)
            .copied()
            .unwrap_or(Duration::from_millis(10)))
    }
}

// ============================================================================
// Events
// ============================================================================

/// Sink that keeps every event it receives
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event.kind()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event.kind() == kind)
            .count()
    }

    /// Wait until an event of `kind` arrives or `timeout` passes
    pub async fn wait_for(&self, kind: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.count(kind) > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.count(kind) > 0
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        self.events.lock().push(envelope.clone());
        Ok(())
    }
}
