//! Component wiring

use crate::attach::spawn_monitor_attacher;
use crate::guard::spawn_shutdown_guard;
use crate::service::{LoopService, Supervisor};
use crate::OrchestratorError;
use botfleet_bridge::BridgeRegistry;
use botfleet_config::FleetConfig;
use botfleet_connectors::{
    BalanceProvider, ContainerRuntime, DockerRuntime, ExchangeProbe, HttpExchangeProbe,
    HttpMarketData, HttpWorkerClient, LogSink, PriceOracle, StreamSettings, WebhookSink, WorkerApi,
};
use botfleet_coordinator::MultiExchangeCoordinator;
use botfleet_exchange_tracker::ExchangeStatusTracker;
use botfleet_fleet::{FleetManager, ScaleReport};
use botfleet_metrics::{BotFleetMetrics, Registry};
use botfleet_monitor::StrategyMonitor;
use botfleet_safety::SafetyMonitor;
use botfleet_shutdown::EmergencyShutdownCoordinator;
use botfleet_types::{EventBus, EventSink, SinkSubscription};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

fn connector_error(e: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::Connector(e.to_string())
}

/// External collaborators the fleet is built on
pub struct Connectors {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub worker: Arc<dyn WorkerApi>,
    pub oracle: Arc<dyn PriceOracle>,
    pub balances: Arc<dyn BalanceProvider>,
    pub probe: Arc<dyn ExchangeProbe>,
}

impl Connectors {
    /// Real network clients for `config`
    pub fn from_config(config: &FleetConfig) -> Result<Self, OrchestratorError> {
        let runtime = DockerRuntime::new(
            &config.runtime.docker_url,
            config.runtime.api_port,
            config.runtime.request_timeout(),
        )
        .map_err(connector_error)?;

        let bridge = &config.bridge;
        let worker = HttpWorkerClient::new(
            bridge.request_timeout(),
            StreamSettings {
                ping_interval: Duration::from_secs(bridge.stream_ping_interval_secs),
                reconnect_base: Duration::from_millis(bridge.stream_reconnect_base_ms),
                reconnect_max: Duration::from_millis(bridge.stream_reconnect_max_ms),
                max_reconnects: bridge.stream_max_reconnects,
                connect_timeout: bridge.connect_timeout(),
            },
        )
        .map_err(connector_error)?;

        let market = Arc::new(
            HttpMarketData::new(&config.coordinator.market_data_url, bridge.request_timeout())
                .map_err(connector_error)?,
        );

        let status_urls: HashMap<String, String> = config
            .coordinator
            .exchanges
            .iter()
            .map(|e| (e.name.clone(), e.status_url.clone()))
            .collect();
        let probe = HttpExchangeProbe::new(
            status_urls,
            Duration::from_millis(config.coordinator.probe_timeout_ms),
        )
        .map_err(connector_error)?;

        Ok(Self {
            runtime: Arc::new(runtime),
            worker: Arc::new(worker),
            oracle: market.clone(),
            balances: market,
            probe: Arc::new(probe),
        })
    }
}

/// The fully wired fleet
pub struct BotFleet {
    config: FleetConfig,
    events: EventBus,
    pub bridge: Arc<BridgeRegistry>,
    pub fleet: Arc<FleetManager>,
    pub monitor: Arc<StrategyMonitor>,
    pub safety: Arc<SafetyMonitor>,
    pub tracker: Arc<ExchangeStatusTracker>,
    pub coordinator: Arc<MultiExchangeCoordinator>,
    pub shutdown: Arc<EmergencyShutdownCoordinator>,
    sinks: Vec<SinkSubscription>,
}

impl BotFleet {
    /// Build every component. Collectors register into `registry`; the
    /// audit log sink is always attached, the webhook sink when configured.
    pub fn build(
        config: FleetConfig,
        connectors: Connectors,
        registry: &Registry,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        info!("BOTFLEET: Wiring components ({} environment)", config.environment);

        let events = EventBus::new(config.monitoring.event_bus_capacity);
        let metrics = BotFleetMetrics::new(registry);

        let bridge = Arc::new(BridgeRegistry::new(
            connectors.worker,
            config.bridge.clone(),
            config.platform_limits.clone(),
            events.clone(),
            metrics.bridge.clone(),
        ));
        let fleet = Arc::new(FleetManager::new(
            connectors.runtime,
            bridge.clone(),
            config.runtime.clone(),
            config.scaling.clone(),
            events.clone(),
            metrics.fleet.clone(),
        ));
        let monitor = Arc::new(StrategyMonitor::new(
            bridge.clone(),
            config.monitor.clone(),
            events.clone(),
            metrics.monitor.clone(),
        ));
        let safety = Arc::new(SafetyMonitor::new(
            bridge.clone(),
            fleet.clone(),
            config.safety.clone(),
            config.platform_limits.clone(),
            events.clone(),
            metrics.safety.clone(),
        ));
        let tracker = Arc::new(ExchangeStatusTracker::new(
            connectors.probe,
            &config.coordinator,
            events.clone(),
            metrics.coordinator.clone(),
        ));
        let coordinator = Arc::new(MultiExchangeCoordinator::new(
            bridge.clone(),
            tracker.clone(),
            fleet.clone(),
            connectors.oracle,
            connectors.balances,
            config.coordinator.clone(),
            events.clone(),
            metrics.coordinator.clone(),
        ));
        let shutdown = Arc::new(EmergencyShutdownCoordinator::new(
            bridge.clone(),
            fleet.clone(),
            safety.clone(),
            config.shutdown.clone(),
            events.clone(),
            metrics.shutdown.clone(),
        ));

        let mut app = Self {
            config,
            events,
            bridge,
            fleet,
            monitor,
            safety,
            tracker,
            coordinator,
            shutdown,
            sinks: Vec::new(),
        };

        app.attach_sink(Arc::new(LogSink));
        if let Some(url) = app.config.monitoring.webhook_url.clone() {
            match WebhookSink::new(&url, WEBHOOK_TIMEOUT) {
                Ok(sink) => app.attach_sink(Arc::new(sink)),
                Err(e) => warn!("BOTFLEET: Webhook sink disabled: {}", e),
            }
        }
        Ok(app)
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Forward every event to `sink` for as long as the fleet lives
    pub fn attach_sink(&mut self, sink: Arc<dyn EventSink>) {
        info!("BOTFLEET: Attaching event sink '{}'", sink.name());
        self.sinks.push(self.events.attach_sink(sink));
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    /// Adopt containers left by a previous run, take a first exchange
    /// reading, then bring the fleet to the size the scaling policy asks for
    pub async fn bootstrap(&self) -> Result<ScaleReport, OrchestratorError> {
        let adopted = self.fleet.sync_from_runtime().await?;
        if adopted > 0 {
            info!("BOTFLEET: Adopted {} existing instance(s)", adopted);
        }

        let failed = self.tracker.poll_once().await;
        if !failed.is_empty() {
            warn!("BOTFLEET: Exchanges down at start-up: {}", failed.join(", "));
        }

        let report = self.fleet.scale_to(None).await?;
        if !report.failures.is_empty() {
            warn!(
                "BOTFLEET: {} instance(s) failed to start: {}",
                report.failures.len(),
                report.failures.join("; ")
            );
        }
        info!("BOTFLEET: Fleet at {} instance(s)", self.fleet.instance_count());
        Ok(report)
    }

    /// One service per loop group, in start order
    pub fn supervisor(&self) -> Supervisor {
        let mut supervisor = Supervisor::new();

        let fleet = self.fleet.clone();
        supervisor.register(Box::new(LoopService::new("fleet", move |rx| {
            vec![
                fleet.spawn_health_loop(rx.clone()),
                fleet.spawn_scaling_loop(rx.clone()),
                fleet.spawn_rebalance_loop(rx),
            ]
        })));

        let events = self.events.clone();
        let bridge = self.bridge.clone();
        let monitor = self.monitor.clone();
        supervisor.register(Box::new(LoopService::new("strategy-monitor", move |rx| {
            vec![
                spawn_monitor_attacher(&events, bridge.clone(), monitor.clone(), rx.clone()),
                monitor.spawn_collection_loop(rx.clone()),
                monitor.spawn_anomaly_loop(rx.clone()),
                monitor.spawn_alert_loop(rx),
            ]
        })));

        let safety = self.safety.clone();
        supervisor.register(Box::new(LoopService::new("safety", move |rx| {
            vec![safety.spawn_monitor_loop(rx)]
        })));

        let coordinator = self.coordinator.clone();
        supervisor.register(Box::new(LoopService::new("exchanges", move |rx| {
            vec![
                coordinator.spawn_health_loop(rx.clone()),
                coordinator.spawn_arbitrage_loop(rx.clone()),
                coordinator.spawn_rebalance_loop(rx),
            ]
        })));

        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        supervisor.register(Box::new(LoopService::new("shutdown-guard", move |rx| {
            vec![spawn_shutdown_guard(&events, shutdown.clone(), rx)]
        })));

        supervisor
    }
}
