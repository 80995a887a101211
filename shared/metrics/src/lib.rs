//! Botfleet Metrics - Metrics and monitoring for the strategy-worker fleet
//!
//! Provides Prometheus-compatible collectors for every fleet component. The
//! collectors register into whichever [`Registry`] they are given, so tests
//! can use a private registry while the daemon uses [`registry()`].

pub mod exporter;

use prometheus::{
    Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts,
};
use std::sync::{Arc, OnceLock};

pub use exporter::serve_metrics;
pub use prometheus::Registry;

/// Global metrics registry, used by the daemon
static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Get or initialize the global registry
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Latency buckets for histograms (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, // 5ms
    0.01,  // 10ms
    0.05,  // 50ms
    0.1,   // 100ms
    0.25,  // 250ms
    0.5,   // 500ms
    1.0,   // 1s
    2.5,   // 2.5s
    5.0,   // 5s
    10.0,  // 10s
    30.0,  // 30s
];

/// Instance lifecycle metrics
pub struct FleetMetrics {
    pub instances: IntGaugeVec,
    pub instances_created: IntCounter,
    pub instances_removed: IntCounter,
    pub provisioning_failures: IntCounter,
    pub recoveries: IntCounterVec,
    pub scale_events: IntCounterVec,
}

impl FleetMetrics {
    pub fn new(registry: &Registry) -> Self {
        let instances = IntGaugeVec::new(
            Opts::new("botfleet_instances", "Instances by lifecycle status"),
            &["status"],
        ).expect("Failed to create instances metric");

        let instances_created = IntCounter::new(
            "botfleet_instances_created_total",
            "Instances provisioned",
        ).expect("Failed to create instances_created metric");

        let instances_removed = IntCounter::new(
            "botfleet_instances_removed_total",
            "Instances removed",
        ).expect("Failed to create instances_removed metric");

        let provisioning_failures = IntCounter::new(
            "botfleet_provisioning_failures_total",
            "Failed instance provisioning attempts",
        ).expect("Failed to create provisioning_failures metric");

        let recoveries = IntCounterVec::new(
            Opts::new("botfleet_recoveries_total", "Recovery actions by kind and outcome"),
            &["action", "outcome"],
        ).expect("Failed to create recoveries metric");

        let scale_events = IntCounterVec::new(
            Opts::new("botfleet_scale_events_total", "Scaling decisions by direction"),
            &["direction"],
        ).expect("Failed to create scale_events metric");

        registry.register(Box::new(instances.clone())).ok();
        registry.register(Box::new(instances_created.clone())).ok();
        registry.register(Box::new(instances_removed.clone())).ok();
        registry.register(Box::new(provisioning_failures.clone())).ok();
        registry.register(Box::new(recoveries.clone())).ok();
        registry.register(Box::new(scale_events.clone())).ok();

        Self {
            instances,
            instances_created,
            instances_removed,
            provisioning_failures,
            recoveries,
            scale_events,
        }
    }
}

/// Worker connection and deployment metrics
pub struct BridgeMetrics {
    pub connections: IntGauge,
    pub deployments: IntCounterVec,
    pub request_latency: HistogramVec,
    pub retries: IntCounterVec,
    pub active_strategies: IntGauge,
}

impl BridgeMetrics {
    pub fn new(registry: &Registry) -> Self {
        let connections = IntGauge::new(
            "botfleet_bridge_connections",
            "Open worker connections",
        ).expect("Failed to create connections metric");

        let deployments = IntCounterVec::new(
            Opts::new("botfleet_deployments_total", "Strategy deployments by outcome"),
            &["outcome"],
        ).expect("Failed to create deployments metric");

        let request_latency = HistogramVec::new(
            HistogramOpts::new("botfleet_worker_request_seconds", "Worker API request latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["operation"],
        ).expect("Failed to create request_latency metric");

        let retries = IntCounterVec::new(
            Opts::new("botfleet_worker_retries_total", "Retried worker operations"),
            &["operation"],
        ).expect("Failed to create retries metric");

        let active_strategies = IntGauge::new(
            "botfleet_active_strategies",
            "Strategies currently active on workers",
        ).expect("Failed to create active_strategies metric");

        registry.register(Box::new(connections.clone())).ok();
        registry.register(Box::new(deployments.clone())).ok();
        registry.register(Box::new(request_latency.clone())).ok();
        registry.register(Box::new(retries.clone())).ok();
        registry.register(Box::new(active_strategies.clone())).ok();

        Self {
            connections,
            deployments,
            request_latency,
            retries,
            active_strategies,
        }
    }
}

/// Strategy monitoring metrics
pub struct MonitorMetrics {
    pub samples_ingested: IntCounter,
    pub monitored_strategies: IntGauge,
    pub anomalies: IntCounterVec,
    pub alerts: IntCounterVec,
    pub adjustments: IntCounterVec,
    pub stream_status: IntGaugeVec,
}

impl MonitorMetrics {
    pub fn new(registry: &Registry) -> Self {
        let samples_ingested = IntCounter::new(
            "botfleet_samples_ingested_total",
            "Metric samples ingested",
        ).expect("Failed to create samples_ingested metric");

        let monitored_strategies = IntGauge::new(
            "botfleet_monitored_strategies",
            "Strategies under monitoring",
        ).expect("Failed to create monitored_strategies metric");

        let anomalies = IntCounterVec::new(
            Opts::new("botfleet_anomalies_total", "Anomalies detected"),
            &["kind", "severity"],
        ).expect("Failed to create anomalies metric");

        let alerts = IntCounterVec::new(
            Opts::new("botfleet_alerts_total", "Alerts raised"),
            &["kind", "severity"],
        ).expect("Failed to create alerts metric");

        let adjustments = IntCounterVec::new(
            Opts::new("botfleet_adjustments_total", "Adjustments by kind and outcome"),
            &["kind", "outcome"],
        ).expect("Failed to create adjustments metric");

        let stream_status = IntGaugeVec::new(
            Opts::new("botfleet_stream_status", "Metrics stream status (0=degraded, 1=connected)"),
            &["strategy"],
        ).expect("Failed to create stream_status metric");

        registry.register(Box::new(samples_ingested.clone())).ok();
        registry.register(Box::new(monitored_strategies.clone())).ok();
        registry.register(Box::new(anomalies.clone())).ok();
        registry.register(Box::new(alerts.clone())).ok();
        registry.register(Box::new(adjustments.clone())).ok();
        registry.register(Box::new(stream_status.clone())).ok();

        Self {
            samples_ingested,
            monitored_strategies,
            anomalies,
            alerts,
            adjustments,
            stream_status,
        }
    }
}

/// Safety metrics
pub struct SafetyMetrics {
    pub safety_score: Gauge,
    pub violations: IntCounterVec,
    pub rejected_deployments: IntCounter,
    pub force_stops: IntCounter,
    pub halted: IntGauge,
}

impl SafetyMetrics {
    pub fn new(registry: &Registry) -> Self {
        let safety_score = Gauge::new(
            "botfleet_safety_score",
            "Rolling safety score (0-100)",
        ).expect("Failed to create safety_score metric");

        let violations = IntCounterVec::new(
            Opts::new("botfleet_safety_violations_total", "Safety violations"),
            &["severity"],
        ).expect("Failed to create violations metric");

        let rejected_deployments = IntCounter::new(
            "botfleet_rejected_deployments_total",
            "Deployments rejected by pre-flight validation",
        ).expect("Failed to create rejected_deployments metric");

        let force_stops = IntCounter::new(
            "botfleet_force_stops_total",
            "Strategies force-stopped on critical risk",
        ).expect("Failed to create force_stops metric");

        let halted = IntGauge::new(
            "botfleet_deployments_halted",
            "Whether deployments are halted (0/1)",
        ).expect("Failed to create halted metric");

        registry.register(Box::new(safety_score.clone())).ok();
        registry.register(Box::new(violations.clone())).ok();
        registry.register(Box::new(rejected_deployments.clone())).ok();
        registry.register(Box::new(force_stops.clone())).ok();
        registry.register(Box::new(halted.clone())).ok();

        Self {
            safety_score,
            violations,
            rejected_deployments,
            force_stops,
            halted,
        }
    }
}

/// Exchange and arbitrage metrics
pub struct CoordinatorMetrics {
    pub exchange_healthy: IntGaugeVec,
    pub exchange_latency: GaugeVec,
    pub opportunities_detected: IntCounterVec,
    pub arbitrage_outcomes: IntCounterVec,
    pub failovers: IntCounterVec,
    pub rebalance_orders: IntCounter,
}

impl CoordinatorMetrics {
    pub fn new(registry: &Registry) -> Self {
        let exchange_healthy = IntGaugeVec::new(
            Opts::new("botfleet_exchange_healthy", "Exchange health (0=unhealthy, 1=healthy)"),
            &["exchange"],
        ).expect("Failed to create exchange_healthy metric");

        let exchange_latency = GaugeVec::new(
            Opts::new("botfleet_exchange_latency_ms", "Last probe latency"),
            &["exchange"],
        ).expect("Failed to create exchange_latency metric");

        let opportunities_detected = IntCounterVec::new(
            Opts::new("botfleet_arbitrage_detected_total", "Arbitrage opportunities detected"),
            &["pair"],
        ).expect("Failed to create opportunities_detected metric");

        let arbitrage_outcomes = IntCounterVec::new(
            Opts::new("botfleet_arbitrage_outcomes_total", "Arbitrage executions by outcome"),
            &["outcome"],
        ).expect("Failed to create arbitrage_outcomes metric");

        let failovers = IntCounterVec::new(
            Opts::new("botfleet_failovers_total", "Failover actions by outcome"),
            &["exchange", "outcome"],
        ).expect("Failed to create failovers metric");

        let rebalance_orders = IntCounter::new(
            "botfleet_rebalance_orders_total",
            "Rebalance strategies issued",
        ).expect("Failed to create rebalance_orders metric");

        registry.register(Box::new(exchange_healthy.clone())).ok();
        registry.register(Box::new(exchange_latency.clone())).ok();
        registry.register(Box::new(opportunities_detected.clone())).ok();
        registry.register(Box::new(arbitrage_outcomes.clone())).ok();
        registry.register(Box::new(failovers.clone())).ok();
        registry.register(Box::new(rebalance_orders.clone())).ok();

        Self {
            exchange_healthy,
            exchange_latency,
            opportunities_detected,
            arbitrage_outcomes,
            failovers,
            rebalance_orders,
        }
    }
}

/// Emergency shutdown metrics
pub struct ShutdownMetrics {
    pub runs: IntCounterVec,
    pub step_duration: HistogramVec,
    pub step_failures: IntCounterVec,
    pub in_progress: IntGauge,
}

impl ShutdownMetrics {
    pub fn new(registry: &Registry) -> Self {
        let runs = IntCounterVec::new(
            Opts::new("botfleet_shutdown_runs_total", "Shutdown runs by outcome"),
            &["outcome"],
        ).expect("Failed to create runs metric");

        let step_duration = HistogramVec::new(
            HistogramOpts::new("botfleet_shutdown_step_seconds", "Shutdown step duration")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["step"],
        ).expect("Failed to create step_duration metric");

        let step_failures = IntCounterVec::new(
            Opts::new("botfleet_shutdown_step_failures_total", "Failed shutdown steps"),
            &["step"],
        ).expect("Failed to create step_failures metric");

        let in_progress = IntGauge::new(
            "botfleet_shutdown_in_progress",
            "Whether a shutdown is executing (0/1)",
        ).expect("Failed to create in_progress metric");

        registry.register(Box::new(runs.clone())).ok();
        registry.register(Box::new(step_duration.clone())).ok();
        registry.register(Box::new(step_failures.clone())).ok();
        registry.register(Box::new(in_progress.clone())).ok();

        Self {
            runs,
            step_duration,
            step_failures,
            in_progress,
        }
    }
}

/// All fleet metrics
///
/// Each group is shared with the component that updates it.
pub struct BotFleetMetrics {
    pub fleet: Arc<FleetMetrics>,
    pub bridge: Arc<BridgeMetrics>,
    pub monitor: Arc<MonitorMetrics>,
    pub safety: Arc<SafetyMetrics>,
    pub coordinator: Arc<CoordinatorMetrics>,
    pub shutdown: Arc<ShutdownMetrics>,
}

impl BotFleetMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            fleet: Arc::new(FleetMetrics::new(registry)),
            bridge: Arc::new(BridgeMetrics::new(registry)),
            monitor: Arc::new(MonitorMetrics::new(registry)),
            safety: Arc::new(SafetyMetrics::new(registry)),
            coordinator: Arc::new(CoordinatorMetrics::new(registry)),
            shutdown: Arc::new(ShutdownMetrics::new(registry)),
        }
    }
}

impl Default for BotFleetMetrics {
    fn default() -> Self {
        Self::new(registry())
    }
}

/// Get metrics as Prometheus text format
pub fn gather_metrics(registry: &Registry) -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
