//! Deployment gating and live risk against the in-memory worker

use botfleet_bridge::BridgeRegistry;
use botfleet_config::{BridgeConfig, PlatformLimits, SafetyConfig};
use botfleet_connectors::testing::{FakeWorker, RecordingSink};
use botfleet_connectors::WorkerEndpoint;
use botfleet_metrics::{BridgeMetrics, Registry, SafetyMetrics};
use botfleet_safety::{SafetyError, SafetyMonitor};
use botfleet_types::{
    EventBus, ExecutionStatus, InstanceDirectory, InstanceId, PerformanceSnapshot, RetryPolicy,
    RiskLimits, Severity, StrategyDefinition, StrategyKind,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct StaticDirectory {
    healthy: Mutex<HashSet<String>>,
}

impl StaticDirectory {
    fn with(ids: &[&str]) -> Self {
        Self {
            healthy: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
        }
    }
}

impl InstanceDirectory for StaticDirectory {
    fn is_instance_healthy(&self, instance_id: &str) -> bool {
        self.healthy.lock().unwrap().contains(instance_id)
    }

    fn running_instances(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.healthy.lock().unwrap().iter().cloned().collect();
        ids.sort();
        ids
    }
}

struct Harness {
    worker: Arc<FakeWorker>,
    bridge: Arc<BridgeRegistry>,
    safety: SafetyMonitor,
    sink: Arc<RecordingSink>,
    _subscription: botfleet_types::SinkSubscription,
}

async fn harness_with(config: SafetyConfig) -> Harness {
    let worker = Arc::new(FakeWorker::new());
    let events = EventBus::default();
    let sink = Arc::new(RecordingSink::new());
    let subscription = events.attach_sink(sink.clone());
    let registry = Registry::new();

    let bridge = Arc::new(
        BridgeRegistry::new(
            worker.clone(),
            BridgeConfig::default(),
            PlatformLimits::default(),
            events.clone(),
            Arc::new(BridgeMetrics::new(&registry)),
        )
        .with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(1))),
    );
    bridge
        .connect("i-1", WorkerEndpoint::for_host("127.0.0.1", 18001))
        .await
        .unwrap();

    let safety = SafetyMonitor::new(
        bridge.clone(),
        Arc::new(StaticDirectory::with(&["i-1"])),
        config,
        PlatformLimits::default(),
        events,
        Arc::new(SafetyMetrics::new(&registry)),
    );

    Harness {
        worker,
        bridge,
        safety,
        sink,
        _subscription: subscription,
    }
}

async fn harness() -> Harness {
    harness_with(SafetyConfig::default()).await
}

/// Definition as a user would submit it, without simulation flags
fn definition(id: &str) -> StrategyDefinition {
    StrategyDefinition::new(id, StrategyKind::PureMarketMaking, "binance", "BTC-USDT")
        .with_parameter("bid_spread", 0.001)
}

fn perf(drawdown: f64) -> PerformanceSnapshot {
    PerformanceSnapshot {
        trades: 20,
        fill_rate: 0.8,
        latency_ms: 120.0,
        drawdown,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_deploy_stamps_simulation_flags() {
    let h = harness().await;
    let def = definition("s1");
    assert!(!def.execution.is_simulated());

    let execution = h.safety.deploy(&def, "i-1").await.unwrap();
    assert!(execution.definition.execution.is_simulated());
    assert!(h.worker.is_running(&execution.worker_strategy_id));
}

#[tokio::test]
async fn test_position_above_ceiling_never_reaches_bridge() {
    let h = harness().await;
    let def = definition("s1").with_risk_limits(RiskLimits {
        max_position_size: 50.0,
        ..Default::default()
    });

    let result = h.safety.deploy(&def, "i-1").await;
    match result {
        Err(SafetyError::Validation(errors)) => {
            assert!(errors[0].contains("max_position_size 50 exceeds platform limit 10"));
        }
        other => panic!("expected validation error, got {:?}", other.map(|e| e.id)),
    }
    assert_eq!(h.worker.validations(), 0);
    assert!(h.worker.created().is_empty());
    assert!(h.bridge.executions().is_empty());
}

#[tokio::test]
async fn test_paper_trading_disabled_fails_closed() {
    let h = harness_with(SafetyConfig {
        paper_trading_enabled: false,
        ..Default::default()
    })
    .await;

    let result = h.safety.validate_deployment(&definition("s1"), "i-1");
    assert!(matches!(result, Err(SafetyError::PaperTradingDisabled)));

    h.safety.set_paper_trading(true);
    assert!(h.safety.validate_deployment(&definition("s1"), "i-1").is_ok());
}

#[tokio::test]
async fn test_unhealthy_instance_is_rejected() {
    let h = harness().await;
    let result = h.safety.validate_deployment(&definition("s1"), "i-9");
    assert!(matches!(result, Err(SafetyError::InstanceUnhealthy(id)) if id == "i-9"));
}

#[tokio::test]
async fn test_halt_blocks_deployments_until_resumed() {
    let h = harness().await;
    h.safety.halt("emergency shutdown plan-1");

    let result = h.safety.deploy(&definition("s1"), "i-1").await;
    assert!(matches!(result, Err(SafetyError::Halted(reason)) if reason.contains("plan-1")));
    assert!(h.safety.status().halted);

    h.safety.resume();
    assert!(h.safety.deploy(&definition("s1"), "i-1").await.is_ok());
}

#[tokio::test]
async fn test_critical_drawdown_force_stops() {
    let h = harness().await;
    h.safety.deploy(&definition("s1"), "i-1").await.unwrap();
    h.bridge.record_performance("s1", perf(0.25));

    let assessments = h.safety.monitor_all().await;
    assert_eq!(assessments.len(), 1);
    assert_eq!(assessments[0].level, Some(Severity::Critical));
    assert!(assessments[0].force_stopped);

    assert_eq!(h.bridge.execution("s1").unwrap().status, ExecutionStatus::Stopped);
    assert!(h.sink.wait_for("strategy_force_stopped", Duration::from_secs(1)).await);
    assert_eq!(h.safety.violations().len(), 1);
    assert_eq!(h.safety.score(), 75.0);

    // Stopped strategies are no longer assessed
    assert!(h.safety.monitor_all().await.is_empty());
}

#[tokio::test]
async fn test_violations_recorded_on_escalation_only() {
    let h = harness().await;
    h.safety.deploy(&definition("s1"), "i-1").await.unwrap();

    h.bridge.record_performance("s1", perf(0.12));
    h.safety.monitor_all().await;
    h.safety.monitor_all().await;
    assert_eq!(h.safety.violations().len(), 1);
    assert_eq!(h.safety.score(), 95.0);

    h.bridge.record_performance("s1", perf(0.16));
    let assessed = h.safety.monitor_all().await;
    assert!(assessed[0].escalated);
    assert_eq!(h.safety.score(), 85.0);

    // De-escalation is silent; a later rise counts again
    h.bridge.record_performance("s1", perf(0.05));
    h.safety.monitor_all().await;
    h.bridge.record_performance("s1", perf(0.12));
    h.safety.monitor_all().await;

    let severities: Vec<Severity> = h.safety.violations().iter().map(|v| v.severity).collect();
    assert_eq!(severities, vec![Severity::Medium, Severity::High, Severity::Medium]);
    assert_eq!(h.safety.score(), 80.0);
    assert!(h.sink.wait_for("safety_violation", Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_disabling_paper_trading_is_a_violation() {
    let h = harness().await;
    h.safety.set_paper_trading(false);
    h.safety.set_paper_trading(false);

    let status = h.safety.status();
    assert!(!status.paper_trading_enabled);
    assert_eq!(status.violations, 1);
    assert_eq!(status.score, 90.0);
}
