//! Strategy lifecycle through the bridge against the in-memory worker

use botfleet_bridge::{BridgeError, BridgeRegistry};
use botfleet_config::{BridgeConfig, PlatformLimits};
use botfleet_connectors::testing::{FakeWorker, RecordingSink};
use botfleet_connectors::WorkerEndpoint;
use botfleet_metrics::{BridgeMetrics, Registry};
use botfleet_types::{
    EventBus, ExecutionSettings, ExecutionStatus, ParamValue, RetryPolicy, StrategyDefinition,
    StrategyKind,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    worker: Arc<FakeWorker>,
    bridge: BridgeRegistry,
    sink: Arc<RecordingSink>,
    _subscription: botfleet_types::SinkSubscription,
}

fn harness() -> Harness {
    let worker = Arc::new(FakeWorker::new());
    let events = EventBus::default();
    let sink = Arc::new(RecordingSink::new());
    let subscription = events.attach_sink(sink.clone());
    let bridge = BridgeRegistry::new(
        worker.clone(),
        BridgeConfig::default(),
        PlatformLimits::default(),
        events,
        Arc::new(BridgeMetrics::new(&Registry::new())),
    )
    .with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(1)));

    Harness {
        worker,
        bridge,
        sink,
        _subscription: subscription,
    }
}

fn endpoint(port: u16) -> WorkerEndpoint {
    WorkerEndpoint::for_host("127.0.0.1", port)
}

fn definition(id: &str) -> StrategyDefinition {
    StrategyDefinition::new(id, StrategyKind::PureMarketMaking, "binance", "BTC-USDT")
        .with_parameter("bid_spread", 0.001)
        .with_execution(ExecutionSettings {
            paper_trading: true,
            simulation_mode: true,
            ..Default::default()
        })
}

#[tokio::test]
async fn test_modify_redeploys_under_same_id() {
    let h = harness();
    h.bridge.connect("i-1", endpoint(18001)).await.unwrap();
    let original = h.bridge.deploy("i-1", definition("s1")).await.unwrap();

    let mut updates = BTreeMap::new();
    updates.insert("bid_spread".to_string(), ParamValue::Number(0.002));
    let modified = h.bridge.modify("s1", &updates).await.unwrap();

    assert_eq!(modified.id, "s1");
    assert_ne!(modified.worker_strategy_id, original.worker_strategy_id);
    assert!(!h.worker.is_running(&original.worker_strategy_id));
    assert!(h.worker.is_running(&modified.worker_strategy_id));
    assert_eq!(modified.definition.parameters["bid_spread"].as_f64(), Some(0.002));
    assert_eq!(h.bridge.active_count("i-1"), 1);

    // A retune is one more deployment, never a stop
    assert!(h.sink.wait_for("strategy_deployed", Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.sink.count("strategy_deployed"), 2);
    assert_eq!(h.sink.count("strategy_stopped"), 0);
}

#[tokio::test]
async fn test_failed_redeploy_during_modify_announces_stop() {
    let h = harness();
    h.bridge.connect("i-1", endpoint(18001)).await.unwrap();
    h.bridge.deploy("i-1", definition("s1")).await.unwrap();
    h.worker.reject_exchange("binance");

    let mut updates = BTreeMap::new();
    updates.insert("bid_spread".to_string(), ParamValue::Number(0.002));
    assert!(h.bridge.modify("s1", &updates).await.is_err());

    assert_eq!(h.bridge.execution("s1").unwrap().status, ExecutionStatus::Stopped);
    assert!(h.sink.wait_for("strategy_stopped", Duration::from_secs(1)).await);
    assert_eq!(h.sink.count("strategy_stopped"), 1);
}

#[tokio::test]
async fn test_invalid_modify_keeps_strategy_running() {
    let h = harness();
    h.bridge.connect("i-1", endpoint(18001)).await.unwrap();
    let original = h.bridge.deploy("i-1", definition("s1")).await.unwrap();

    let mut updates = BTreeMap::new();
    updates.insert("order_amount".to_string(), ParamValue::Number(-1.0));
    assert!(matches!(
        h.bridge.modify("s1", &updates).await,
        Err(BridgeError::Validation(_))
    ));
    assert!(h.worker.is_running(&original.worker_strategy_id));
}

#[tokio::test]
async fn test_relocate_moves_strategy() {
    let h = harness();
    h.bridge.connect("i-1", endpoint(18001)).await.unwrap();
    h.bridge.connect("i-2", endpoint(18002)).await.unwrap();
    let original = h.bridge.deploy("i-1", definition("s1")).await.unwrap();

    let moved = h.bridge.relocate("s1", "i-2").await.unwrap();

    assert_eq!(moved.instance_id, "i-2");
    assert!(!h.worker.is_running(&original.worker_strategy_id));
    let placed = h.worker.strategy(&moved.worker_strategy_id).unwrap();
    assert_eq!(placed.api_url, endpoint(18002).api_url);
    assert_eq!(h.bridge.active_count("i-1"), 0);
    assert_eq!(h.bridge.active_count("i-2"), 1);
    assert!(h.sink.wait_for("strategy_migrated", Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_failed_relocation_leaves_strategy_stopped() {
    let h = harness();
    h.bridge.connect("i-1", endpoint(18001)).await.unwrap();
    h.bridge.connect("i-2", endpoint(18002)).await.unwrap();
    h.bridge.deploy("i-1", definition("s1")).await.unwrap();

    h.worker.set_unreachable(&endpoint(18002).api_url, true);
    assert!(h.bridge.relocate("s1", "i-2").await.is_err());

    assert_eq!(h.worker.running_count(), 0);
    assert_eq!(
        h.bridge.execution("s1").unwrap().status,
        ExecutionStatus::Stopped
    );
}

#[tokio::test]
async fn test_disconnect_all_reports_unreachable_instances() {
    let h = harness();
    h.bridge.connect("i-1", endpoint(18001)).await.unwrap();
    h.bridge.connect("i-2", endpoint(18002)).await.unwrap();
    h.bridge.deploy("i-1", definition("s1")).await.unwrap();
    h.bridge.deploy("i-2", definition("s2")).await.unwrap();

    h.worker.set_unreachable(&endpoint(18002).api_url, true);
    let report = h.bridge.disconnect_all().await;

    assert_eq!(report.disconnected, 2);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("i-2"));
    assert_eq!(h.bridge.connection_count(), 0);
    assert_eq!(
        h.bridge.execution("s1").unwrap().status,
        ExecutionStatus::Stopped
    );
    assert_eq!(h.bridge.execution("s2").unwrap().status, ExecutionStatus::Error);
}

#[tokio::test]
async fn test_deploy_requires_connection_and_unique_id() {
    let h = harness();
    assert!(matches!(
        h.bridge.deploy("i-9", definition("s1")).await,
        Err(BridgeError::NotConnected(_))
    ));

    h.bridge.connect("i-1", endpoint(18001)).await.unwrap();
    h.bridge.deploy("i-1", definition("s1")).await.unwrap();
    assert!(matches!(
        h.bridge.deploy("i-1", definition("s1")).await,
        Err(BridgeError::Validation(_))
    ));
    assert!(h.sink.wait_for("strategy_deployed", Duration::from_secs(1)).await);
    assert_eq!(h.sink.count("strategy_deployed"), 1);
}

#[tokio::test]
async fn test_concurrent_deploys_of_one_id_run_once() {
    let h = harness();
    h.bridge.connect("i-1", endpoint(18001)).await.unwrap();
    // The first create backs off, leaving the second deploy room to interleave
    h.worker.fail_next_creates(1);

    let (first, second) = tokio::join!(
        h.bridge.deploy("i-1", definition("s1")),
        h.bridge.deploy("i-1", definition("s1")),
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(BridgeError::Validation(_))));
    assert_eq!(h.worker.running_count(), 1);
    assert_eq!(h.bridge.active_count("i-1"), 1);

    // The reservation is gone once the first deploy settles
    h.bridge.stop("s1", "test").await.unwrap();
    h.bridge.deploy("i-1", definition("s1")).await.unwrap();
    assert_eq!(h.worker.running_count(), 1);
}

#[tokio::test]
async fn test_metrics_and_orders_are_delegated() {
    let h = harness();
    h.bridge.connect("i-1", endpoint(18001)).await.unwrap();
    let execution = h.bridge.deploy("i-1", definition("s1")).await.unwrap();

    h.worker.set_metrics(
        &execution.worker_strategy_id,
        botfleet_connectors::WorkerMetrics {
            trades: 12,
            latency_ms: 80.0,
            ..Default::default()
        },
    );
    let metrics = h.bridge.get_metrics("s1").await.unwrap();
    assert_eq!(metrics.trades, 12);

    assert_eq!(h.bridge.cancel_orders("s1").await.unwrap(), 0);
    assert_eq!(h.worker.cancel_calls(), 1);
    assert!(matches!(
        h.bridge.get_metrics("missing").await,
        Err(BridgeError::NotFound(_))
    ));
}
