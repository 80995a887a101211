//! Coordination, arbitrage, failover and rebalancing against in-memory fakes

use botfleet_bridge::BridgeRegistry;
use botfleet_config::{BridgeConfig, CoordinatorConfig, ExchangeConfig, PlatformLimits};
use botfleet_connectors::testing::{FakeWorker, RecordingSink, ScriptedProbe, StaticOracle};
use botfleet_connectors::WorkerEndpoint;
use botfleet_coordinator::{
    CoordinatorError, CrossStatus, FailoverAction, MultiExchangeCoordinator, OrderSide,
};
use botfleet_exchange_tracker::ExchangeStatusTracker;
use botfleet_metrics::{BridgeMetrics, CoordinatorMetrics, Registry};
use botfleet_types::{
    EventBus, ExecutionSettings, ExecutionStatus, InstanceDirectory, InstanceId,
    OpportunityStatus, RetryPolicy, SinkSubscription, StrategyDefinition, StrategyKind,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct StaticDirectory {
    running: Mutex<HashSet<String>>,
}

impl InstanceDirectory for StaticDirectory {
    fn is_instance_healthy(&self, instance_id: &str) -> bool {
        self.running.lock().unwrap().contains(instance_id)
    }

    fn running_instances(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.running.lock().unwrap().iter().cloned().collect();
        ids.sort();
        ids
    }
}

struct Harness {
    worker: Arc<FakeWorker>,
    bridge: Arc<BridgeRegistry>,
    probe: Arc<ScriptedProbe>,
    oracle: Arc<StaticOracle>,
    coordinator: Arc<MultiExchangeCoordinator>,
    sink: Arc<RecordingSink>,
    _subscription: SinkSubscription,
}

fn exchange(name: &str, fallbacks: &[&str]) -> ExchangeConfig {
    ExchangeConfig {
        name: name.to_string(),
        status_url: format!("https://{}.test/status", name),
        fallbacks: fallbacks.iter().map(|f| f.to_string()).collect(),
    }
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        exchanges: vec![
            exchange("binance", &["kraken"]),
            exchange("kraken", &[]),
            exchange("okx", &[]),
        ],
        trading_pairs: vec!["BTC-USDT".to_string()],
        ..Default::default()
    }
}

async fn harness_with(config: CoordinatorConfig) -> Harness {
    let worker = Arc::new(FakeWorker::new());
    let events = EventBus::default();
    let sink = Arc::new(RecordingSink::new());
    let subscription = events.attach_sink(sink.clone());
    let registry = Registry::new();
    let metrics = Arc::new(CoordinatorMetrics::new(&registry));

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
        .connect("i-1", WorkerEndpoint::for_host("127.0.0.1", 18101))
        .await
        .unwrap();
    bridge
        .connect("i-2", WorkerEndpoint::for_host("127.0.0.1", 18102))
        .await
        .unwrap();

    let probe = Arc::new(ScriptedProbe::new());
    let tracker = Arc::new(ExchangeStatusTracker::new(
        probe.clone(),
        &config,
        events.clone(),
        metrics.clone(),
    ));
    // Exchanges start unknown; one clean poll makes them healthy
    tracker.poll_once().await;

    let directory = Arc::new(StaticDirectory {
        running: Mutex::new(["i-1", "i-2"].iter().map(|s| s.to_string()).collect()),
    });
    let oracle = Arc::new(StaticOracle::new());
    let coordinator = Arc::new(MultiExchangeCoordinator::new(
        bridge.clone(),
        tracker,
        directory,
        oracle.clone(),
        oracle.clone(),
        config,
        events,
        metrics,
    ));

    Harness {
        worker,
        bridge,
        probe,
        oracle,
        coordinator,
        sink,
        _subscription: subscription,
    }
}

async fn harness() -> Harness {
    harness_with(config()).await
}

fn definition(id: &str, exchange: &str) -> StrategyDefinition {
    StrategyDefinition::new(id, StrategyKind::PureMarketMaking, exchange, "BTC-USDT")
        .with_parameter("bid_spread", 0.001)
        .with_execution(ExecutionSettings {
            paper_trading: true,
            simulation_mode: true,
            ..Default::default()
        })
}

async fn fail_exchange(h: &Harness, name: &str) -> Vec<FailoverAction> {
    h.probe.set_down(name, true);
    let mut actions = Vec::new();
    for _ in 0..3 {
        actions = h.coordinator.run_health_cycle().await;
    }
    actions
}

// ============================================================================
// Coordinated placement
// ============================================================================

#[tokio::test]
async fn test_coordination_places_groups_on_least_loaded_instance() {
    let h = harness().await;
    h.bridge
        .deploy("i-1", definition("busy", "okx"))
        .await
        .unwrap();

    let strategy = h
        .coordinator
        .coordinate_strategies(
            "btc market making",
            vec![
                definition("s-a", "binance"),
                definition("s-c", "kraken"),
                definition("s-b", "binance"),
            ],
        )
        .await
        .unwrap();

    assert_eq!(strategy.status, CrossStatus::Active);
    assert_eq!(strategy.legs.len(), 3);

    // binance goes first: i-2 is empty. kraken then sees i-1 (1) vs i-2 (2).
    let placed: Vec<(&str, &str)> = strategy
        .legs
        .iter()
        .map(|l| (l.strategy_id.as_str(), l.instance_id.as_str()))
        .collect();
    assert_eq!(placed, vec![("s-a", "i-2"), ("s-b", "i-2"), ("s-c", "i-1")]);
    assert_eq!(h.coordinator.strategies().len(), 1);
}

#[tokio::test]
async fn test_unhealthy_exchange_refuses_coordination() {
    let h = harness().await;
    h.probe.set_down("okx", true);
    h.coordinator.tracker().poll_once().await;

    let result = h
        .coordinator
        .coordinate_strategies(
            "pair",
            vec![definition("s-a", "binance"), definition("s-o", "okx")],
        )
        .await;

    assert!(matches!(result, Err(CoordinatorError::ExchangeUnavailable(e)) if e == "okx"));
    assert!(h.worker.created().is_empty());
}

#[tokio::test]
async fn test_failed_leg_rolls_back_coordination() {
    let h = harness().await;
    h.worker.reject_exchange("kraken");

    let result = h
        .coordinator
        .coordinate_strategies(
            "pair",
            vec![definition("s-a", "binance"), definition("s-c", "kraken")],
        )
        .await;

    assert!(matches!(result, Err(CoordinatorError::Coordination(_))));
    assert_eq!(
        h.bridge.execution("s-a").unwrap().status,
        ExecutionStatus::Stopped
    );
    assert!(h.coordinator.strategies().is_empty());
    assert_eq!(h.worker.running_count(), 0);
}

// ============================================================================
// Arbitrage
// ============================================================================

#[tokio::test]
async fn test_detects_spread_above_threshold() {
    let h = harness().await;
    h.oracle.set_price("binance", "BTC-USDT", 100.0);
    h.oracle.set_price("kraken", "BTC-USDT", 101.0);

    let detected = h.coordinator.detect_arbitrage().await;

    assert_eq!(detected.len(), 1);
    assert_eq!(detected[0].buy_exchange, "binance");
    assert_eq!(detected[0].sell_exchange, "kraken");
    assert!(h.sink.wait_for("arbitrage_detected", Duration::from_secs(1)).await);

    // Detection alone deploys nothing
    assert!(h.worker.created().is_empty());
}

#[tokio::test]
async fn test_execute_deploys_both_legs() {
    let h = harness().await;
    h.oracle.set_price("binance", "BTC-USDT", 100.0);
    h.oracle.set_price("kraken", "BTC-USDT", 101.0);
    let opportunity = h.coordinator.detect_arbitrage().await.remove(0);

    let strategy = h.coordinator.execute_arbitrage(&opportunity).await.unwrap();

    assert_eq!(strategy.legs.len(), 2);
    assert_eq!(strategy.legs[0].exchange, "binance");
    assert_eq!(strategy.legs[1].exchange, "kraken");
    // 1000 / 100 = 10 units, capped at 1
    assert_eq!(strategy.legs[0].definition.execution.order_amount, 1.0);
    assert_eq!(h.worker.running_count(), 2);

    let stored = h.coordinator.opportunities();
    assert_eq!(stored[0].status, OpportunityStatus::Executed);
    assert!(h.sink.wait_for("arbitrage_executed", Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_collapsed_spread_is_rejected_before_deploying() {
    let h = harness().await;
    h.oracle.set_price("binance", "BTC-USDT", 100.0);
    h.oracle.set_price("kraken", "BTC-USDT", 101.0);
    let opportunity = h.coordinator.detect_arbitrage().await.remove(0);

    h.oracle.set_price("kraken", "BTC-USDT", 100.1);
    let result = h.coordinator.execute_arbitrage(&opportunity).await;

    assert!(matches!(result, Err(CoordinatorError::Rejected(_))));
    assert!(h.worker.created().is_empty());
    assert_eq!(
        h.coordinator.opportunities()[0].status,
        OpportunityStatus::Rejected
    );
    assert!(h.sink.wait_for("arbitrage_rejected", Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_failed_leg_tears_down_the_other() {
    let h = harness().await;
    h.oracle.set_price("binance", "BTC-USDT", 100.0);
    h.oracle.set_price("kraken", "BTC-USDT", 101.0);
    let opportunity = h.coordinator.detect_arbitrage().await.remove(0);
    h.worker.reject_exchange("kraken");

    let result = h.coordinator.execute_arbitrage(&opportunity).await;

    assert!(matches!(result, Err(CoordinatorError::Coordination(_))));
    let buy_leg = h
        .bridge
        .execution(&format!("{}-buy", opportunity.id))
        .unwrap();
    assert_eq!(buy_leg.status, ExecutionStatus::Stopped);
    assert_eq!(h.worker.running_count(), 0);
    assert_eq!(
        h.coordinator.opportunities()[0].status,
        OpportunityStatus::Failed
    );
}

// ============================================================================
// Failover
// ============================================================================

#[tokio::test]
async fn test_failed_exchange_migrates_to_healthy_fallback() {
    let h = harness().await;
    let cross = h
        .coordinator
        .coordinate_strategies("mm", vec![definition("s-a", "binance")])
        .await
        .unwrap();

    h.probe.set_down("binance", true);
    assert!(h.coordinator.run_health_cycle().await.is_empty());
    assert!(h.coordinator.run_health_cycle().await.is_empty());
    let actions = h.coordinator.run_health_cycle().await;

    assert_eq!(actions.len(), 1);
    let new_id = match &actions[0] {
        FailoverAction::Migrated {
            strategy_id,
            new_strategy_id,
            to,
            ..
        } => {
            assert_eq!(strategy_id, "s-a");
            assert_eq!(to, "kraken");
            new_strategy_id.clone()
        }
        other => panic!("expected migration, got {:?}", other),
    };

    assert_eq!(
        h.bridge.execution("s-a").unwrap().status,
        ExecutionStatus::Stopped
    );
    let moved = h.bridge.execution(&new_id).unwrap();
    assert_eq!(moved.status, ExecutionStatus::Active);
    assert_eq!(moved.definition.exchange, "kraken");

    let record = h.coordinator.strategy(&cross.id).unwrap();
    assert_eq!(record.status, CrossStatus::Active);
    assert_eq!(record.legs[0].strategy_id, new_id);
    assert!(h.sink.wait_for("strategy_migrated", Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_failed_exchange_without_fallback_pauses() {
    let h = harness().await;
    let cross = h
        .coordinator
        .coordinate_strategies("mm", vec![definition("s-c", "kraken")])
        .await
        .unwrap();

    let actions = fail_exchange(&h, "kraken").await;

    assert!(matches!(&actions[..], [FailoverAction::Paused { strategy_id, .. }] if strategy_id == "s-c"));
    assert_eq!(
        h.bridge.execution("s-c").unwrap().status,
        ExecutionStatus::Paused
    );
    assert_eq!(
        h.coordinator.strategy(&cross.id).unwrap().status,
        CrossStatus::Paused
    );
    assert!(h.sink.wait_for("strategy_paused", Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_failed_pause_is_retried_on_later_cycles() {
    let h = harness().await;
    let cross = h
        .coordinator
        .coordinate_strategies("mm", vec![definition("s-c", "kraken")])
        .await
        .unwrap();

    h.worker.set_fail_stop(true);
    let actions = fail_exchange(&h, "kraken").await;
    assert!(matches!(&actions[..], [FailoverAction::Failed { strategy_id, .. }] if strategy_id == "s-c"));
    assert_eq!(
        h.bridge.execution("s-c").unwrap().status,
        ExecutionStatus::Active
    );
    assert_eq!(
        h.coordinator.strategy(&cross.id).unwrap().status,
        CrossStatus::Active
    );

    h.worker.set_fail_stop(false);
    let actions = h.coordinator.run_health_cycle().await;

    assert!(matches!(&actions[..], [FailoverAction::Paused { strategy_id, .. }] if strategy_id == "s-c"));
    assert_eq!(
        h.bridge.execution("s-c").unwrap().status,
        ExecutionStatus::Paused
    );
    assert_eq!(
        h.coordinator.strategy(&cross.id).unwrap().status,
        CrossStatus::Paused
    );
    // Nothing left to do once the leg is off the exchange
    assert!(h.coordinator.run_health_cycle().await.is_empty());
}

#[tokio::test]
async fn test_pause_without_fallback_covers_every_leg() {
    let h = harness().await;
    let cross = h
        .coordinator
        .coordinate_strategies(
            "pair",
            vec![definition("s-b", "binance"), definition("s-k", "kraken")],
        )
        .await
        .unwrap();

    let actions = fail_exchange(&h, "kraken").await;

    let paused: Vec<&str> = actions
        .iter()
        .map(|a| match a {
            FailoverAction::Paused { strategy_id, .. } => strategy_id.as_str(),
            other => panic!("expected pause, got {:?}", other),
        })
        .collect();
    assert_eq!(paused, vec!["s-k", "s-b"]);
    for id in ["s-b", "s-k"] {
        assert_eq!(h.bridge.execution(id).unwrap().status, ExecutionStatus::Paused);
    }
    assert_eq!(
        h.coordinator.strategy(&cross.id).unwrap().status,
        CrossStatus::Paused
    );
    assert!(h.coordinator.tracker().is_healthy("binance"));
}

#[tokio::test]
async fn test_fallback_that_is_down_counts_as_absent() {
    let h = harness().await;
    h.coordinator
        .coordinate_strategies("mm", vec![definition("s-a", "binance")])
        .await
        .unwrap();
    h.probe.set_down("kraken", true);

    let actions = fail_exchange(&h, "binance").await;

    assert!(matches!(&actions[..], [FailoverAction::Paused { .. }]));
}

// ============================================================================
// Rebalancing
// ============================================================================

#[tokio::test]
async fn test_rebalance_sells_overweight_asset() {
    let mut config = config();
    config.target_allocations.insert("BTC".to_string(), 0.5);
    config.target_allocations.insert("USDT".to_string(), 0.5);
    let h = harness_with(config).await;

    // 0.14 BTC at 50k = 7000 against 3000 USDT
    h.oracle.set_price("binance", "BTC-USDT", 50_000.0);
    h.oracle.set_balance("binance", "BTC", 0.1);
    h.oracle.set_balance("kraken", "BTC", 0.04);
    h.oracle.set_balance("binance", "USDT", 3_000.0);

    let orders = h.coordinator.rebalance().await.unwrap();

    assert_eq!(orders.len(), 2);
    let btc = &orders[0];
    assert_eq!(btc.asset, "BTC");
    assert_eq!(btc.side, OrderSide::Sell);
    assert!((btc.value - 2_000.0).abs() < 1e-6);
    assert!(btc.strategy_id.is_some());

    // The quote side settles through the BTC order
    assert_eq!(orders[1].asset, "USDT");
    assert!(orders[1].strategy_id.is_none());
    assert_eq!(h.worker.created().len(), 1);
}

#[tokio::test]
async fn test_balanced_portfolio_issues_nothing() {
    let mut config = config();
    config.target_allocations.insert("BTC".to_string(), 0.5);
    config.target_allocations.insert("USDT".to_string(), 0.5);
    let h = harness_with(config).await;

    h.oracle.set_price("binance", "BTC-USDT", 50_000.0);
    h.oracle.set_balance("binance", "BTC", 0.1);
    h.oracle.set_balance("binance", "USDT", 5_000.0);

    assert!(h.coordinator.rebalance().await.unwrap().is_empty());
    assert!(h.worker.created().is_empty());
}
