//! Fleet lifecycle against the in-memory runtime and worker

use botfleet_bridge::BridgeRegistry;
use botfleet_config::{BridgeConfig, PlatformLimits, RuntimeConfig, ScalingPolicy};
use botfleet_connectors::testing::{FakeRuntime, FakeWorker, RecordingSink};
use botfleet_connectors::{ContainerSpec, ContainerState, ContainerStats, INSTANCE_LABEL};
use botfleet_fleet::{FleetError, FleetManager, HealthIssue};
use botfleet_metrics::{BridgeMetrics, FleetMetrics, Registry};
use botfleet_types::{
    EventBus, ExecutionSettings, ExecutionStatus, InstanceConfig, InstanceDirectory,
    InstanceStatus, RetryPolicy, SinkSubscription, StrategyDefinition, StrategyKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    runtime: Arc<FakeRuntime>,
    worker: Arc<FakeWorker>,
    bridge: Arc<BridgeRegistry>,
    fleet: FleetManager,
    sink: Arc<RecordingSink>,
    _subscription: SinkSubscription,
}

fn harness_with(runtime: FakeRuntime, policy: ScalingPolicy) -> Harness {
    let registry = Registry::new();
    let runtime = Arc::new(runtime);
    let worker = Arc::new(FakeWorker::new());
    let events = EventBus::default();
    let sink = Arc::new(RecordingSink::new());
    let subscription = events.attach_sink(sink.clone());

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
    let fleet = FleetManager::new(
        runtime.clone(),
        bridge.clone(),
        RuntimeConfig {
            readiness_interval_ms: 20,
            startup_timeout_secs: 1,
            ..Default::default()
        },
        policy,
        events,
        Arc::new(FleetMetrics::new(&registry)),
    );

    Harness {
        runtime,
        worker,
        bridge,
        fleet,
        sink,
        _subscription: subscription,
    }
}

fn harness() -> Harness {
    harness_with(FakeRuntime::new(), ScalingPolicy::default())
}

fn definition(id: &str) -> StrategyDefinition {
    StrategyDefinition::new(id, StrategyKind::PureMarketMaking, "binance", "BTC-USDT").with_execution(
        ExecutionSettings {
            paper_trading: true,
            simulation_mode: true,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_create_instance_runs_and_connects() {
    let h = harness_with(FakeRuntime::new().without_image(), ScalingPolicy::default());

    let instance = h.fleet.create_instance(InstanceConfig::default()).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.api_url, "http://127.0.0.1:18000");
    assert_eq!(h.runtime.pulls(), 1);
    assert_eq!(h.runtime.running_count(), 1);
    assert!(h.bridge.is_connected(&instance.id));
    assert!(h.fleet.is_instance_healthy(&instance.id));
    assert!(h.sink.wait_for("instance_created", Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_failed_start_tears_down_container() {
    let h = harness();
    h.runtime.set_fail_start(true);

    let err = h.fleet.create_instance(InstanceConfig::default()).await.unwrap_err();

    assert!(matches!(err, FleetError::Provisioning(_)));
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.runtime.removed(), vec!["ctr-1".to_string()]);
    assert_eq!(h.fleet.instance_count(), 0);
}

#[tokio::test]
async fn test_unready_worker_is_torn_down() {
    let h = harness();
    h.worker.set_unreachable("http://127.0.0.1:18000", true);

    let err = h.fleet.create_instance(InstanceConfig::default()).await.unwrap_err();

    assert!(matches!(err, FleetError::Provisioning(_)));
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.bridge.connection_count(), 0);
    assert!(h.worker.health_calls() >= 2);
}

#[tokio::test]
async fn test_scale_to_explicit_target() {
    let h = harness();

    let report = h.fleet.scale_to(Some(3)).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.created.len(), 3);
    assert_eq!(h.fleet.instance_count(), 3);

    let report = h.fleet.scale_to(Some(1)).await.unwrap();
    assert_eq!(report.removed.len(), 2);
    assert_eq!(h.fleet.instance_count(), 1);
    assert_eq!(h.runtime.container_count(), 1);
}

#[tokio::test]
async fn test_scale_target_outside_bounds_is_rejected() {
    let h = harness();
    let err = h.fleet.scale_to(Some(11)).await.unwrap_err();
    assert!(matches!(
        err,
        FleetError::InvalidTarget {
            target: 11,
            min: 1,
            max: 10
        }
    ));
    assert_eq!(h.fleet.instance_count(), 0);
}

#[tokio::test]
async fn test_scale_down_removes_idle_instance_first() {
    let h = harness();
    h.fleet.scale_to(Some(2)).await.unwrap();
    let busy = h.fleet.instances()[0].id.clone();
    h.bridge.deploy(&busy, definition("s1")).await.unwrap();

    let report = h.fleet.scale_to(Some(1)).await.unwrap();

    assert_eq!(report.removed.len(), 1);
    assert_ne!(report.removed[0], busy);
    assert_eq!(
        h.bridge.execution("s1").unwrap().status,
        ExecutionStatus::Active
    );
}

#[tokio::test]
async fn test_removed_instance_strategies_move() {
    let h = harness();
    h.fleet.scale_to(Some(2)).await.unwrap();
    let instances = h.fleet.instances();
    let (doomed, survivor) = (instances[0].id.clone(), instances[1].id.clone());
    h.bridge.deploy(&doomed, definition("s1")).await.unwrap();

    h.fleet.remove_instance(&doomed).await.unwrap();

    let execution = h.bridge.execution("s1").unwrap();
    assert_eq!(execution.instance_id, survivor);
    assert_eq!(execution.status, ExecutionStatus::Active);
    assert!(h.sink.wait_for("instance_removed", Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_removed_instance_stops_paused_strategies() {
    let h = harness();
    h.fleet.scale_to(Some(2)).await.unwrap();
    let doomed = h.fleet.instances()[0].id.clone();
    h.bridge.deploy(&doomed, definition("s1")).await.unwrap();
    h.bridge.pause("s1", "operator request").await.unwrap();

    h.fleet.remove_instance(&doomed).await.unwrap();

    let execution = h.bridge.execution("s1").unwrap();
    assert_eq!(execution.instance_id, doomed);
    assert_eq!(execution.status, ExecutionStatus::Stopped);
    assert!(h.sink.wait_for("strategy_stopped", Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_autoscale_follows_utilization() {
    let h = harness();
    h.fleet.scale_to(Some(2)).await.unwrap();
    h.runtime.set_all_stats(ContainerStats {
        cpu_percent: 84.0,
        memory_percent: 20.0,
        ..Default::default()
    });
    h.fleet.health_check().await;

    // 2 × 84/70 = 2.4 → 3
    let report = h.fleet.scale_to(None).await.unwrap();
    assert_eq!(report.to, 3);
    assert_eq!(h.fleet.instance_count(), 3);
}

#[tokio::test]
async fn test_health_check_reports_issues() {
    let h = harness();
    h.fleet.scale_to(Some(3)).await.unwrap();
    let instances = h.fleet.instances();

    h.runtime.set_state(&instances[0].container_id, ContainerState::Exited);
    h.worker.set_unreachable(&instances[1].api_url, true);
    h.runtime.set_stats(
        &instances[2].container_id,
        ContainerStats {
            cpu_percent: 95.0,
            ..Default::default()
        },
    );

    let statuses = h.fleet.health_check().await;
    let issues_of = |id: &str| {
        statuses
            .iter()
            .find(|s| s.instance_id == id)
            .map(|s| s.issues.clone())
            .unwrap()
    };

    assert_eq!(issues_of(&instances[0].id), vec![HealthIssue::ContainerNotRunning]);
    assert_eq!(issues_of(&instances[1].id), vec![HealthIssue::ApiUnreachable]);
    assert_eq!(issues_of(&instances[2].id), vec![HealthIssue::CpuExhausted]);
    assert!(h
        .fleet
        .instances()
        .iter()
        .all(|i| i.status == InstanceStatus::Unhealthy));
}

#[tokio::test]
async fn test_health_cycle_restarts_stopped_container() {
    let h = harness();
    let instance = h.fleet.create_instance(InstanceConfig::default()).await.unwrap();
    h.bridge.deploy(&instance.id, definition("s1")).await.unwrap();
    h.runtime.set_state(&instance.container_id, ContainerState::Exited);

    h.fleet.run_health_cycle().await;

    assert_eq!(h.runtime.restarts(&instance.container_id), 1);
    assert_eq!(h.fleet.instance(&instance.id).unwrap().status, InstanceStatus::Running);
    // The strategy lost with the old process is deployed again
    let restored = h.bridge.execution("s1").unwrap();
    assert_eq!(restored.status, ExecutionStatus::Active);
    assert!(h.worker.is_running(&restored.worker_strategy_id));
}

#[tokio::test]
async fn test_resource_exhaustion_requests_scale_up() {
    let h = harness();
    let instance = h.fleet.create_instance(InstanceConfig::default()).await.unwrap();
    h.runtime.set_stats(
        &instance.container_id,
        ContainerStats {
            memory_percent: 97.0,
            ..Default::default()
        },
    );

    h.fleet.run_health_cycle().await;

    assert_eq!(h.fleet.pending_scale_up(), 1);
    assert!(h.sink.wait_for("scale_requested", Duration::from_secs(1)).await);
    assert_eq!(h.runtime.restarts(&instance.container_id), 0);
}

#[tokio::test]
async fn test_repeated_failed_recovery_flags_instance() {
    let h = harness_with(
        FakeRuntime::new(),
        ScalingPolicy {
            max_recovery_attempts: 1,
            ..Default::default()
        },
    );
    let instance = h.fleet.create_instance(InstanceConfig::default()).await.unwrap();
    h.worker.set_unreachable(&instance.api_url, true);

    let issues = [HealthIssue::ApiUnreachable];
    assert!(h.fleet.recover(&instance.id, &issues).await.is_err());
    assert!(matches!(
        h.fleet.recover(&instance.id, &issues).await,
        Err(FleetError::ManualIntervention(_))
    ));

    let flagged = h.fleet.instance(&instance.id).unwrap();
    assert!(flagged.needs_manual_intervention);
    assert_eq!(flagged.status, InstanceStatus::Error);
    assert!(!h.fleet.is_instance_healthy(&instance.id));
    assert!(h
        .sink
        .wait_for("instance_needs_intervention", Duration::from_secs(1))
        .await);

    // No further automatic restarts
    let restarts = h.runtime.restarts(&instance.container_id);
    h.fleet.run_health_cycle().await;
    assert_eq!(h.runtime.restarts(&instance.container_id), restarts);
}

#[tokio::test]
async fn test_select_instance_prefers_least_loaded() {
    let h = harness();
    h.fleet.scale_to(Some(2)).await.unwrap();
    let first = h.fleet.select_instance().unwrap();
    h.bridge.deploy(&first, definition("s1")).await.unwrap();

    let second = h.fleet.select_instance().unwrap();
    assert_ne!(first, second);
    assert_eq!(h.fleet.running_instances().len(), 2);
}

#[tokio::test]
async fn test_rebalance_moves_excess_strategies() {
    let h = harness();
    h.fleet.scale_to(Some(2)).await.unwrap();
    let loaded = h.fleet.instances()[0].id.clone();
    for n in 0..4 {
        h.bridge
            .deploy(&loaded, definition(&format!("s{}", n)))
            .await
            .unwrap();
    }

    let report = h.fleet.rebalance_load().await;

    assert_eq!(report.moved.len(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(h.bridge.active_count(&loaded), 2);
    assert_eq!(h.worker.running_count(), 4);
}

#[tokio::test]
async fn test_stop_all_instances() {
    let h = harness();
    h.fleet.scale_to(Some(2)).await.unwrap();

    let report = h.fleet.stop_all_instances().await;

    assert_eq!(report.stopped, 2);
    assert!(report.errors.is_empty());
    assert_eq!(h.runtime.running_count(), 0);
    assert!(h
        .fleet
        .instances()
        .iter()
        .all(|i| i.status == InstanceStatus::Stopped));
}

#[tokio::test]
async fn test_sync_adopts_managed_containers() {
    let h = harness();
    let mut labels = HashMap::new();
    labels.insert(INSTANCE_LABEL.to_string(), "bot-old".to_string());
    h.runtime.seed(
        ContainerSpec {
            name: "botfleet-bot-old".to_string(),
            host_port: 18000,
            labels,
            ..Default::default()
        },
        ContainerState::Running,
    );

    assert_eq!(h.fleet.sync_from_runtime().await.unwrap(), 1);
    assert_eq!(h.fleet.sync_from_runtime().await.unwrap(), 0);

    let adopted = h.fleet.instance("bot-old").unwrap();
    assert_eq!(adopted.status, InstanceStatus::Running);
    assert_eq!(adopted.api_url, "http://127.0.0.1:18000");
    assert!(h.bridge.is_connected("bot-old"));

    // The adopted port is not handed out again
    let fresh = h.fleet.create_instance(InstanceConfig::default()).await.unwrap();
    assert_eq!(fresh.api_url, "http://127.0.0.1:18001");
}
