//! Fleet manager - instance lifecycle on the container runtime

use botfleet_bridge::{BridgeError, BridgeRegistry};
use botfleet_config::{RuntimeConfig, ScalingPolicy};
use botfleet_connectors::{
    ContainerRuntime, ContainerSpec, RuntimeError, WorkerEndpoint, INSTANCE_LABEL, MANAGED_LABEL,
};
use botfleet_metrics::FleetMetrics;
use botfleet_types::{
    short_id, spawn_periodic, EventBus, ExecutionStatus, FleetEvent, Instance, InstanceConfig,
    InstanceDirectory, InstanceId, InstanceStatus, ResourceUsage,
};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::scaling::{desired_count, plan_moves, removal_order, InstanceLoad};
use crate::{FleetError, HealthIssue, HealthStatus, RebalanceReport, ScaleReport, StopReport};

/// Grace period given to a worker container before it is killed
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Owns worker instances and keeps the fleet within its scaling policy
pub struct FleetManager {
    runtime: Arc<dyn ContainerRuntime>,
    bridge: Arc<BridgeRegistry>,
    config: RuntimeConfig,
    policy: ScalingPolicy,
    instances: DashMap<InstanceId, Instance>,
    ports: Mutex<BTreeSet<u16>>,
    /// Serializes scaling runs
    scale_lock: AsyncMutex<()>,
    /// Scale-up requests raised by recovery since the last scaling run
    pending_scale_up: AtomicUsize,
    events: EventBus,
    metrics: Arc<FleetMetrics>,
}

impl FleetManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        bridge: Arc<BridgeRegistry>,
        config: RuntimeConfig,
        policy: ScalingPolicy,
        events: EventBus,
        metrics: Arc<FleetMetrics>,
    ) -> Self {
        info!(
            "FLEET: Initialized (image {}, {}..={} instances)",
            config.image, policy.min_instances, policy.max_instances
        );
        Self {
            runtime,
            bridge,
            config,
            policy,
            instances: DashMap::new(),
            ports: Mutex::new(BTreeSet::new()),
            scale_lock: AsyncMutex::new(()),
            pending_scale_up: AtomicUsize::new(0),
            events,
            metrics,
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn bridge(&self) -> &Arc<BridgeRegistry> {
        &self.bridge
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Provision a container and wait until its worker accepts connections.
    /// A partially created container is torn down on failure.
    pub async fn create_instance(&self, request: InstanceConfig) -> Result<Instance, FleetError> {
        let id = short_id("bot");
        let name = request.name.clone().unwrap_or_else(|| id.clone());
        let image = request.image.clone().unwrap_or_else(|| self.config.image.clone());

        if let Err(e) = self.ensure_image(&image).await {
            self.metrics.provisioning_failures.inc();
            return Err(FleetError::Provisioning(format!("image {}: {}", image, e)));
        }

        let port = self.allocate_port();
        let spec = self.container_spec(&id, &name, &image, port, &request);

        let container_id = match self.runtime.create(&spec).await {
            Ok(container_id) => container_id,
            Err(e) => {
                self.release_port(port);
                self.metrics.provisioning_failures.inc();
                warn!(instance_id = %id, "FLEET: Container create failed: {}", e);
                return Err(FleetError::Provisioning(format!("create {}: {}", name, e)));
            }
        };

        let endpoint = WorkerEndpoint::for_host(&self.config.bind_host, port);
        let instance = Instance {
            id: id.clone(),
            name: name.clone(),
            container_id: container_id.clone(),
            api_url: endpoint.api_url.clone(),
            ws_url: endpoint.ws_url.clone(),
            status: InstanceStatus::Starting,
            resources: ResourceUsage::default(),
            strategies: Vec::new(),
            created_at: Utc::now(),
            last_health_check: None,
            recovery_attempts: 0,
            needs_manual_intervention: false,
        };
        self.instances.insert(id.clone(), instance);

        let started = match self.runtime.start(&container_id).await {
            Ok(()) => self.wait_ready(&id, &endpoint).await,
            Err(e) => Err(FleetError::Runtime(e)),
        };

        if let Err(e) = started {
            warn!(instance_id = %id, "FLEET: Provisioning failed, tearing down: {}", e);
            self.teardown(&id, &container_id, port).await;
            self.metrics.provisioning_failures.inc();
            return Err(FleetError::Provisioning(format!("{}: {}", name, e)));
        }

        self.set_status(&id, InstanceStatus::Running);
        self.metrics.instances_created.inc();
        info!(instance_id = %id, port, "FLEET: Instance {} running", name);
        self.events.publish(FleetEvent::InstanceCreated {
            instance_id: id.clone(),
            name,
        });

        self.instance(&id)
            .ok_or_else(|| FleetError::NotFound(id.clone()))
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.runtime.image_exists(image).await? {
            return Ok(());
        }
        info!("FLEET: Pulling worker image {}", image);
        self.runtime.pull_image(image).await
    }

    fn container_spec(
        &self,
        id: &str,
        name: &str,
        image: &str,
        port: u16,
        request: &InstanceConfig,
    ) -> ContainerSpec {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(INSTANCE_LABEL.to_string(), id.to_string());

        let mut environment = request.environment.clone();
        environment.insert("BOTFLEET_INSTANCE_ID".to_string(), id.to_string());

        ContainerSpec {
            name: format!("botfleet-{}", name),
            image: image.to_string(),
            api_port: self.config.api_port,
            host_port: port,
            bind_host: self.config.bind_host.clone(),
            cpu_limit: request.cpu_limit.unwrap_or(self.config.cpu_limit),
            memory_limit_mb: request.memory_limit_mb.unwrap_or(self.config.memory_limit_mb),
            environment,
            labels,
            network: self.config.network.clone(),
        }
    }

    /// Connect through the bridge until it succeeds or the startup timeout
    /// passes. Capacity errors end the wait immediately.
    async fn wait_ready(&self, id: &str, endpoint: &WorkerEndpoint) -> Result<(), FleetError> {
        let poll = Duration::from_millis(self.config.readiness_interval_ms.max(10));
        let attempt = async {
            loop {
                match self.bridge.connect(id, endpoint.clone()).await {
                    Ok(_) => return Ok(()),
                    Err(e @ BridgeError::Capacity(_)) => return Err(FleetError::Bridge(e)),
                    Err(e) => {
                        debug!(instance_id = id, "worker not ready: {}", e);
                        sleep(poll).await;
                    }
                }
            }
        };

        match timeout(self.config.startup_timeout(), attempt).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::Provisioning(format!(
                "worker {} not ready after {:?}",
                id,
                self.config.startup_timeout()
            ))),
        }
    }

    async fn teardown(&self, id: &str, container_id: &str, port: u16) {
        if self.bridge.is_connected(id) {
            let _ = self.bridge.disconnect(id).await;
        }
        if let Err(e) = self.runtime.stop(container_id, STOP_GRACE).await {
            debug!(instance_id = id, "stop during teardown: {}", e);
        }
        if let Err(e) = self.runtime.remove(container_id).await {
            warn!(instance_id = id, "FLEET: Could not remove container {}: {}", container_id, e);
        }
        self.instances.remove(id);
        self.release_port(port);
        self.refresh_gauges();
    }

    fn allocate_port(&self) -> u16 {
        let mut ports = self.ports.lock();
        let mut port = self.config.host_port_base;
        while ports.contains(&port) {
            port = port.saturating_add(1);
        }
        ports.insert(port);
        port
    }

    fn release_port(&self, port: u16) {
        self.ports.lock().remove(&port);
    }

    fn port_of(instance: &Instance) -> Option<u16> {
        instance
            .api_url
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
    }

    /// Remove an instance. Active strategies move to another running
    /// instance when one exists and are stopped otherwise.
    pub async fn remove_instance(&self, id: &str) -> Result<(), FleetError> {
        let instance = self
            .instances
            .get(id)
            .map(|i| i.value().clone())
            .ok_or_else(|| FleetError::NotFound(id.to_string()))?;

        for execution in self.bridge.executions_on(id) {
            match execution.status {
                ExecutionStatus::Active => {
                    let target = self.select_instance_excluding(Some(id));
                    let moved = match target {
                        Some(target) => self.bridge.relocate(&execution.id, &target).await.map(|_| ()),
                        None => self.bridge.stop(&execution.id, "instance removed").await,
                    };
                    if let Err(e) = moved {
                        warn!(instance_id = id, strategy_id = %execution.id, "FLEET: Could not move strategy: {}", e);
                    }
                }
                ExecutionStatus::Paused => {
                    if let Err(e) = self.bridge.stop(&execution.id, "instance removed").await {
                        warn!(instance_id = id, strategy_id = %execution.id, "FLEET: Could not stop paused strategy: {}", e);
                    }
                }
                _ => {}
            }
        }

        if self.bridge.connection(id).is_some() {
            if let Err(e) = self.bridge.disconnect(id).await {
                debug!(instance_id = id, "disconnect during removal: {}", e);
            }
        }
        if let Err(e) = self.runtime.stop(&instance.container_id, STOP_GRACE).await {
            debug!(instance_id = id, "stop during removal: {}", e);
        }
        match self.runtime.remove(&instance.container_id).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => {
                self.set_status(id, InstanceStatus::Error);
                return Err(FleetError::Runtime(e));
            }
        }

        self.instances.remove(id);
        if let Some(port) = Self::port_of(&instance) {
            self.release_port(port);
        }
        self.metrics.instances_removed.inc();
        self.refresh_gauges();
        info!(instance_id = id, "FLEET: Instance {} removed", instance.name);
        self.events.publish(FleetEvent::InstanceRemoved {
            instance_id: id.to_string(),
        });
        Ok(())
    }

    // ========================================================================
    // Scaling
    // ========================================================================

    /// Scale to an explicit count, or to the autoscaler's target when `None`
    pub async fn scale_to(&self, target: Option<usize>) -> Result<ScaleReport, FleetError> {
        let _scaling = self.scale_lock.lock().await;
        let current = self.instances.len();

        let desired = match target {
            Some(t) if t < self.policy.min_instances || t > self.policy.max_instances => {
                return Err(FleetError::InvalidTarget {
                    target: t,
                    min: self.policy.min_instances,
                    max: self.policy.max_instances,
                });
            }
            Some(t) => t,
            None => self.autoscale_target(),
        };
        self.pending_scale_up.store(0, Ordering::SeqCst);

        let mut report = ScaleReport {
            from: current,
            to: desired,
            ..Default::default()
        };
        if desired == current {
            return Ok(report);
        }

        self.events.publish(FleetEvent::ScaleRequested {
            from: current,
            to: desired,
            reason: match target {
                Some(_) => "explicit target".to_string(),
                None => "autoscale".to_string(),
            },
        });

        if desired > current {
            self.metrics.scale_events.with_label_values(&["up"]).inc();
            info!("FLEET: Scaling up {} -> {}", current, desired);
            for _ in current..desired {
                match self.create_instance(InstanceConfig::default()).await {
                    Ok(instance) => report.created.push(instance.id),
                    Err(e) => report.failures.push(e.to_string()),
                }
            }
        } else {
            self.metrics.scale_events.with_label_values(&["down"]).inc();
            info!("FLEET: Scaling down {} -> {}", current, desired);
            for id in removal_order(&self.loads()).into_iter().take(current - desired) {
                match self.remove_instance(&id).await {
                    Ok(()) => report.removed.push(id),
                    Err(e) => report.failures.push(format!("{}: {}", id, e)),
                }
            }
        }

        if !report.is_complete() {
            warn!(
                "FLEET: Scaling finished with {} failures",
                report.failures.len()
            );
        }
        Ok(report)
    }

    fn autoscale_target(&self) -> usize {
        let measured: Vec<ResourceUsage> = self
            .instances
            .iter()
            .filter(|i| i.status != InstanceStatus::Error)
            .map(|i| i.resources.clone())
            .collect();
        let count = measured.len().max(1) as f64;
        let avg_cpu = measured.iter().map(|r| r.cpu_percent).sum::<f64>() / count;
        let avg_memory = measured.iter().map(|r| r.memory_percent).sum::<f64>() / count;

        desired_count(
            self.instances.len(),
            avg_cpu,
            avg_memory,
            self.pending_scale_up.load(Ordering::SeqCst),
            &self.policy,
        )
    }

    pub fn pending_scale_up(&self) -> usize {
        self.pending_scale_up.load(Ordering::SeqCst)
    }

    fn loads(&self) -> Vec<InstanceLoad> {
        self.instances
            .iter()
            .map(|i| InstanceLoad {
                instance_id: i.id.clone(),
                strategies: self.strategies_on(&i.id),
                created_at: i.created_at,
            })
            .collect()
    }

    fn strategies_on(&self, id: &str) -> Vec<String> {
        self.bridge
            .executions_on(id)
            .into_iter()
            .filter(|e| !e.status.is_terminal())
            .map(|e| e.id)
            .collect()
    }

    // ========================================================================
    // Health and recovery
    // ========================================================================

    /// Check every instance: container state, worker ping, resources.
    /// Instances still starting or deliberately stopped are skipped.
    pub async fn health_check(&self) -> Vec<HealthStatus> {
        let snapshot: Vec<Instance> = self
            .instances
            .iter()
            .filter(|i| !matches!(i.status, InstanceStatus::Starting | InstanceStatus::Stopped))
            .map(|i| i.value().clone())
            .collect();
        let checks = snapshot.iter().map(|instance| self.check_instance(instance));
        let results = join_all(checks).await;

        for status in &results {
            self.apply_health(status);
        }
        results
    }

    async fn check_instance(&self, instance: &Instance) -> HealthStatus {
        let mut issues = Vec::new();
        let mut resources = instance.resources.clone();

        match self.runtime.inspect(&instance.container_id).await {
            Ok(info) if info.is_running() => {}
            Ok(_) => issues.push(HealthIssue::ContainerNotRunning),
            Err(e) => {
                debug!(instance_id = %instance.id, "inspect failed: {}", e);
                issues.push(HealthIssue::ContainerNotRunning);
            }
        }

        if issues.is_empty() {
            if let Err(e) = self.bridge.ping(&instance.id).await {
                debug!(instance_id = %instance.id, "ping failed: {}", e);
                issues.push(HealthIssue::ApiUnreachable);
            }

            match self.runtime.stats(&instance.container_id).await {
                Ok(stats) => {
                    resources = stats.into();
                    if resources.cpu_percent > self.policy.resource_threshold {
                        issues.push(HealthIssue::CpuExhausted);
                    }
                    if resources.memory_percent > self.policy.resource_threshold {
                        issues.push(HealthIssue::MemoryExhausted);
                    }
                }
                Err(e) => debug!(instance_id = %instance.id, "stats unavailable: {}", e),
            }
        }

        HealthStatus {
            instance_id: instance.id.clone(),
            healthy: issues.is_empty(),
            issues,
            resources,
            checked_at: Utc::now(),
        }
    }

    fn apply_health(&self, status: &HealthStatus) {
        let Some(mut instance) = self.instances.get_mut(&status.instance_id) else {
            return;
        };
        instance.resources = status.resources.clone();
        instance.last_health_check = Some(status.checked_at);
        if status.healthy {
            instance.recovery_attempts = 0;
        }
        let flagged = instance.needs_manual_intervention;
        drop(instance);

        if flagged {
            return;
        }
        let next = if status.healthy {
            InstanceStatus::Running
        } else {
            InstanceStatus::Unhealthy
        };
        self.set_status(&status.instance_id, next);
    }

    /// Try to bring an unhealthy instance back. After the configured number
    /// of attempts the instance is flagged for manual intervention instead.
    pub async fn recover(&self, id: &str, issues: &[HealthIssue]) -> Result<(), FleetError> {
        let (attempts, flagged) = {
            let mut instance = self
                .instances
                .get_mut(id)
                .ok_or_else(|| FleetError::NotFound(id.to_string()))?;
            if !instance.needs_manual_intervention {
                instance.recovery_attempts += 1;
            }
            (instance.recovery_attempts, instance.needs_manual_intervention)
        };

        if flagged {
            return Err(FleetError::ManualIntervention(id.to_string()));
        }
        if attempts > self.policy.max_recovery_attempts {
            self.flag_for_intervention(id, attempts - 1, issues);
            return Err(FleetError::ManualIntervention(id.to_string()));
        }

        let restart = issues
            .iter()
            .any(|i| matches!(i, HealthIssue::ContainerNotRunning | HealthIssue::ApiUnreachable));
        let exhausted = issues.iter().any(HealthIssue::is_resource);

        let mut outcome = Ok(());
        if restart {
            let action = if issues.contains(&HealthIssue::ContainerNotRunning) {
                "restart_container"
            } else {
                "restart_worker"
            };
            outcome = self.restart_worker(id).await;
            let label = if outcome.is_ok() { "success" } else { "failure" };
            self.metrics.recoveries.with_label_values(&[action, label]).inc();
        }
        if exhausted {
            self.request_scale_up(id);
            self.metrics
                .recoveries
                .with_label_values(&["scale_up", "requested"])
                .inc();
        }

        match &outcome {
            Ok(()) => info!(instance_id = id, attempt = attempts, "FLEET: Recovery action applied"),
            Err(e) => warn!(instance_id = id, attempt = attempts, "FLEET: Recovery failed: {}", e),
        }
        outcome
    }

    /// Restart the container and re-establish the worker connection.
    /// Strategies that were active are redeployed once the worker is back.
    async fn restart_worker(&self, id: &str) -> Result<(), FleetError> {
        let instance = self
            .instance(id)
            .ok_or_else(|| FleetError::NotFound(id.to_string()))?;
        let lost: Vec<_> = self
            .bridge
            .executions_on(id)
            .into_iter()
            .filter(|e| e.status == ExecutionStatus::Active)
            .collect();

        if self.bridge.connection(id).is_some() {
            if let Err(e) = self.bridge.disconnect(id).await {
                debug!(instance_id = id, "disconnect before restart: {}", e);
            }
        }
        self.set_status(id, InstanceStatus::Starting);
        let endpoint = WorkerEndpoint::new(&instance.api_url, &instance.ws_url);
        let restarted = match self.runtime.restart(&instance.container_id).await {
            Ok(()) => self.wait_ready(id, &endpoint).await,
            Err(e) => Err(FleetError::Runtime(e)),
        };
        if let Err(e) = restarted {
            self.set_status(id, InstanceStatus::Unhealthy);
            return Err(e);
        }
        self.set_status(id, InstanceStatus::Running);

        for execution in lost {
            if let Err(e) = self.bridge.deploy(id, execution.definition.clone()).await {
                warn!(instance_id = id, strategy_id = %execution.id, "FLEET: Could not restore strategy: {}", e);
            }
        }
        Ok(())
    }

    fn request_scale_up(&self, id: &str) {
        let pending = self.pending_scale_up.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.instances.len();
        info!(instance_id = id, "FLEET: Resource exhaustion, requesting scale-up");
        self.events.publish(FleetEvent::ScaleRequested {
            from: current,
            to: (current + pending).min(self.policy.max_instances),
            reason: format!("resource exhaustion on {}", id),
        });
    }

    fn flag_for_intervention(&self, id: &str, attempts: u32, issues: &[HealthIssue]) {
        if let Some(mut instance) = self.instances.get_mut(id) {
            instance.needs_manual_intervention = true;
            instance.recovery_attempts = attempts;
        }
        self.set_status(id, InstanceStatus::Error);
        error!(instance_id = id, attempts, "FLEET: Instance needs manual intervention");
        self.events.publish(FleetEvent::InstanceNeedsIntervention {
            instance_id: id.to_string(),
            attempts,
            issues: issues.iter().map(|i| i.as_str().to_string()).collect(),
        });
    }

    /// One health pass followed by recovery of unhealthy instances.
    /// Recovery failures are logged and retried on the next pass.
    pub async fn run_health_cycle(&self) -> Vec<HealthStatus> {
        let statuses = self.health_check().await;
        for status in statuses.iter().filter(|s| !s.healthy) {
            let flagged = self
                .instances
                .get(&status.instance_id)
                .map(|i| i.needs_manual_intervention)
                .unwrap_or(true);
            if flagged {
                continue;
            }
            if let Err(e) = self.recover(&status.instance_id, &status.issues).await {
                debug!(instance_id = %status.instance_id, "recovery pending: {}", e);
            }
        }
        statuses
    }

    // ========================================================================
    // Placement
    // ========================================================================

    /// Running instance with the fewest active strategies, ties by id
    pub fn select_instance(&self) -> Option<InstanceId> {
        self.select_instance_excluding(None)
    }

    fn select_instance_excluding(&self, excluded: Option<&str>) -> Option<InstanceId> {
        self.instances
            .iter()
            .filter(|i| i.is_running() && Some(i.id.as_str()) != excluded)
            .filter(|i| self.bridge.is_connected(&i.id))
            .map(|i| (self.bridge.active_count(&i.id), i.id.clone()))
            .min()
            .map(|(_, id)| id)
    }

    /// Move strategies from overloaded to underloaded instances
    pub async fn rebalance_load(&self) -> RebalanceReport {
        let loads: Vec<InstanceLoad> = self
            .loads()
            .into_iter()
            .filter(|l| self.is_instance_healthy(&l.instance_id))
            .map(|mut l| {
                l.strategies.retain(|s| {
                    self.bridge
                        .execution(s)
                        .map(|e| e.status == ExecutionStatus::Active)
                        .unwrap_or(false)
                });
                l
            })
            .collect();

        let mut report = RebalanceReport::default();
        for planned in plan_moves(&loads) {
            match self.bridge.relocate(&planned.strategy_id, &planned.to).await {
                Ok(_) => report.moved.push(planned),
                Err(e) => {
                    warn!(strategy_id = %planned.strategy_id, "FLEET: Rebalance move failed: {}", e);
                    report.failed.push((planned, e.to_string()));
                }
            }
        }
        if !report.moved.is_empty() {
            info!("FLEET: Rebalanced {} strategies", report.moved.len());
        }
        report
    }

    // ========================================================================
    // Bulk operations
    // ========================================================================

    /// Stop every container; failures are collected
    pub async fn stop_all_instances(&self) -> StopReport {
        let snapshot: Vec<Instance> = self.instances.iter().map(|i| i.value().clone()).collect();
        let mut report = StopReport::default();

        for instance in snapshot {
            match self.runtime.stop(&instance.container_id, STOP_GRACE).await {
                Ok(()) => {
                    report.stopped += 1;
                    self.set_status(&instance.id, InstanceStatus::Stopped);
                }
                Err(e) => report.errors.push(format!("{}: {}", instance.id, e)),
            }
        }
        info!(
            "FLEET: Stopped {} instances ({} errors)",
            report.stopped,
            report.errors.len()
        );
        report
    }

    /// Adopt managed containers left by a previous run. Returns how many
    /// were adopted.
    pub async fn sync_from_runtime(&self) -> Result<usize, FleetError> {
        let mut adopted = 0;
        for info in self.runtime.list_managed().await? {
            let Some(id) = info.instance_id().map(str::to_string) else {
                continue;
            };
            if self.instances.contains_key(&id) {
                continue;
            }
            let Some(port) = info.host_port else {
                warn!(instance_id = %id, "FLEET: Managed container without published port, skipping");
                continue;
            };

            self.ports.lock().insert(port);
            let endpoint = WorkerEndpoint::for_host(&self.config.bind_host, port);
            let status = if !info.is_running() {
                InstanceStatus::Stopped
            } else if self.bridge.connect(&id, endpoint.clone()).await.is_ok() {
                InstanceStatus::Running
            } else {
                InstanceStatus::Unhealthy
            };

            self.instances.insert(
                id.clone(),
                Instance {
                    id: id.clone(),
                    name: info.name.trim_start_matches('/').to_string(),
                    container_id: info.id.clone(),
                    api_url: endpoint.api_url,
                    ws_url: endpoint.ws_url,
                    status,
                    resources: ResourceUsage::default(),
                    strategies: Vec::new(),
                    created_at: Utc::now(),
                    last_health_check: None,
                    recovery_attempts: 0,
                    needs_manual_intervention: false,
                },
            );
            adopted += 1;
            info!(instance_id = %id, status = status.as_str(), "FLEET: Adopted container {}", info.id);
        }
        self.refresh_gauges();
        Ok(adopted)
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn instance(&self, id: &str) -> Option<Instance> {
        self.instances.get(id).map(|i| {
            let mut instance = i.value().clone();
            instance.strategies = self.strategies_on(id);
            instance
        })
    }

    /// All instances, sorted by creation time
    pub fn instances(&self) -> Vec<Instance> {
        let ids: Vec<InstanceId> = self.instances.iter().map(|i| i.id.clone()).collect();
        let mut all: Vec<Instance> = ids.iter().filter_map(|id| self.instance(id)).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn set_status(&self, id: &str, status: InstanceStatus) {
        let previous = match self.instances.get_mut(id) {
            Some(mut instance) => std::mem::replace(&mut instance.status, status),
            None => return,
        };
        if previous != status {
            debug!(instance_id = id, from = previous.as_str(), to = status.as_str(), "instance status");
            self.events.publish(FleetEvent::InstanceStatusChanged {
                instance_id: id.to_string(),
                from: previous,
                to: status,
            });
        }
        self.refresh_gauges();
    }

    fn refresh_gauges(&self) {
        for status in [
            InstanceStatus::Starting,
            InstanceStatus::Running,
            InstanceStatus::Unhealthy,
            InstanceStatus::Stopped,
            InstanceStatus::Error,
        ] {
            let count = self.instances.iter().filter(|i| i.status == status).count();
            self.metrics
                .instances
                .with_label_values(&[status.as_str()])
                .set(count as i64);
        }
    }

    // ========================================================================
    // Periodic loops
    // ========================================================================

    /// Health checks with recovery, every `health_check_interval_secs`
    pub fn spawn_health_loop(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let fleet = self.clone();
        let period = Duration::from_secs(self.policy.health_check_interval_secs.max(1));
        spawn_periodic("health", period, shutdown, move || {
            let fleet = fleet.clone();
            async move {
                fleet.run_health_cycle().await;
            }
        })
    }

    /// Autoscaling, when enabled
    pub fn spawn_scaling_loop(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let fleet = self.clone();
        let period = Duration::from_secs(self.policy.scale_interval_secs.max(1));
        spawn_periodic("scaling", period, shutdown, move || {
            let fleet = fleet.clone();
            async move {
                if !fleet.policy.auto_scaling {
                    return;
                }
                if let Err(e) = fleet.scale_to(None).await {
                    warn!("FLEET: Autoscale failed: {}", e);
                }
            }
        })
    }

    pub fn spawn_rebalance_loop(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let fleet = self.clone();
        let period = Duration::from_secs(self.policy.rebalance_interval_secs.max(1));
        spawn_periodic("rebalance", period, shutdown, move || {
            let fleet = fleet.clone();
            async move {
                fleet.rebalance_load().await;
            }
        })
    }
}

impl InstanceDirectory for FleetManager {
    fn is_instance_healthy(&self, instance_id: &str) -> bool {
        self.instances
            .get(instance_id)
            .map(|i| i.is_running() && !i.needs_manual_intervention)
            .unwrap_or(false)
    }

    fn running_instances(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|i| i.is_running())
            .map(|i| i.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botfleet_config::{BridgeConfig, PlatformLimits};
    use botfleet_connectors::testing::{FakeRuntime, FakeWorker};
    use botfleet_metrics::{BridgeMetrics, Registry};

    fn fleet(runtime: Arc<FakeRuntime>, worker: Arc<FakeWorker>) -> FleetManager {
        let registry = Registry::new();
        let events = EventBus::default();
        let bridge = Arc::new(BridgeRegistry::new(
            worker,
            BridgeConfig::default(),
            PlatformLimits::default(),
            events.clone(),
            Arc::new(BridgeMetrics::new(&registry)),
        ));
        FleetManager::new(
            runtime,
            bridge,
            RuntimeConfig {
                readiness_interval_ms: 20,
                startup_timeout_secs: 1,
                ..Default::default()
            },
            ScalingPolicy::default(),
            events,
            Arc::new(FleetMetrics::new(&registry)),
        )
    }

    #[tokio::test]
    async fn test_ports_are_reused_after_release() {
        let fleet = fleet(Arc::new(FakeRuntime::new()), Arc::new(FakeWorker::new()));
        let a = fleet.allocate_port();
        let b = fleet.allocate_port();
        assert_eq!((a, b), (18000, 18001));

        fleet.release_port(a);
        assert_eq!(fleet.allocate_port(), 18000);
        assert_eq!(fleet.allocate_port(), 18002);
    }

    #[tokio::test]
    async fn test_container_spec_is_labelled() {
        let fleet = fleet(Arc::new(FakeRuntime::new()), Arc::new(FakeWorker::new()));
        let spec = fleet.container_spec(
            "bot-1",
            "alpha",
            "botfleet/worker:latest",
            18005,
            &InstanceConfig {
                cpu_limit: Some(2.0),
                ..Default::default()
            },
        );

        assert_eq!(spec.labels[MANAGED_LABEL], "true");
        assert_eq!(spec.labels[INSTANCE_LABEL], "bot-1");
        assert_eq!(spec.environment["BOTFLEET_INSTANCE_ID"], "bot-1");
        assert_eq!(spec.cpu_limit, 2.0);
        assert_eq!(spec.memory_limit_mb, 1024);
        assert_eq!(spec.host_port, 18005);
    }

    #[test]
    fn test_port_from_api_url() {
        let instance = Instance {
            id: "bot-1".into(),
            name: "bot-1".into(),
            container_id: "ctr-1".into(),
            api_url: "http://127.0.0.1:18003".into(),
            ws_url: "ws://127.0.0.1:18003/ws".into(),
            status: InstanceStatus::Running,
            resources: ResourceUsage::default(),
            strategies: Vec::new(),
            created_at: Utc::now(),
            last_health_check: None,
            recovery_attempts: 0,
            needs_manual_intervention: false,
        };
        assert_eq!(FleetManager::port_of(&instance), Some(18003));
    }
}
