//! Container runtime
//!
//! [`DockerRuntime`] talks to the Docker Engine HTTP API. Managed containers
//! carry the `botfleet.managed=true` and `botfleet.instance=<id>` labels so a
//! restarted daemon can find them again.

use async_trait::async_trait;
use botfleet_types::{Retryable, ResourceUsage};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const MANAGED_LABEL: &str = "botfleet.managed";
pub const INSTANCE_LABEL: &str = "botfleet.instance";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Runtime connection error: {0}")]
    Connection(String),

    #[error("Runtime request timed out")]
    Timeout,

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Runtime API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid runtime response: {0}")]
    Decode(String),
}

impl Retryable for RuntimeError {
    fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Connection(_) | RuntimeError::Timeout => true,
            RuntimeError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RuntimeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RuntimeError::Timeout
        } else if err.is_decode() {
            RuntimeError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            RuntimeError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            RuntimeError::Connection(err.to_string())
        }
    }
}

/// What to run
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Port the worker listens on inside the container
    pub api_port: u16,
    /// Host port the worker port is published on
    pub host_port: u16,
    pub bind_host: String,
    /// CPU limit in cores
    pub cpu_limit: f64,
    pub memory_limit_mb: u64,
    pub environment: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub network: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(state: &str) -> Self {
        match state {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
    /// Host port the worker API is published on, when known
    pub host_port: Option<u16>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.labels.get(INSTANCE_LABEL).map(String::as_str)
    }
}

/// Point-in-time resource statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

impl From<ContainerStats> for ResourceUsage {
    fn from(stats: ContainerStats) -> Self {
        ResourceUsage {
            cpu_percent: stats.cpu_percent,
            memory_percent: stats.memory_percent,
            network_rx_bytes: stats.network_rx_bytes,
            network_tx_bytes: stats.network_tx_bytes,
            disk_read_bytes: stats.disk_read_bytes,
            disk_write_bytes: stats.disk_write_bytes,
        }
    }
}

/// Lifecycle operations on isolated worker processes
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a container and return its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn restart(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo, RuntimeError>;

    async fn stats(&self, container_id: &str) -> Result<ContainerStats, RuntimeError>;

    /// All containers carrying the managed label, running or not
    async fn list_managed(&self) -> Result<Vec<ContainerInfo>, RuntimeError>;
}

/// CPU percent from two cumulative readings
///
/// `(Δcontainer / Δsystem) × online CPUs × 100`; zero when the system delta is
/// not positive.
pub fn cpu_percent(
    container_total: u64,
    container_previous: u64,
    system_total: u64,
    system_previous: u64,
    online_cpus: u32,
) -> f64 {
    let container_delta = container_total.saturating_sub(container_previous) as f64;
    let system_delta = system_total.saturating_sub(system_previous) as f64;
    if system_delta <= 0.0 || container_delta < 0.0 {
        return 0.0;
    }
    container_delta / system_delta * online_cpus.max(1) as f64 * 100.0
}

// ============================================================================
// Docker Engine wire types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateBody {
    image: String,
    env: Vec<String>,
    labels: HashMap<String, String>,
    exposed_ports: HashMap<String, serde_json::Value>,
    host_config: HostConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    port_bindings: HashMap<String, Vec<PortBinding>>,
    nano_cpus: i64,
    memory: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    network_mode: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectResponse {
    id: String,
    name: String,
    state: InspectState,
    config: InspectConfig,
    network_settings: InspectNetwork,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    state: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    ports: Vec<ListPort>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListPort {
    private_port: u16,
    #[serde(default)]
    public_port: Option<u16>,
}

#[derive(Deserialize, Default)]
struct StatsResponse {
    #[serde(default)]
    cpu_stats: CpuStats,
    #[serde(default)]
    precpu_stats: CpuStats,
    #[serde(default)]
    memory_stats: MemoryStats,
    #[serde(default)]
    networks: Option<HashMap<String, NetworkStats>>,
    #[serde(default)]
    blkio_stats: BlkioStats,
}

#[derive(Deserialize, Default)]
struct CpuStats {
    #[serde(default)]
    cpu_usage: CpuUsage,
    #[serde(default)]
    system_cpu_usage: Option<u64>,
    #[serde(default)]
    online_cpus: Option<u32>,
}

#[derive(Deserialize, Default)]
struct CpuUsage {
    #[serde(default)]
    total_usage: u64,
}

#[derive(Deserialize, Default)]
struct MemoryStats {
    #[serde(default)]
    usage: Option<u64>,
    #[serde(default)]
    limit: Option<u64>,
}

#[derive(Deserialize, Default)]
struct NetworkStats {
    #[serde(default)]
    rx_bytes: u64,
    #[serde(default)]
    tx_bytes: u64,
}

#[derive(Deserialize, Default)]
struct BlkioStats {
    #[serde(default)]
    io_service_bytes_recursive: Option<Vec<BlkioEntry>>,
}

#[derive(Deserialize)]
struct BlkioEntry {
    op: String,
    value: u64,
}

impl StatsResponse {
    fn into_stats(self) -> ContainerStats {
        let cpu_percent = cpu_percent(
            self.cpu_stats.cpu_usage.total_usage,
            self.precpu_stats.cpu_usage.total_usage,
            self.cpu_stats.system_cpu_usage.unwrap_or(0),
            self.precpu_stats.system_cpu_usage.unwrap_or(0),
            self.cpu_stats.online_cpus.unwrap_or(1),
        );

        let usage = self.memory_stats.usage.unwrap_or(0);
        let memory_percent = match self.memory_stats.limit {
            Some(limit) if limit > 0 => usage as f64 / limit as f64 * 100.0,
            _ => 0.0,
        };

        let (network_rx_bytes, network_tx_bytes) = self
            .networks
            .unwrap_or_default()
            .values()
            .fold((0, 0), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes));

        let mut disk_read_bytes = 0;
        let mut disk_write_bytes = 0;
        for entry in self.blkio_stats.io_service_bytes_recursive.unwrap_or_default() {
            match entry.op.to_ascii_lowercase().as_str() {
                "read" => disk_read_bytes += entry.value,
                "write" => disk_write_bytes += entry.value,
                _ => {}
            }
        }

        ContainerStats {
            cpu_percent,
            memory_percent,
            memory_usage_bytes: usage,
            network_rx_bytes,
            network_tx_bytes,
            disk_read_bytes,
            disk_write_bytes,
        }
    }
}

// ============================================================================
// Docker client
// ============================================================================

/// Docker Engine API client
pub struct DockerRuntime {
    client: Client,
    base_url: String,
    api_port: u16,
}

impl DockerRuntime {
    /// `base_url` is the engine endpoint, e.g. `http://127.0.0.1:2375`;
    /// `api_port` is the worker port inside the container
    pub fn new(base_url: &str, api_port: u16, timeout: Duration) -> Result<Self, RuntimeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_port,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, RuntimeError> {
        let mut request = self.client.request(method, self.url(path)).query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }

        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| status.to_string());

        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(message));
        }
        Err(RuntimeError::Api {
            status: status.as_u16(),
            message,
        })
    }

    fn port_key(&self) -> String {
        format!("{}/tcp", self.api_port)
    }
}

/// `repo:tag` split, tolerating registry ports (`host:5000/repo`)
fn split_image(image: &str) -> (&str, &str) {
    match image.rfind(':') {
        Some(idx) if !image[idx..].contains('/') => (&image[..idx], &image[idx + 1..]),
        _ => (image, "latest"),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let filters = serde_json::json!({ "reference": [image] }).to_string();
        let response = self
            .send(Method::GET, "/images/json", &[("filters", filters)], None)
            .await?;
        let images: Vec<serde_json::Value> = response.json().await?;
        Ok(!images.is_empty())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let (repo, tag) = split_image(image);
        info!(image, "RUNTIME: pulling worker image");
        let response = self
            .send(
                Method::POST,
                "/images/create",
                &[("fromImage", repo.to_string()), ("tag", tag.to_string())],
                None,
            )
            .await?;
        // The engine streams progress; the pull is done once the body ends
        let _ = response.bytes().await?;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let port_key = self.port_key();
        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let body = CreateBody {
            image: spec.image.clone(),
            env: spec
                .environment
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            labels,
            exposed_ports: HashMap::from([(port_key.clone(), serde_json::json!({}))]),
            host_config: HostConfig {
                port_bindings: HashMap::from([(
                    port_key,
                    vec![PortBinding {
                        host_ip: spec.bind_host.clone(),
                        host_port: spec.host_port.to_string(),
                    }],
                )]),
                nano_cpus: (spec.cpu_limit * 1e9) as i64,
                memory: (spec.memory_limit_mb * 1024 * 1024) as i64,
                network_mode: spec.network.clone(),
            },
        };
        let body = serde_json::to_value(&body).map_err(|e| RuntimeError::Decode(e.to_string()))?;

        let response = self
            .send(
                Method::POST,
                "/containers/create",
                &[("name", spec.name.clone())],
                Some(body),
            )
            .await?;
        let created: CreateResponse = response.json().await?;
        debug!(container_id = %created.id, name = %spec.name, "container created");
        Ok(created.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.send(Method::POST, &format!("/containers/{}/start", container_id), &[], None)
            .await?;
        Ok(())
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.send(
            Method::POST,
            &format!("/containers/{}/stop", container_id),
            &[("t", grace.as_secs().to_string())],
            None,
        )
        .await?;
        Ok(())
    }

    async fn restart(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.send(Method::POST, &format!("/containers/{}/restart", container_id), &[], None)
            .await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.send(
            Method::DELETE,
            &format!("/containers/{}", container_id),
            &[("force", "true".to_string())],
            None,
        )
        .await?;
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo, RuntimeError> {
        let response = self
            .send(Method::GET, &format!("/containers/{}/json", container_id), &[], None)
            .await?;
        let inspected: InspectResponse = response.json().await?;

        let host_port = inspected
            .network_settings
            .ports
            .as_ref()
            .and_then(|ports| ports.get(&self.port_key()))
            .and_then(|bindings| bindings.as_ref())
            .and_then(|bindings| bindings.first())
            .and_then(|binding| binding.host_port.parse().ok());

        Ok(ContainerInfo {
            id: inspected.id,
            name: inspected.name.trim_start_matches('/').to_string(),
            state: ContainerState::parse(&inspected.state.status),
            labels: inspected.config.labels.unwrap_or_default(),
            host_port,
        })
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats, RuntimeError> {
        let response = self
            .send(
                Method::GET,
                &format!("/containers/{}/stats", container_id),
                &[("stream", "false".to_string())],
                None,
            )
            .await?;
        let stats: StatsResponse = response.json().await?;
        Ok(stats.into_stats())
    }

    async fn list_managed(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let filters =
            serde_json::json!({ "label": [format!("{}=true", MANAGED_LABEL)] }).to_string();
        let response = self
            .send(
                Method::GET,
                "/containers/json",
                &[("all", "true".to_string()), ("filters", filters)],
                None,
            )
            .await?;
        let entries: Vec<ListEntry> = response.json().await?;

        Ok(entries
            .into_iter()
            .map(|entry| ContainerInfo {
                host_port: entry
                    .ports
                    .iter()
                    .find(|p| p.private_port == self.api_port)
                    .and_then(|p| p.public_port),
                id: entry.id,
                name: entry
                    .names
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                state: ContainerState::parse(&entry.state),
                labels: entry.labels.unwrap_or_default(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_percent() {
        // 200 of 1000 system ticks across 4 CPUs
        let pct = cpu_percent(1_200, 1_000, 11_000, 10_000, 4);
        assert!((pct - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_percent_without_system_delta() {
        assert_eq!(cpu_percent(1_200, 1_000, 10_000, 10_000, 4), 0.0);
    }

    #[test]
    fn test_stats_decoding() {
        let json = r#"{
            "cpu_stats": {"cpu_usage": {"total_usage": 400}, "system_cpu_usage": 2000, "online_cpus": 2},
            "precpu_stats": {"cpu_usage": {"total_usage": 200}, "system_cpu_usage": 1000},
            "memory_stats": {"usage": 256, "limit": 1024},
            "networks": {"eth0": {"rx_bytes": 10, "tx_bytes": 20}, "eth1": {"rx_bytes": 1, "tx_bytes": 2}},
            "blkio_stats": {"io_service_bytes_recursive": [
                {"major": 8, "minor": 0, "op": "Read", "value": 100},
                {"major": 8, "minor": 0, "op": "write", "value": 50}
            ]}
        }"#;
        let stats = serde_json::from_str::<StatsResponse>(json).unwrap().into_stats();

        assert!((stats.cpu_percent - 40.0).abs() < 1e-9);
        assert!((stats.memory_percent - 25.0).abs() < 1e-9);
        assert_eq!(stats.network_rx_bytes, 11);
        assert_eq!(stats.network_tx_bytes, 22);
        assert_eq!(stats.disk_read_bytes, 100);
        assert_eq!(stats.disk_write_bytes, 50);
    }

    #[test]
    fn test_split_image() {
        assert_eq!(split_image("botfleet/worker:1.2"), ("botfleet/worker", "1.2"));
        assert_eq!(split_image("botfleet/worker"), ("botfleet/worker", "latest"));
        assert_eq!(split_image("registry:5000/worker"), ("registry:5000/worker", "latest"));
    }

    #[test]
    fn test_retryable_runtime_errors() {
        assert!(RuntimeError::Timeout.is_retryable());
        assert!(RuntimeError::Api { status: 503, message: String::new() }.is_retryable());
        assert!(!RuntimeError::NotFound("x".into()).is_retryable());
    }
}
