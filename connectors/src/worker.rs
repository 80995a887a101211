//! Worker HTTP API client
//!
//! Every running instance exposes a REST API for strategy CRUD and health, plus
//! a WebSocket metrics stream. [`HttpWorkerClient`] is stateless with respect
//! to instances: each call names the [`WorkerEndpoint`] it targets.

use async_trait::async_trait;
use botfleet_types::{ParamValue, Retryable};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::stream::{spawn_metrics_stream, MetricsSubscription, StreamConfig};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    #[error("Worker connection error: {0}")]
    Connection(String),

    #[error("Worker request timed out")]
    Timeout,

    #[error("Worker HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Worker rejected strategy: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Invalid worker response: {0}")]
    Decode(String),

    #[error("Not found on worker: {0}")]
    NotFound(String),
}

impl Retryable for WorkerError {
    fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Connection(_) | WorkerError::Timeout => true,
            WorkerError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WorkerError::Timeout
        } else if err.is_connect() {
            WorkerError::Connection(err.to_string())
        } else if err.is_decode() {
            WorkerError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            WorkerError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            WorkerError::Connection(err.to_string())
        }
    }
}

/// Where a worker can be reached
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerEndpoint {
    /// REST base URL, e.g. `http://127.0.0.1:18001`
    pub api_url: String,
    /// Metrics stream URL, e.g. `ws://127.0.0.1:18001/ws`
    pub ws_url: String,
}

impl WorkerEndpoint {
    pub fn new(api_url: &str, ws_url: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.to_string(),
        }
    }

    /// Endpoint for a worker published on `host:port`
    pub fn for_host(host: &str, port: u16) -> Self {
        Self::new(
            &format!("http://{}:{}", host, port),
            &format!("ws://{}:{}/ws", host, port),
        )
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Risk limits as the worker expects them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRiskLimits {
    pub max_position_size: f64,
    pub max_daily_loss: f64,
    pub max_open_orders: u32,
    pub max_slippage: f64,
    pub max_leverage: f64,
}

/// Strategy configuration in the worker's wire format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStrategyConfig {
    /// Strategy template name, e.g. `pure_market_making`
    pub strategy: String,
    pub name: String,
    pub exchange: String,
    pub market: String,
    pub parameters: BTreeMap<String, ParamValue>,
    pub risk_limits: WorkerRiskLimits,
    pub order_refresh_time: f64,
    pub order_amount: f64,
    pub paper_trading: bool,
    pub simulation_mode: bool,
    pub kill_switch_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_switch_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub uptime_secs: Option<f64>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        matches!(self.status.as_str(), "ok" | "healthy")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedHealth {
    pub status: String,
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    #[serde(default)]
    pub active_strategies: u32,
    /// Strategy templates the worker can run
    #[serde(default)]
    pub supported_strategies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CreatedStrategy {
    id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStrategy {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

/// Metrics as reported by the worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerMetrics {
    pub trades: u64,
    pub volume: f64,
    pub pnl: f64,
    pub latency_ms: f64,
    pub fill_rate: f64,
    pub slippage: f64,
    pub error_count: u32,
    pub risk_exposure: f64,
    pub drawdown: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOrder {
    pub id: String,
    pub side: String,
    pub price: f64,
    pub amount: f64,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CancelReport {
    #[serde(default)]
    cancelled: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    detail: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorBody {
    /// Worker messages, verbatim
    fn messages(self) -> Vec<String> {
        if !self.errors.is_empty() {
            return self.errors;
        }
        match self.detail {
            Some(serde_json::Value::String(s)) => return vec![s],
            Some(serde_json::Value::Array(items)) => {
                return items
                    .into_iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => s,
                        other => other
                            .get("msg")
                            .and_then(|m| m.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| other.to_string()),
                    })
                    .collect()
            }
            _ => {}
        }
        self.message.into_iter().collect()
    }
}

// ============================================================================
// API
// ============================================================================

/// Worker control API
#[async_trait]
pub trait WorkerApi: Send + Sync {
    async fn health(&self, endpoint: &WorkerEndpoint) -> Result<HealthReport, WorkerError>;

    async fn detailed_health(&self, endpoint: &WorkerEndpoint) -> Result<DetailedHealth, WorkerError>;

    async fn validate_strategy(
        &self,
        endpoint: &WorkerEndpoint,
        config: &WorkerStrategyConfig,
    ) -> Result<ValidationResponse, WorkerError>;

    /// Create a strategy and return the worker-side id
    async fn create_strategy(
        &self,
        endpoint: &WorkerEndpoint,
        config: &WorkerStrategyConfig,
    ) -> Result<String, WorkerError>;

    async fn get_strategy(
        &self,
        endpoint: &WorkerEndpoint,
        strategy_id: &str,
    ) -> Result<WorkerStrategy, WorkerError>;

    async fn start_strategy(&self, endpoint: &WorkerEndpoint, strategy_id: &str) -> Result<(), WorkerError>;

    async fn stop_strategy(&self, endpoint: &WorkerEndpoint, strategy_id: &str) -> Result<(), WorkerError>;

    async fn strategy_metrics(
        &self,
        endpoint: &WorkerEndpoint,
        strategy_id: &str,
    ) -> Result<WorkerMetrics, WorkerError>;

    async fn strategy_orders(
        &self,
        endpoint: &WorkerEndpoint,
        strategy_id: &str,
    ) -> Result<Vec<WorkerOrder>, WorkerError>;

    /// Cancel open orders; returns how many were cancelled
    async fn cancel_orders(&self, endpoint: &WorkerEndpoint, strategy_id: &str) -> Result<u32, WorkerError>;

    async fn subscribe_metrics(
        &self,
        endpoint: &WorkerEndpoint,
        strategy_id: &str,
    ) -> Result<MetricsSubscription, WorkerError>;
}

/// Stream reconnect settings used for every subscription
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub ping_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_reconnects: u32,
    pub connect_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            max_reconnects: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// REST + WebSocket worker client
pub struct HttpWorkerClient {
    client: Client,
    stream: StreamSettings,
}

impl HttpWorkerClient {
    pub fn new(request_timeout: Duration, stream: StreamSettings) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| WorkerError::Connection(e.to_string()))?;
        Ok(Self { client, stream })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &WorkerEndpoint,
        path: &str,
        body: Option<&WorkerStrategyConfig>,
    ) -> Result<T, WorkerError> {
        let url = format!("{}{}", endpoint.api_url, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes().await?;
            // Empty bodies decode as JSON null
            let bytes = if bytes.is_empty() { &b"null"[..] } else { &bytes[..] };
            return serde_json::from_slice(bytes).map_err(|e| WorkerError::Decode(e.to_string()));
        }

        let text = response.text().await.unwrap_or_default();
        Err(Self::classify(status, path, &text))
    }

    fn classify(status: StatusCode, path: &str, body: &str) -> WorkerError {
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                let messages = serde_json::from_str::<ErrorBody>(body)
                    .map(ErrorBody::messages)
                    .unwrap_or_default();
                if messages.is_empty() {
                    WorkerError::Validation(vec![body.to_string()])
                } else {
                    WorkerError::Validation(messages)
                }
            }
            StatusCode::NOT_FOUND => WorkerError::NotFound(path.to_string()),
            _ => WorkerError::Http {
                status: status.as_u16(),
                message: if body.is_empty() {
                    status.to_string()
                } else {
                    body.to_string()
                },
            },
        }
    }
}

#[async_trait]
impl WorkerApi for HttpWorkerClient {
    async fn health(&self, endpoint: &WorkerEndpoint) -> Result<HealthReport, WorkerError> {
        self.request(Method::GET, endpoint, "/health", None).await
    }

    async fn detailed_health(&self, endpoint: &WorkerEndpoint) -> Result<DetailedHealth, WorkerError> {
        self.request(Method::GET, endpoint, "/health/detailed", None).await
    }

    async fn validate_strategy(
        &self,
        endpoint: &WorkerEndpoint,
        config: &WorkerStrategyConfig,
    ) -> Result<ValidationResponse, WorkerError> {
        self.request(Method::POST, endpoint, "/strategies/validate", Some(config))
            .await
    }

    async fn create_strategy(
        &self,
        endpoint: &WorkerEndpoint,
        config: &WorkerStrategyConfig,
    ) -> Result<String, WorkerError> {
        let created: CreatedStrategy = self
            .request(Method::POST, endpoint, "/strategies", Some(config))
            .await?;
        Ok(created.id)
    }

    async fn get_strategy(
        &self,
        endpoint: &WorkerEndpoint,
        strategy_id: &str,
    ) -> Result<WorkerStrategy, WorkerError> {
        self.request(Method::GET, endpoint, &format!("/strategies/{}", strategy_id), None)
            .await
    }

    async fn start_strategy(&self, endpoint: &WorkerEndpoint, strategy_id: &str) -> Result<(), WorkerError> {
        let _: serde_json::Value = self
            .request(Method::POST, endpoint, &format!("/strategies/{}/start", strategy_id), None)
            .await?;
        Ok(())
    }

    async fn stop_strategy(&self, endpoint: &WorkerEndpoint, strategy_id: &str) -> Result<(), WorkerError> {
        let _: serde_json::Value = self
            .request(Method::POST, endpoint, &format!("/strategies/{}/stop", strategy_id), None)
            .await?;
        Ok(())
    }

    async fn strategy_metrics(
        &self,
        endpoint: &WorkerEndpoint,
        strategy_id: &str,
    ) -> Result<WorkerMetrics, WorkerError> {
        self.request(Method::GET, endpoint, &format!("/strategies/{}/metrics", strategy_id), None)
            .await
    }

    async fn strategy_orders(
        &self,
        endpoint: &WorkerEndpoint,
        strategy_id: &str,
    ) -> Result<Vec<WorkerOrder>, WorkerError> {
        self.request(Method::GET, endpoint, &format!("/strategies/{}/orders", strategy_id), None)
            .await
    }

    async fn cancel_orders(&self, endpoint: &WorkerEndpoint, strategy_id: &str) -> Result<u32, WorkerError> {
        let report: Option<CancelReport> = self
            .request(Method::DELETE, endpoint, &format!("/strategies/{}/orders", strategy_id), None)
            .await?;
        Ok(report.map(|r| r.cancelled).unwrap_or(0))
    }

    async fn subscribe_metrics(
        &self,
        endpoint: &WorkerEndpoint,
        strategy_id: &str,
    ) -> Result<MetricsSubscription, WorkerError> {
        let config = StreamConfig {
            url: endpoint.ws_url.clone(),
            strategy_id: strategy_id.to_string(),
            initial_reconnect_delay_ms: self.stream.reconnect_base.as_millis() as u64,
            max_reconnect_delay_ms: self.stream.reconnect_max.as_millis() as u64,
            max_reconnect_attempts: self.stream.max_reconnects,
            ping_interval_ms: self.stream.ping_interval.as_millis() as u64,
            connect_timeout_ms: self.stream.connect_timeout.as_millis() as u64,
        };
        Ok(spawn_metrics_stream(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages_are_verbatim() {
        let err = HttpWorkerClient::classify(
            StatusCode::UNPROCESSABLE_ENTITY,
            "/strategies/validate",
            r#"{"errors": ["bid_spread must be positive", "unknown exchange: ftx"]}"#,
        );
        assert_eq!(
            err,
            WorkerError::Validation(vec![
                "bid_spread must be positive".to_string(),
                "unknown exchange: ftx".to_string()
            ])
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_detail_list_is_flattened() {
        let err = HttpWorkerClient::classify(
            StatusCode::UNPROCESSABLE_ENTITY,
            "/strategies",
            r#"{"detail": [{"loc": ["body", "market"], "msg": "field required"}]}"#,
        );
        assert_eq!(err, WorkerError::Validation(vec!["field required".to_string()]));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            HttpWorkerClient::classify(StatusCode::NOT_FOUND, "/strategies/x", ""),
            WorkerError::NotFound(_)
        ));
        let server = HttpWorkerClient::classify(StatusCode::BAD_GATEWAY, "/health", "");
        assert!(server.is_retryable());
        let conflict = HttpWorkerClient::classify(StatusCode::CONFLICT, "/strategies", "exists");
        assert!(!conflict.is_retryable());
    }

    #[test]
    fn test_endpoint_for_host() {
        let endpoint = WorkerEndpoint::for_host("127.0.0.1", 18001);
        assert_eq!(endpoint.api_url, "http://127.0.0.1:18001");
        assert_eq!(endpoint.ws_url, "ws://127.0.0.1:18001/ws");
    }
}
