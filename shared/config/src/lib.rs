//! Botfleet Config - Configuration management for the strategy-worker fleet
//!
//! Provides hierarchical configuration loading from multiple sources:
//! - Default values (every section has them)
//! - Configuration files (TOML)
//! - Environment variables (`BOTFLEET__SECTION__KEY`)
//! - Programmatic overrides through [`ConfigBuilder`]

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config file: {0}")]
    LoadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Missing required config: {0}")]
    MissingRequired(String),

    #[error("Invalid config value: {0}")]
    InvalidValue(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

// ============================================================================
// Sections
// ============================================================================

/// Container runtime and worker image
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker Engine API endpoint
    pub docker_url: String,
    pub image: String,
    /// Port the worker API listens on inside the container
    pub api_port: u16,
    /// First host port handed out to instances
    pub host_port_base: u16,
    pub bind_host: String,
    pub network: Option<String>,
    /// CPU limit in cores
    pub cpu_limit: f64,
    pub memory_limit_mb: u64,
    pub startup_timeout_secs: u64,
    pub readiness_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_url: "http://127.0.0.1:2375".to_string(),
            image: "botfleet/worker:latest".to_string(),
            api_port: 8000,
            host_port_base: 18000,
            bind_host: "127.0.0.1".to_string(),
            network: None,
            cpu_limit: 1.0,
            memory_limit_mb: 1024,
            startup_timeout_secs: 60,
            readiness_interval_ms: 1000,
            request_timeout_ms: 10_000,
        }
    }
}

impl RuntimeConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Fleet sizing and health policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingPolicy {
    pub min_instances: usize,
    pub max_instances: usize,
    /// Average CPU percent the autoscaler aims for
    pub target_cpu_utilization: f64,
    /// Average memory percent the autoscaler aims for
    pub target_memory_utilization: f64,
    /// CPU or memory percent above which an instance is unhealthy
    pub resource_threshold: f64,
    pub auto_scaling: bool,
    pub health_check_interval_secs: u64,
    pub scale_interval_secs: u64,
    pub rebalance_interval_secs: u64,
    /// Recovery attempts before an instance is flagged for manual intervention
    pub max_recovery_attempts: u32,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 10,
            target_cpu_utilization: 70.0,
            target_memory_utilization: 80.0,
            resource_threshold: 90.0,
            auto_scaling: true,
            health_check_interval_secs: 30,
            scale_interval_secs: 60,
            rebalance_interval_secs: 300,
            max_recovery_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Worker connections, deployment and metrics streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub max_connections: usize,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub deploy_timeout_ms: u64,
    /// Total attempts for network-level failures
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub backoff: BackoffKind,
    pub max_retry_delay_ms: u64,
    /// Reject definitions that are not stamped paper-trading + simulation
    pub require_simulation_flags: bool,
    pub stream_ping_interval_secs: u64,
    pub stream_reconnect_base_ms: u64,
    pub stream_reconnect_max_ms: u64,
    /// 0 = unlimited
    pub stream_max_reconnects: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            deploy_timeout_ms: 30_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            backoff: BackoffKind::Fixed,
            max_retry_delay_ms: 10_000,
            require_simulation_flags: true,
            stream_ping_interval_secs: 20,
            stream_reconnect_base_ms: 1_000,
            stream_reconnect_max_ms: 30_000,
            stream_max_reconnects: 10,
        }
    }
}

impl BridgeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_millis(self.deploy_timeout_ms)
    }
}

/// Platform-wide risk ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformLimits {
    pub max_position_size: f64,
    pub max_daily_loss: f64,
    pub max_open_orders: u32,
    pub max_slippage: f64,
    pub max_leverage: f64,
}

impl Default for PlatformLimits {
    fn default() -> Self {
        Self {
            max_position_size: 10.0,
            max_daily_loss: 1_000.0,
            max_open_orders: 50,
            max_slippage: 0.02,
            max_leverage: 3.0,
        }
    }
}

/// Strategy monitor thresholds and schedules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Samples retained per strategy
    pub history_size: usize,
    /// Samples considered for baselines and error rate
    pub baseline_window: usize,
    /// Baseline samples required before anomaly detection runs
    pub min_baseline_samples: usize,
    pub latency_multiplier: f64,
    pub fill_rate_deviation: f64,
    pub slippage_multiplier: f64,
    /// Samples with errors within the window that flag a high error rate
    pub error_sample_threshold: usize,
    pub anomaly_interval_secs: u64,
    pub alert_interval_secs: u64,
    pub collection_interval_secs: u64,
    pub cooldown_low_secs: u64,
    pub cooldown_medium_secs: u64,
    pub cooldown_high_secs: u64,
    pub cooldown_critical_secs: u64,
    pub max_latency_ms: f64,
    pub min_fill_rate: f64,
    pub max_slippage: f64,
    /// Factor applied to the order refresh time on a latency adjustment
    pub refresh_time_multiplier: f64,
    pub auto_adjust: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_size: 1000,
            baseline_window: 10,
            min_baseline_samples: 5,
            latency_multiplier: 3.0,
            fill_rate_deviation: 0.3,
            slippage_multiplier: 2.0,
            error_sample_threshold: 5,
            anomaly_interval_secs: 10,
            alert_interval_secs: 15,
            collection_interval_secs: 5,
            cooldown_low_secs: 900,
            cooldown_medium_secs: 600,
            cooldown_high_secs: 300,
            cooldown_critical_secs: 60,
            max_latency_ms: 1_000.0,
            min_fill_rate: 0.5,
            max_slippage: 0.01,
            refresh_time_multiplier: 1.5,
            auto_adjust: true,
        }
    }
}

/// Safety validation and scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub paper_trading_enabled: bool,
    pub drawdown_medium: f64,
    pub drawdown_high: f64,
    pub drawdown_critical: f64,
    pub min_fill_rate: f64,
    pub max_latency_ms: f64,
    pub weight_low: f64,
    pub weight_medium: f64,
    pub weight_high: f64,
    pub weight_critical: f64,
    pub monitor_interval_secs: u64,
    pub violation_log_size: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            paper_trading_enabled: true,
            drawdown_medium: 0.10,
            drawdown_high: 0.15,
            drawdown_critical: 0.20,
            min_fill_rate: 0.3,
            max_latency_ms: 2_000.0,
            weight_low: 1.0,
            weight_medium: 5.0,
            weight_high: 10.0,
            weight_critical: 25.0,
            monitor_interval_secs: 10,
            violation_log_size: 1000,
        }
    }
}

/// One exchange the coordinator works with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    /// Endpoint probed for liveness and latency
    pub status_url: String,
    /// Exchanges to migrate to when this one fails, in preference order
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

/// Multi-exchange coordination
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub exchanges: Vec<ExchangeConfig>,
    pub trading_pairs: Vec<String>,
    pub quote_asset: String,
    /// Market data service for prices and balances
    pub market_data_url: String,
    /// Minimum spread in percent
    pub min_profit_threshold: f64,
    /// Consecutive probe failures that mark an exchange failed
    pub failure_threshold: u32,
    pub probe_timeout_ms: u64,
    /// Probe latency above which an exchange is degraded
    pub degraded_latency_ms: u64,
    pub health_check_interval_secs: u64,
    pub arbitrage_interval_secs: u64,
    pub auto_execute_arbitrage: bool,
    pub max_arbitrage_notional: f64,
    pub max_arbitrage_units: f64,
    /// Deviation, as a fraction of portfolio value, that triggers a rebalance
    pub rebalance_threshold: f64,
    pub rebalance_interval_secs: u64,
    /// Target allocation per asset as a fraction (0.5 = 50%)
    pub target_allocations: BTreeMap<String, f64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            exchanges: Vec::new(),
            trading_pairs: Vec::new(),
            quote_asset: "USDT".to_string(),
            market_data_url: "http://127.0.0.1:8090".to_string(),
            min_profit_threshold: 0.5,
            failure_threshold: 3,
            probe_timeout_ms: 5_000,
            degraded_latency_ms: 2_000,
            health_check_interval_secs: 30,
            arbitrage_interval_secs: 5,
            auto_execute_arbitrage: false,
            max_arbitrage_notional: 1_000.0,
            max_arbitrage_units: 1.0,
            rebalance_threshold: 0.01,
            rebalance_interval_secs: 3_600,
            target_allocations: BTreeMap::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn exchange(&self, name: &str) -> Option<&ExchangeConfig> {
        self.exchanges.iter().find(|e| e.name == name)
    }

    pub fn exchange_names(&self) -> Vec<String> {
        self.exchanges.iter().map(|e| e.name.clone()).collect()
    }
}

/// Emergency shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub auto_shutdown_enabled: bool,
    pub trigger_on_risk_violation: bool,
    pub trigger_on_system_error: bool,
    pub trigger_on_manual: bool,
    pub trigger_on_paper_trading_disabled: bool,
    /// Hard limit for a whole shutdown run
    pub force_timeout_secs: u64,
    pub step_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub simulated_step_delay_ms: u64,
    pub history_size: usize,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            auto_shutdown_enabled: true,
            trigger_on_risk_violation: true,
            trigger_on_system_error: true,
            trigger_on_manual: true,
            trigger_on_paper_trading_disabled: true,
            force_timeout_secs: 300,
            step_timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 1_000,
            simulated_step_delay_ms: 50,
            history_size: 50,
        }
    }
}

/// Logging, metrics export and notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub prometheus_port: u16,
    pub log_level: String,
    /// `pretty` or `json`
    pub log_format: String,
    pub webhook_url: Option<String>,
    pub event_bus_capacity: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_port: 9090,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            webhook_url: None,
            event_bus_capacity: 1024,
        }
    }
}

// ============================================================================
// Main configuration
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub environment: String,
    pub runtime: RuntimeConfig,
    pub scaling: ScalingPolicy,
    pub bridge: BridgeConfig,
    pub platform_limits: PlatformLimits,
    pub monitor: MonitorConfig,
    pub safety: SafetyConfig,
    pub coordinator: CoordinatorConfig,
    pub shutdown: ShutdownConfig,
    pub monitoring: MonitoringConfig,
}

impl FleetConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: FleetConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.normalize();
        Ok(config)
    }

    /// Load a file layered with `BOTFLEET__SECTION__KEY` environment overrides
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv();

        let layered = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("BOTFLEET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        let mut config: FleetConfig = layered
            .try_deserialize()
            .map_err(|e| ConfigError::EnvError(e.to_string()))?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        if self.environment.is_empty() {
            self.environment = "development".to_string();
        }
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scaling = &self.scaling;
        if scaling.max_instances == 0 {
            return Err(ConfigError::InvalidValue("max_instances must be positive".to_string()));
        }
        if scaling.min_instances > scaling.max_instances {
            return Err(ConfigError::InvalidValue(format!(
                "min_instances ({}) exceeds max_instances ({})",
                scaling.min_instances, scaling.max_instances
            )));
        }
        for (name, value) in [
            ("target_cpu_utilization", scaling.target_cpu_utilization),
            ("target_memory_utilization", scaling.target_memory_utilization),
            ("resource_threshold", scaling.resource_threshold),
        ] {
            if value <= 0.0 || value > 100.0 {
                return Err(ConfigError::InvalidValue(format!("{} must be in (0, 100]", name)));
            }
        }

        let bridge = &self.bridge;
        if bridge.max_connections == 0 {
            return Err(ConfigError::InvalidValue("max_connections must be positive".to_string()));
        }
        if bridge.retry_attempts == 0 {
            return Err(ConfigError::InvalidValue("retry_attempts must be at least 1".to_string()));
        }
        for (name, value) in [
            ("bridge.connect_timeout_ms", bridge.connect_timeout_ms),
            ("bridge.request_timeout_ms", bridge.request_timeout_ms),
            ("bridge.deploy_timeout_ms", bridge.deploy_timeout_ms),
            ("runtime.startup_timeout_secs", self.runtime.startup_timeout_secs),
            ("runtime.request_timeout_ms", self.runtime.request_timeout_ms),
            ("shutdown.force_timeout_secs", self.shutdown.force_timeout_secs),
            ("shutdown.step_timeout_secs", self.shutdown.step_timeout_secs),
            ("coordinator.probe_timeout_ms", self.coordinator.probe_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} must be positive", name)));
            }
        }

        let limits = &self.platform_limits;
        if limits.max_position_size <= 0.0 || limits.max_leverage <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "platform position size and leverage ceilings must be positive".to_string(),
            ));
        }
        if limits.max_slippage <= 0.0 || limits.max_slippage > 1.0 {
            return Err(ConfigError::InvalidValue("max_slippage must be in (0, 1]".to_string()));
        }

        let monitor = &self.monitor;
        if monitor.history_size == 0 {
            return Err(ConfigError::InvalidValue("history_size must be positive".to_string()));
        }
        if monitor.min_baseline_samples == 0 || monitor.min_baseline_samples > monitor.baseline_window {
            return Err(ConfigError::InvalidValue(
                "min_baseline_samples must be in [1, baseline_window]".to_string(),
            ));
        }
        if monitor.error_sample_threshold == 0 || monitor.error_sample_threshold > monitor.baseline_window {
            return Err(ConfigError::InvalidValue(
                "error_sample_threshold must be in [1, baseline_window]".to_string(),
            ));
        }

        let safety = &self.safety;
        if !(0.0 < safety.drawdown_medium
            && safety.drawdown_medium < safety.drawdown_high
            && safety.drawdown_high < safety.drawdown_critical
            && safety.drawdown_critical <= 1.0)
        {
            return Err(ConfigError::InvalidValue(
                "drawdown thresholds must satisfy 0 < medium < high < critical <= 1".to_string(),
            ));
        }

        let coordinator = &self.coordinator;
        let mut names = HashSet::new();
        for exchange in &coordinator.exchanges {
            if !names.insert(exchange.name.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate exchange: {}",
                    exchange.name
                )));
            }
        }
        for exchange in &coordinator.exchanges {
            for fallback in &exchange.fallbacks {
                if fallback == &exchange.name || !names.contains(fallback.as_str()) {
                    return Err(ConfigError::InvalidValue(format!(
                        "exchange {} has unknown fallback {}",
                        exchange.name, fallback
                    )));
                }
            }
        }
        if coordinator.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue("failure_threshold must be positive".to_string()));
        }
        if coordinator.min_profit_threshold <= 0.0 {
            return Err(ConfigError::InvalidValue("min_profit_threshold must be positive".to_string()));
        }
        let allocation: f64 = coordinator.target_allocations.values().sum();
        if !coordinator.target_allocations.is_empty() && (allocation - 1.0).abs() > 1e-6 {
            return Err(ConfigError::InvalidValue(format!(
                "target_allocations sum to {:.4}, expected 1.0",
                allocation
            )));
        }

        if !matches!(self.monitoring.log_format.as_str(), "pretty" | "json") {
            return Err(ConfigError::InvalidValue(format!(
                "unknown log_format: {}",
                self.monitoring.log_format
            )));
        }

        Ok(())
    }
}

/// Builder for FleetConfig
pub struct ConfigBuilder {
    config: FleetConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FleetConfig {
                environment: "development".to_string(),
                ..FleetConfig::default()
            },
        }
    }

    pub fn environment(mut self, env: &str) -> Self {
        self.config.environment = env.to_string();
        self
    }

    pub fn runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.config.runtime = runtime;
        self
    }

    pub fn scaling(mut self, scaling: ScalingPolicy) -> Self {
        self.config.scaling = scaling;
        self
    }

    pub fn bridge(mut self, bridge: BridgeConfig) -> Self {
        self.config.bridge = bridge;
        self
    }

    pub fn platform_limits(mut self, limits: PlatformLimits) -> Self {
        self.config.platform_limits = limits;
        self
    }

    pub fn monitor(mut self, monitor: MonitorConfig) -> Self {
        self.config.monitor = monitor;
        self
    }

    pub fn safety(mut self, safety: SafetyConfig) -> Self {
        self.config.safety = safety;
        self
    }

    pub fn coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.config.coordinator = coordinator;
        self
    }

    pub fn add_exchange(mut self, exchange: ExchangeConfig) -> Self {
        self.config.coordinator.exchanges.push(exchange);
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownConfig) -> Self {
        self.config.shutdown = shutdown;
        self
    }

    pub fn monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.config.monitoring = monitoring;
        self
    }

    pub fn build(self) -> FleetConfig {
        self.config
    }

    /// Build and validate
    pub fn try_build(self) -> Result<FleetConfig, ConfigError> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
