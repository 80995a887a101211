//! Connectors - External interfaces of the fleet
//!
//! Everything the core talks to over the network sits behind a trait here,
//! with a real implementation and (behind the `testing` feature) an in-memory
//! fake.
//!
//! # Responsibilities
//! - Container runtime lifecycle via the Docker Engine API
//! - Worker REST API (strategy CRUD, health, metrics, orders)
//! - Worker metrics stream over WebSocket with reconnect
//! - Market data (prices, balances) and exchange liveness probes
//! - Event sinks (audit log, webhook)

pub mod oracle;
pub mod probe;
pub mod runtime;
pub mod sinks;
pub mod stream;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use oracle::{BalanceProvider, HttpMarketData, OracleError, PriceOracle};
pub use probe::{ExchangeProbe, HttpExchangeProbe, ProbeError};
pub use runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerState, ContainerStats, DockerRuntime,
    RuntimeError, INSTANCE_LABEL, MANAGED_LABEL,
};
pub use sinks::{LogSink, WebhookSink};
pub use stream::{
    spawn_metrics_stream, MetricsSubscription, OrderUpdate, StreamConfig, StreamEvent, StreamFrame,
    StreamStatus, TradeUpdate, WorkerErrorEvent,
};
pub use worker::{
    DetailedHealth, HealthReport, HttpWorkerClient, StreamSettings, ValidationResponse, WorkerApi,
    WorkerEndpoint, WorkerError, WorkerMetrics, WorkerOrder, WorkerRiskLimits, WorkerStrategy,
    WorkerStrategyConfig,
};
