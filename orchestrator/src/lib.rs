//! ORCHESTRATOR - Wiring and supervision
//!
//! Builds every fleet component from one configuration, connects them to
//! a shared event bus and metrics registry, and runs their periodic loops
//! as supervised services.
//!
//! # Responsibilities
//! - Construct the real connectors (Docker, worker API, market data, probes)
//! - Wire bridge, fleet, monitors, coordinator and shutdown together
//! - Adopt existing containers and bring the fleet to its minimum size
//! - Start and stop loop groups through the [`Supervisor`]
//! - Attach the strategy monitor to every deployed strategy
//! - Trigger an emergency shutdown on critical safety violations

pub mod app;
pub mod attach;
pub mod guard;
pub mod service;

use botfleet_config::ConfigError;
use botfleet_fleet::FleetError;
use thiserror::Error;

pub use app::{BotFleet, Connectors};
pub use attach::spawn_monitor_attacher;
pub use guard::{reason_for, spawn_shutdown_guard};
pub use service::{LoopService, Service, ServiceHealth, ServiceStatus, Supervisor};

/// Orchestrator errors
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connector setup failed: {0}")]
    Connector(String),

    #[error("Fleet error: {0}")]
    Fleet(#[from] FleetError),

    #[error("Service {name} failed: {message}")]
    Service { name: String, message: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),
}
