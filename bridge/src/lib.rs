//! BRIDGE - Worker control plane
//!
//! Owns exactly one logical connection per worker instance and is the only
//! component that talks to the worker strategy API.
//!
//! # Responsibilities
//! - Connect to instances (idempotent, capped, probed once)
//! - Validate and translate strategy definitions into the worker format
//! - Deploy, stop, pause, resume, modify and relocate strategies
//! - Retry transient worker failures, never validation failures
//! - Track strategy executions and their performance

pub mod connection;
pub mod registry;
pub mod translate;

use botfleet_connectors::WorkerError;
use botfleet_types::Retryable;
use thiserror::Error;

pub use connection::{Connection, ConnectionStatus};
pub use registry::{retry_policy, BridgeRegistry, DisconnectReport};
pub use translate::{check_definition, merge_parameters, to_worker_config};

/// Bridge errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Connection capacity reached: {0} connections open")]
    Capacity(usize),

    #[error("Instance not connected: {0}")]
    NotConnected(String),

    #[error("Strategy not found: {0}")]
    NotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Worker error: {0}")]
    Worker(WorkerError),
}

impl Retryable for BridgeError {
    fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Connection(_) | BridgeError::Timeout(_) => true,
            BridgeError::Worker(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<WorkerError> for BridgeError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Connection(msg) => BridgeError::Connection(msg),
            WorkerError::Timeout => BridgeError::Timeout("worker request".to_string()),
            WorkerError::Validation(errors) => BridgeError::Validation(errors),
            other => BridgeError::Worker(other),
        }
    }
}
