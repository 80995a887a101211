//! SHUTDOWN - Emergency shutdown coordinator
//!
//! Takes the whole fleet down in a fixed order when something has gone
//! badly wrong. Only one shutdown runs at a time; a second request is
//! refused rather than queued.
//!
//! # Responsibilities
//! - Decide whether a reason warrants an automatic shutdown
//! - Build the step plan for a reason (stop-instances only when critical)
//! - Run steps sequentially with per-step timeouts and retries under a global force timeout
//! - Support cancellation between steps and a side-effect-free rehearsal
//! - Keep a history of past runs

pub mod coordinator;
pub mod plan;

use botfleet_types::{Retryable, ShutdownStepKind};
use thiserror::Error;

pub use coordinator::EmergencyShutdownCoordinator;
pub use plan::{build_plan, render_report, should_trigger};

/// Shutdown errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShutdownError {
    #[error("Shutdown already in progress")]
    AlreadyInProgress,

    #[error("No shutdown is executing")]
    NotExecuting,

    #[error("Step {step} failed: {message}")]
    Step {
        step: ShutdownStepKind,
        message: String,
        retryable: bool,
    },

    #[error("Step {0} timed out")]
    StepTimeout(ShutdownStepKind),
}

impl Retryable for ShutdownError {
    fn is_retryable(&self) -> bool {
        match self {
            ShutdownError::Step { retryable, .. } => *retryable,
            ShutdownError::StepTimeout(_) => true,
            _ => false,
        }
    }
}
