//! Error types for script instance lifecycles.

use std::time::Duration;

use crate::features::Feature;
use crate::lifecycle::LifecycleState;

/// Errors that can occur while driving an instance lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("Broker rejected the instance request")]
    Rejected,

    #[error("Host context is not a live execution context")]
    InvalidHostContext,

    #[error("Failed to expose feature {feature} (already exposed: {exposed:?}): {reason}")]
    Exposure {
        feature: Feature,
        exposed: Vec<Feature>,
        reason: String,
    },

    #[error("Script error: {0}")]
    Script(String),

    #[error("Runtime context error: {0}")]
    Context(#[from] ContextError),

    #[error("Worker did not stop within {waited:?}")]
    WorkerStuck { waited: Duration },

    #[error("Worker thread panicked")]
    WorkerPanic,

    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("{operation} is not allowed while {state}")]
    Misuse {
        operation: &'static str,
        state: LifecycleState,
    },
}

/// Result type for lifecycle operations
pub type InstanceResult<T> = Result<T, InstanceError>;

/// Errors reported by a runtime context.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContextError {
    #[error("Context is no longer valid")]
    Invalid,

    #[error("Script file not found: {0}")]
    FileNotFound(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Inspector unavailable on port {port}: {reason}")]
    Inspector { port: u16, reason: String },
}
