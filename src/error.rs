//! Error types for the worker framework.

use crate::worker::WorkerState;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors surfaced synchronously by worker control operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("Cannot {operation} while in state {state}")]
    IllegalState {
        operation: &'static str,
        state: WorkerState,
    },

    #[error("{operation} must only be used from the affinity thread")]
    ThreadOwnership { operation: &'static str },

    #[error("Executor unavailable: {0}")]
    Executor(String),

    #[error("Event loop is closed or was invoked from its own thread")]
    EventLoopClosed,
}

/// Raised in place of a panic that escaped a task computation.
#[derive(Debug, thiserror::Error)]
#[error("Task computation panicked: {message}")]
pub struct TaskPanicked {
    pub message: String,
}

/// Returned by cancellation checkpoints inside a running computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Task was cancelled")]
pub struct Cancelled;
