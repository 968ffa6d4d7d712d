//! Shared data structures and utilities for the worker runtime
//!
//! This crate contains the orchestrator wire model, API endpoint definitions,
//! the hierarchical configuration resolver and small utilities used by the
//! worker runtime crate.

pub mod api;
pub mod config;
pub mod defaults;
pub mod model;
pub mod utils;

// Re-export commonly used types for convenience
pub use api::{TokenRequest, TokenResponse};
pub use config::{ServerSettings, WorkerConfig};
pub use model::{
    HandlerError, Task, TaskDef, TaskExecLog, TaskInProgress, TaskOutput, TaskResult,
    TaskResultStatus,
};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the worker runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Task execution error: {0}")]
    TaskExecution(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests;
