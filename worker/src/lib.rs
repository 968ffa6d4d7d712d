//! Worker execution runtime for a workflow orchestrator
//!
//! Applications register task handlers (a task type name plus a sync or
//! async function), and the runtime continuously pulls pending tasks of
//! those types from the orchestrator, executes them under a bounded permit
//! pool, and reports results back, including the chained-update
//! optimisation, automated lease extension, adaptive poll backoff and
//! Prometheus-shaped metrics.
//!
//! The typical flow:
//!
//! ```no_run
//! use shared::config::ServerSettings;
//! use worker::{TaskHandler, Worker, WorkerRegistry};
//! use serde::Deserialize;
//! use schemars::JsonSchema;
//!
//! #[derive(Deserialize, JsonSchema)]
//! struct Greet { name: String }
//!
//! # async fn run() -> shared::Result<()> {
//! let mut registry = WorkerRegistry::new();
//! registry.register(
//!     Worker::builder("greet")
//!         .thread_count(4)
//!         .handler(|input: Greet| Ok(format!("Hello {}", input.name)))?,
//! )?;
//!
//! let handler = TaskHandler::new(registry, ServerSettings::from_env()?)?;
//! handler.run_with_signal_handling().await?;
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod exposition;
pub mod handler;
pub mod metrics;
pub mod registry;
pub mod transport;

mod executor;
mod runner;

// Re-export the primary surface for convenience
pub use events::{EventBus, EventListener, WorkerEvent};
pub use exposition::MetricsExposure;
pub use handler::{HandlerOptions, HandlerState, TaskHandler, WorkerStatus};
pub use metrics::MetricsCollector;
pub use registry::{Worker, WorkerBuilder, WorkerRegistry};
pub use transport::{ApiClient, TransportError};

// Wire model and configuration re-exports from the shared crate
pub use shared::config::{ServerSettings, WorkerOptions};
pub use shared::model::{
    HandlerError, Task, TaskInProgress, TaskOutput, TaskResult, TaskResultStatus,
};

#[cfg(test)]
mod tests;
