//! Event bus for runtime observations
//!
//! Runners and the HTTP transport publish typed events at well-defined
//! points (polls, executions, updates, pauses, restarts, HTTP requests).
//! Listeners are registered once at handler construction and invoked
//! synchronously; a misbehaving listener is contained and counted, it can
//! never break the runtime.

use shared::model::TaskResultStatus;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Observation emitted by the runtime
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Before issuing a poll; `poll_count` is the number of tasks requested
    PollStarted {
        task_type: String,
        worker_id: String,
        poll_count: usize,
    },
    /// After a successful poll
    PollCompleted {
        task_type: String,
        duration: Duration,
        tasks_received: usize,
    },
    /// After a failed poll
    PollFailure {
        task_type: String,
        duration: Duration,
        cause: String,
    },
    /// Right before handler invocation
    TaskExecutionStarted {
        task_type: String,
        task_id: String,
        workflow_instance_id: String,
        worker_id: String,
    },
    /// After a successful completion; duration spans submit to done
    TaskExecutionCompleted {
        task_type: String,
        task_id: String,
        workflow_instance_id: String,
        worker_id: String,
        duration: Duration,
        output_size_bytes: usize,
        status: TaskResultStatus,
    },
    /// After a terminal or retryable handler failure
    TaskExecutionFailure {
        task_type: String,
        task_id: String,
        workflow_instance_id: String,
        worker_id: String,
        duration: Duration,
        cause: String,
        status: TaskResultStatus,
    },
    /// After a result was accepted by the orchestrator
    TaskUpdateCompleted {
        task_type: String,
        duration: Duration,
        status: TaskResultStatus,
    },
    /// After a failed update attempt
    TaskUpdateFailure {
        task_type: String,
        duration: Duration,
        cause: String,
    },
    /// One tick per skipped poll cycle while a worker is paused
    TaskPaused { task_type: String },
    /// A crashed runner was restarted by the supervisor
    WorkerRestarted { task_type: String },
    /// Timing of one HTTP request against the orchestrator, regardless of
    /// outcome; `uri` is the normalized path pattern
    HttpRequest {
        method: String,
        uri: String,
        status: String,
        duration: Duration,
    },
}

/// A consumer of runtime events. Implementations must be cheap: publishing
/// is synchronous on the emitting path.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &WorkerEvent);
}

/// Synchronous in-process publisher shared by all runners
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Vec<Arc<dyn EventListener>>>,
    listener_failures: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(listeners: Vec<Arc<dyn EventListener>>) -> Self {
        Self {
            listeners: Arc::new(listeners),
            listener_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event to every listener. Listener panics are caught,
    /// logged and counted; they never propagate to the emitter.
    pub fn publish(&self, event: &WorkerEvent) {
        for listener in self.listeners.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if outcome.is_err() {
                self.listener_failures.fetch_add(1, Ordering::Relaxed);
                warn!(?event, "Event listener panicked; event dropped for this listener");
            }
        }
    }

    /// Number of listener invocations that panicked since startup
    pub fn listener_failures(&self) -> u64 {
        self.listener_failures.load(Ordering::Relaxed)
    }
}
