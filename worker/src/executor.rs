//! Execution backends for registered handlers
//!
//! The runner drives one loop regardless of handler kind; this module owns
//! the difference. Synchronous handlers are invoked on the blocking thread
//! pool so the driver never stalls, asynchronous handlers run as plain
//! futures on the cooperative scheduler. Both paths contain panics and map
//! them to retryable failures, and both report the elapsed time from
//! submission to completion.

use crate::events::{EventBus, WorkerEvent};
use crate::registry::{TaskHandlerFn, Worker};
use futures_util::FutureExt;
use shared::model::{HandlerError, Task, TaskOutput};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Outcome of one handler invocation, reaped by the runner
pub(crate) struct CompletedExecution {
    pub task: Task,
    pub outcome: Result<TaskOutput, HandlerError>,
    /// Submission to completion, the duration reported on execution events
    pub elapsed: Duration,
}

/// Submit a task for execution. The returned handle is reaped
/// non-blockingly by the runner; the execution itself progresses
/// independently of the driver loop.
pub(crate) fn submit(
    worker: &Arc<Worker>,
    task: Task,
    events: &EventBus,
) -> JoinHandle<CompletedExecution> {
    let worker = Arc::clone(worker);
    let events = events.clone();
    let submitted = Instant::now();

    tokio::spawn(async move {
        events.publish(&WorkerEvent::TaskExecutionStarted {
            task_type: task.task_def_name.clone(),
            task_id: task.task_id.clone(),
            workflow_instance_id: task.workflow_instance_id.clone(),
            worker_id: worker.config().worker_id.clone(),
        });

        let handler = worker.handler().clone();
        let work = run_handler(handler, task.clone());

        let outcome = match execution_timeout(&worker, &task) {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // The handler future is dropped here; a blocking
                    // invocation cannot be interrupted and its eventual
                    // result is discarded. The task falls back to the
                    // orchestrator's lease expiry either way.
                    debug!(
                        task_id = %task.task_id,
                        task_type = %task.task_def_name,
                        "Execution exceeded the response timeout"
                    );
                    Err(HandlerError::failed("execution timed out"))
                }
            },
            None => work.await,
        };

        CompletedExecution {
            task,
            outcome,
            elapsed: submitted.elapsed(),
        }
    })
}

/// Without lease extension, an execution may not outlive the task's
/// response timeout; with it, the lease timer keeps ownership alive.
fn execution_timeout(worker: &Worker, task: &Task) -> Option<Duration> {
    if !worker.config().lease_extend_enabled && task.response_timeout_seconds > 0 {
        Some(Duration::from_secs(task.response_timeout_seconds))
    } else {
        None
    }
}

async fn run_handler(handler: TaskHandlerFn, task: Task) -> Result<TaskOutput, HandlerError> {
    match handler {
        TaskHandlerFn::Sync(f) => match tokio::task::spawn_blocking(move || (*f)(task)).await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(join_error_to_failure(join_error)),
        },
        TaskHandlerFn::Async(f) => match AssertUnwindSafe((*f)(task)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(HandlerError::failed(format!(
                "handler panicked: {}",
                panic_message(&panic)
            ))),
        },
    }
}

fn join_error_to_failure(join_error: tokio::task::JoinError) -> HandlerError {
    if join_error.is_panic() {
        HandlerError::failed(format!(
            "handler panicked: {}",
            panic_message(&join_error.into_panic())
        ))
    } else {
        HandlerError::failed("handler execution was cancelled")
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
