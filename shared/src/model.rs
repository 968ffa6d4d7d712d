//! Wire model for tasks exchanged with the orchestrator
//!
//! This module defines the task and task-result types used to receive work
//! from the orchestrator and report outcomes back, plus the handler-facing
//! return and error types the runtime maps onto the wire statuses.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::{current_timestamp_millis, truncate_string};

/// Maximum length of a failure reason forwarded to the server.
/// Longer reasons are truncated with an ellipsis.
const MAX_REASON_LENGTH: usize = 500;

/// Server-side task state as reported in poll responses
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Scheduled,
    InProgress,
    Completed,
    CompletedWithErrors,
    Failed,
    FailedWithTerminalError,
    TimedOut,
    Canceled,
    Skipped,
}

/// Status reported back to the orchestrator in a task result
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResultStatus {
    /// Handler finished successfully; output accompanies the result.
    Completed,
    /// Handler failed; the server's retry policy applies.
    Failed,
    /// Handler failed permanently; the server must not retry.
    FailedWithTerminalError,
    /// Handler is still working; extends the lease.
    InProgress,
}

impl TaskResultStatus {
    /// Wire name of the status, used as a metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskResultStatus::Completed => "COMPLETED",
            TaskResultStatus::Failed => "FAILED",
            TaskResultStatus::FailedWithTerminalError => "FAILED_WITH_TERMINAL_ERROR",
            TaskResultStatus::InProgress => "IN_PROGRESS",
        }
    }

    /// True for statuses that finish the task from the runtime's perspective
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskResultStatus::InProgress)
    }
}

/// A unit of work handed out by the orchestrator in a poll response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    /// Opaque identifier, unique across all tasks
    pub task_id: String,
    /// Task type; determines which worker processes the task
    pub task_def_name: String,
    /// Parent workflow reference
    pub workflow_instance_id: String,
    /// Logical name of this task within the workflow
    pub reference_task_name: String,
    /// Arbitrary input mapping, interpreted by the handler
    pub input_data: Map<String, Value>,
    /// Server-maintained count of how many times this task was handed out
    pub poll_count: u32,
    /// Lease duration: a result or in-progress signal must arrive before
    /// this elapses or the server reassigns the task
    pub response_timeout_seconds: u64,
    /// Number of prior retries
    pub retry_count: u32,
    /// Server state at hand-out time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    /// Server hint for when to re-queue an in-progress task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_after_seconds: Option<u64>,
}

/// One execution log line attached to a task result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecLog {
    /// The log message
    pub log: String,
    /// Creation time as Unix milliseconds
    pub created_time: u64,
    /// Task the line belongs to
    pub task_id: String,
}

impl TaskExecLog {
    /// Create a log line for the given task, stamped with the current time
    pub fn new(task_id: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            log: log.into(),
            created_time: current_timestamp_millis(),
            task_id: task_id.into(),
        }
    }
}

/// Result reported back to the orchestrator after executing a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Identity of the task this result belongs to
    pub task_id: String,
    /// Parent workflow reference
    pub workflow_instance_id: String,
    /// Outcome status
    pub status: TaskResultStatus,
    /// Output mapping for successful handler returns
    #[serde(default)]
    pub output_data: Map<String, Value>,
    /// Free-text cause for failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_for_incompletion: Option<String>,
    /// Ordered execution log lines
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<TaskExecLog>,
    /// Identity of the runner that produced the result
    pub worker_id: String,
    /// True on lease-extension updates; the server renews the lease
    /// without treating the update as a real in-progress result
    #[serde(default)]
    pub extend_lease: bool,
    /// Seconds until the server should hand the task out again
    /// (meaningful for IN_PROGRESS results)
    #[serde(default)]
    pub callback_after_seconds: u64,
}

impl TaskResult {
    /// Base result carrying the identity of `task`, to be refined by the
    /// status-specific constructors below
    fn base(task: &Task, worker_id: &str, status: TaskResultStatus) -> Self {
        Self {
            task_id: task.task_id.clone(),
            workflow_instance_id: task.workflow_instance_id.clone(),
            status,
            output_data: Map::new(),
            reason_for_incompletion: None,
            logs: Vec::new(),
            worker_id: worker_id.to_string(),
            extend_lease: false,
            callback_after_seconds: 0,
        }
    }

    /// Successful completion with the given output mapping
    pub fn completed(task: &Task, worker_id: &str, output_data: Map<String, Value>) -> Self {
        let mut result = Self::base(task, worker_id, TaskResultStatus::Completed);
        result.output_data = output_data;
        result
    }

    /// Retryable failure with a truncated reason
    pub fn failed(task: &Task, worker_id: &str, reason: &str) -> Self {
        let mut result = Self::base(task, worker_id, TaskResultStatus::Failed);
        result.reason_for_incompletion = Some(truncate_string(reason, MAX_REASON_LENGTH));
        result
    }

    /// Permanent failure with a truncated reason
    pub fn terminal_failure(task: &Task, worker_id: &str, reason: &str) -> Self {
        let mut result = Self::base(task, worker_id, TaskResultStatus::FailedWithTerminalError);
        result.reason_for_incompletion = Some(truncate_string(reason, MAX_REASON_LENGTH));
        result
    }

    /// In-progress result with an output snapshot; extends the lease
    pub fn in_progress(
        task: &Task,
        worker_id: &str,
        output_data: Map<String, Value>,
        callback_after_seconds: u64,
    ) -> Self {
        let mut result = Self::base(task, worker_id, TaskResultStatus::InProgress);
        result.output_data = output_data;
        result.callback_after_seconds = callback_after_seconds;
        result
    }

    /// Lease-extension update: IN_PROGRESS with `extendLease=true` and no
    /// real output. Distinct from an explicit in-progress handler return.
    pub fn lease_extension(task: &Task, worker_id: &str, callback_after_seconds: u64) -> Self {
        let mut result = Self::base(task, worker_id, TaskResultStatus::InProgress);
        result.extend_lease = true;
        result.callback_after_seconds = callback_after_seconds;
        result
    }

    /// Build the result for a handler outcome
    pub fn from_output(task: &Task, worker_id: &str, output: TaskOutput) -> Self {
        match output {
            TaskOutput::Data(map) => Self::completed(task, worker_id, map),
            TaskOutput::Value(value) => {
                let mut map = Map::new();
                map.insert("result".to_string(), value);
                Self::completed(task, worker_id, map)
            }
            TaskOutput::InProgress(in_progress) => Self::in_progress(
                task,
                worker_id,
                in_progress.output_data,
                in_progress.callback_after_seconds,
            ),
            TaskOutput::Empty => Self::completed(task, worker_id, Map::new()),
        }
    }

    /// Build the result for a handler error
    pub fn from_handler_error(task: &Task, worker_id: &str, error: &HandlerError) -> Self {
        match error {
            HandlerError::NonRetryable(reason) => Self::terminal_failure(task, worker_id, reason),
            HandlerError::Failed(reason) => Self::failed(task, worker_id, reason),
        }
    }

    /// Append an execution log line
    pub fn add_log(&mut self, log: impl Into<String>) {
        self.logs.push(TaskExecLog::new(self.task_id.clone(), log));
    }

    /// Serialized size of the output mapping in bytes, for metrics
    pub fn output_size_bytes(&self) -> usize {
        serde_json::to_vec(&self.output_data)
            .map(|bytes| bytes.len())
            .unwrap_or(0)
    }
}

/// Sentinel a handler returns to explicitly request lease extension with a
/// partial output snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskInProgress {
    /// Output snapshot reported with the in-progress update
    pub output_data: Map<String, Value>,
    /// Seconds until the server should hand the task out again
    pub callback_after_seconds: u64,
}

impl TaskInProgress {
    pub fn new(output_data: Map<String, Value>, callback_after_seconds: u64) -> Self {
        Self {
            output_data,
            callback_after_seconds,
        }
    }
}

/// Shape of a successful handler return, mapped onto the wire per the
/// orchestrator contract: mappings become the output, any other value is
/// wrapped under a `result` key, and an empty return completes the task
/// with empty output
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// Mapping output, sent as-is
    Data(Map<String, Value>),
    /// Non-mapping value, wrapped as `{"result": value}`
    Value(Value),
    /// Explicit lease-extension request with partial output
    InProgress(TaskInProgress),
    /// Legitimate empty completion; never confused with "still running"
    Empty,
}

impl From<Value> for TaskOutput {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => TaskOutput::Data(map),
            Value::Null => TaskOutput::Empty,
            other => TaskOutput::Value(other),
        }
    }
}

impl From<Map<String, Value>> for TaskOutput {
    fn from(map: Map<String, Value>) -> Self {
        TaskOutput::Data(map)
    }
}

impl From<TaskInProgress> for TaskOutput {
    fn from(in_progress: TaskInProgress) -> Self {
        TaskOutput::InProgress(in_progress)
    }
}

impl From<()> for TaskOutput {
    fn from(_: ()) -> Self {
        TaskOutput::Empty
    }
}

impl From<String> for TaskOutput {
    fn from(value: String) -> Self {
        TaskOutput::Value(Value::String(value))
    }
}

impl From<&str> for TaskOutput {
    fn from(value: &str) -> Self {
        TaskOutput::Value(Value::String(value.to_string()))
    }
}

/// Error a handler raises to fail a task
///
/// `NonRetryable` maps to FAILED_WITH_TERMINAL_ERROR on the wire; anything
/// else maps to FAILED and is subject to the server's retry policy.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    NonRetryable(String),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn non_retryable(reason: impl Into<String>) -> Self {
        HandlerError::NonRetryable(reason.into())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }

    /// Short classification used as the `exception` metric label
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::NonRetryable(_) => "NonRetryableError",
            HandlerError::Failed(_) => "Error",
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        HandlerError::Failed(error.to_string())
    }
}

/// Task-definition registration payload, sent when a worker is configured
/// with `register_task_def=true`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDef {
    /// Task type name
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_timeout_seconds: Option<u64>,
    /// JSON Schema (draft-07) describing the expected input mapping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl TaskDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            retry_count: None,
            timeout_seconds: None,
            response_timeout_seconds: None,
            input_schema: None,
        }
    }
}
