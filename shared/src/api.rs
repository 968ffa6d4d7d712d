//! API surface consumed from the orchestrator
//!
//! This module defines the endpoint paths, authentication headers and token
//! exchange types for the orchestrator's REST API, plus the URI pattern
//! normalization used to label HTTP timing metrics.

use serde::{Deserialize, Serialize};

/// HTTP headers used for authentication and metadata
pub mod headers {
    pub const AUTHORIZATION: &str = "X-Authorization";
    pub const CONTENT_TYPE: &str = "Content-Type";
}

/// API endpoint paths and builders
pub mod endpoints {
    /// Batch poll for pending tasks of a type
    pub fn poll_batch(task_type: &str) -> String {
        format!("/tasks/poll/batch/{}", task_type)
    }

    /// Submit a task result (legacy, acknowledgment only)
    pub const UPDATE: &str = "/tasks";

    /// Submit a task result; the response may carry the next same-type task
    pub const UPDATE_V2: &str = "/tasks/update-v2";

    /// Append a log line to a task
    pub fn task_log(task_id: &str) -> String {
        format!("/tasks/{}/log", task_id)
    }

    /// Fetch a task by id (diagnostics)
    pub fn task_by_id(task_id: &str) -> String {
        format!("/tasks/{}", task_id)
    }

    /// Queue depth per task type
    pub const QUEUE_SIZES: &str = "/tasks/queue/sizes";

    /// Exchange key+secret for a bearer token
    pub const TOKEN: &str = "/token";

    /// Register or overwrite task definitions
    pub const TASK_DEFS: &str = "/metadata/taskdefs";
}

/// Request body for POST /token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub key_id: String,
    pub key_secret: String,
}

/// Response body for POST /token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Normalize a concrete request path into the pattern form used as the
/// `uri` label on HTTP timing metrics, so per-task-id paths do not explode
/// label cardinality.
pub fn uri_pattern(path: &str) -> String {
    use std::sync::OnceLock;
    static POLL: OnceLock<regex::Regex> = OnceLock::new();
    static LOG: OnceLock<regex::Regex> = OnceLock::new();
    static BY_ID: OnceLock<regex::Regex> = OnceLock::new();

    // Strip any query string before matching.
    let path = path.split('?').next().unwrap_or(path);

    let poll = POLL.get_or_init(|| regex::Regex::new(r"^/tasks/poll/batch/[^/]+$").unwrap());
    let log = LOG.get_or_init(|| regex::Regex::new(r"^/tasks/[^/]+/log$").unwrap());
    let by_id = BY_ID.get_or_init(|| regex::Regex::new(r"^/tasks/[^/]+$").unwrap());

    if poll.is_match(path) {
        "/tasks/poll/batch/{taskType}".to_string()
    } else if log.is_match(path) {
        "/tasks/{taskId}/log".to_string()
    } else if path == endpoints::UPDATE
        || path == endpoints::UPDATE_V2
        || path == endpoints::QUEUE_SIZES
    {
        path.to_string()
    } else if by_id.is_match(path) {
        "/tasks/{taskId}".to_string()
    } else {
        path.to_string()
    }
}
