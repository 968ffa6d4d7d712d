//! Default values for configuration parameters
//!
//! This module centralizes the code-level defaults used by the configuration
//! resolver when neither a worker-specific nor a global environment variable
//! overrides a property.

// Worker property defaults

/// Default sleep between successful poll cycles (100 ms)
pub fn default_poll_interval_millis() -> u64 {
    100
}

/// Default maximum concurrent executions per worker
pub fn default_thread_count() -> usize {
    1
}

/// Default server-side long-poll duration (100 ms)
pub fn default_poll_timeout_millis() -> u64 {
    100
}

/// Default for automated lease extension
pub fn default_lease_extend_enabled() -> bool {
    true
}

/// Default for registering the task definition at startup
pub fn default_register_task_def() -> bool {
    false
}

/// Default for overwriting a server-side task definition when registering
pub fn default_overwrite_task_def() -> bool {
    true
}

/// Default for rejecting unknown input keys
pub fn default_strict_schema() -> bool {
    false
}

// Runtime defaults

/// Default grace period for draining in-flight work at shutdown (30 s)
pub fn default_grace_period_seconds() -> u64 {
    30
}

/// Fraction of the response timeout after which a lease extension fires
pub fn lease_extension_factor() -> f64 {
    0.8
}

/// Maximum update retry attempts after the initial submission
pub fn default_update_retry_attempts() -> u32 {
    4
}

/// Base delay for update retries (2 s, doubled per attempt, jittered)
pub fn default_update_retry_base_delay_ms() -> u64 {
    2_000
}

/// Cap on the update retry delay
pub fn default_update_retry_max_delay_ms() -> u64 {
    60_000
}

/// Base sleep for the adaptive empty-poll backoff (1 ms, doubled per
/// consecutive empty poll, capped at the poll interval)
pub fn empty_poll_backoff_base_millis() -> u64 {
    1
}

/// Maximum authentication attempts before a 401 is surfaced upstream
pub fn default_auth_max_attempts() -> u32 {
    5
}

/// Fallback bearer-token lifetime when the token carries no readable
/// expiry claim (45 minutes)
pub fn default_token_ttl_seconds() -> u64 {
    2_700
}

/// Default HTTP client timeout for orchestrator requests (30 s)
pub fn default_http_client_timeout_seconds() -> u64 {
    30
}

// Supervision defaults

/// Maximum runner restarts within the restart window
pub fn default_max_restarts() -> u32 {
    5
}

/// Restart rate-limiting window (60 s)
pub fn default_restart_window_seconds() -> u64 {
    60
}

// Metrics defaults

/// Number of observations kept per label combination for quantiles
pub fn quantile_window_size() -> usize {
    1_000
}

/// Quantiles exported for timing and size metrics
pub fn metric_quantiles() -> &'static [f64] {
    &[0.5, 0.75, 0.9, 0.95, 0.99]
}
