//! Configuration resolution for the worker runtime
//!
//! Every worker property resolves from three tiers, highest priority first:
//! a worker-specific environment variable
//! (`conductor.worker.<task_def_name>.<property>`), a global environment
//! variable (`conductor.worker.all.<property>`), and finally the code-level
//! default supplied at registration. Global runtime settings (server URL,
//! credentials, protocol toggles) come from dedicated environment variables.

use crate::defaults::*;
use crate::utils::{default_worker_id, validate_url};
use tracing::warn;

/// Environment variable names consumed by the runtime
pub mod env_vars {
    pub const SERVER_URL: &str = "CONDUCTOR_SERVER_URL";
    pub const AUTH_KEY: &str = "CONDUCTOR_AUTH_KEY";
    pub const AUTH_SECRET: &str = "CONDUCTOR_AUTH_SECRET";
    pub const HTTP2_ENABLED: &str = "CONDUCTOR_HTTP2_ENABLED";
    pub const TASK_UPDATE_V2: &str = "taskUpdateV2";
}

/// Worker property names as they appear in environment variable keys
pub mod properties {
    pub const POLL_INTERVAL: &str = "poll_interval_millis";
    pub const THREAD_COUNT: &str = "thread_count";
    pub const DOMAIN: &str = "domain";
    pub const WORKER_ID: &str = "worker_id";
    pub const POLL_TIMEOUT: &str = "poll_timeout";
    pub const LEASE_EXTEND_ENABLED: &str = "lease_extend_enabled";
    pub const PAUSED: &str = "paused";
    pub const REGISTER_TASK_DEF: &str = "register_task_def";
    pub const OVERWRITE_TASK_DEF: &str = "overwrite_task_def";
    pub const STRICT_SCHEMA: &str = "strict_schema";
}

/// Credentials for the bearer-token exchange flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCredentials {
    pub key_id: String,
    pub key_secret: String,
}

/// Process-global settings for talking to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    /// Base URL of the orchestrator API, without a trailing slash
    pub base_url: String,
    /// Optional key/secret for the token exchange flow
    pub auth: Option<AuthCredentials>,
    /// Whether HTTP/2 is allowed on the transport (default true)
    pub http2_enabled: bool,
    /// Whether updates go through the chaining V2 endpoint (default true)
    pub update_v2_enabled: bool,
    /// Request timeout for orchestrator calls
    pub http_client_timeout_seconds: u64,
}

impl ServerSettings {
    /// Build settings for an explicit base URL, with environment-driven
    /// toggles applied. Used directly by tests and embedding applications.
    pub fn new(base_url: &str) -> crate::Result<Self> {
        validate_url(base_url)?;

        let auth = match (
            non_empty_env(env_vars::AUTH_KEY),
            non_empty_env(env_vars::AUTH_SECRET),
        ) {
            (Some(key_id), Some(key_secret)) => Some(AuthCredentials { key_id, key_secret }),
            (None, None) => None,
            _ => {
                return Err(crate::RuntimeError::Config(format!(
                    "{} and {} must be set together",
                    env_vars::AUTH_KEY,
                    env_vars::AUTH_SECRET
                ))
                .into())
            }
        };

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            http2_enabled: env_bool(env_vars::HTTP2_ENABLED).unwrap_or(true),
            update_v2_enabled: env_bool(env_vars::TASK_UPDATE_V2).unwrap_or(true),
            http_client_timeout_seconds: default_http_client_timeout_seconds(),
        })
    }

    /// Resolve settings from the environment. The server URL is required;
    /// a missing URL is a startup error.
    pub fn from_env() -> crate::Result<Self> {
        let base_url = non_empty_env(env_vars::SERVER_URL).ok_or_else(|| {
            crate::RuntimeError::Config(format!("{} is not set", env_vars::SERVER_URL))
        })?;
        Self::new(&base_url)
    }
}

/// Code-level defaults for a worker, supplied at registration and
/// overridable per property through the environment tiers
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub poll_interval_millis: u64,
    pub thread_count: usize,
    pub domain: Option<String>,
    pub worker_id: Option<String>,
    pub poll_timeout_millis: u64,
    pub lease_extend_enabled: bool,
    pub register_task_def: bool,
    pub overwrite_task_def: bool,
    pub strict_schema: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval_millis: default_poll_interval_millis(),
            thread_count: default_thread_count(),
            domain: None,
            worker_id: None,
            poll_timeout_millis: default_poll_timeout_millis(),
            lease_extend_enabled: default_lease_extend_enabled(),
            register_task_def: default_register_task_def(),
            overwrite_task_def: default_overwrite_task_def(),
            strict_schema: default_strict_schema(),
        }
    }
}

/// Fully resolved configuration for one worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub task_def_name: String,
    pub poll_interval_millis: u64,
    pub thread_count: usize,
    pub domain: Option<String>,
    pub worker_id: String,
    pub poll_timeout_millis: u64,
    pub lease_extend_enabled: bool,
    pub register_task_def: bool,
    pub overwrite_task_def: bool,
    pub strict_schema: bool,
}

impl WorkerConfig {
    /// Resolve the configuration for `task_def_name` against the current
    /// environment and the supplied code defaults.
    ///
    /// The `paused` flag is deliberately absent here: it is environment-only
    /// and re-read on every poll cycle via [`resolve_paused`], so it can be
    /// toggled without restarting the worker.
    pub fn resolve(task_def_name: &str, options: &WorkerOptions) -> crate::Result<Self> {
        let thread_count = resolve_int(
            task_def_name,
            properties::THREAD_COUNT,
            options.thread_count as u64,
        ) as usize;
        if thread_count == 0 {
            return Err(crate::RuntimeError::Registration(format!(
                "worker '{}': thread_count must be at least 1",
                task_def_name
            ))
            .into());
        }

        let worker_id = resolve_string(task_def_name, properties::WORKER_ID)
            .or_else(|| options.worker_id.clone())
            .unwrap_or_else(default_worker_id);

        Ok(Self {
            task_def_name: task_def_name.to_string(),
            poll_interval_millis: resolve_int(
                task_def_name,
                properties::POLL_INTERVAL,
                options.poll_interval_millis,
            ),
            thread_count,
            domain: resolve_string(task_def_name, properties::DOMAIN)
                .or_else(|| options.domain.clone()),
            worker_id,
            poll_timeout_millis: resolve_int(
                task_def_name,
                properties::POLL_TIMEOUT,
                options.poll_timeout_millis,
            ),
            lease_extend_enabled: resolve_bool(
                task_def_name,
                properties::LEASE_EXTEND_ENABLED,
                options.lease_extend_enabled,
            ),
            register_task_def: resolve_bool(
                task_def_name,
                properties::REGISTER_TASK_DEF,
                options.register_task_def,
            ),
            overwrite_task_def: resolve_bool(
                task_def_name,
                properties::OVERWRITE_TASK_DEF,
                options.overwrite_task_def,
            ),
            strict_schema: resolve_bool(
                task_def_name,
                properties::STRICT_SCHEMA,
                options.strict_schema,
            ),
        })
    }
}

/// Re-read the environment-only `paused` flag for a worker.
/// Called once per poll cycle so operators can pause and resume a worker
/// without restarting the process.
pub fn resolve_paused(task_def_name: &str) -> bool {
    resolve_bool(task_def_name, properties::PAUSED, false)
}

/// Worker-specific env key for a property
fn worker_key(task_def_name: &str, property: &str) -> String {
    format!("conductor.worker.{}.{}", task_def_name, property)
}

/// Global env key for a property
fn global_key(property: &str) -> String {
    format!("conductor.worker.all.{}", property)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Look up a property value through the worker-specific and global tiers
fn resolve_string(task_def_name: &str, property: &str) -> Option<String> {
    non_empty_env(&worker_key(task_def_name, property))
        .or_else(|| non_empty_env(&global_key(property)))
}

fn resolve_int(task_def_name: &str, property: &str, code_default: u64) -> u64 {
    match resolve_string(task_def_name, property) {
        Some(raw) => match raw.parse::<u64>() {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    worker = task_def_name,
                    property, value = %raw,
                    "Ignoring unparseable integer property from environment"
                );
                code_default
            }
        },
        None => code_default,
    }
}

fn resolve_bool(task_def_name: &str, property: &str, code_default: bool) -> bool {
    match resolve_string(task_def_name, property).and_then(|raw| parse_bool(&raw)) {
        Some(value) => value,
        None => code_default,
    }
}

fn env_bool(key: &str) -> Option<bool> {
    non_empty_env(key).and_then(|raw| parse_bool(&raw))
}

/// Parse a boolean property: `true|1|yes` and `false|0|no`, case-insensitive
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        other => {
            warn!(value = other, "Ignoring unparseable boolean property");
            None
        }
    }
}
