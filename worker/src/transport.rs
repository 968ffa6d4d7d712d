//! HTTP transport shared by all runners
//!
//! One [`ApiClient`] is shared across every runner in the process so the
//! connection pool is reused. It attaches bearer authentication, coordinates
//! token refresh on 401 responses, recreates the underlying client after
//! protocol-layer failures, and emits a timing event for every request.

use crate::events::{EventBus, WorkerEvent};
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use shared::api::{endpoints, headers, uri_pattern, TokenRequest, TokenResponse};
use shared::config::{AuthCredentials, ServerSettings};
use shared::defaults::{default_auth_max_attempts, default_token_ttl_seconds};
use shared::model::{Task, TaskDef, TaskResult};
use shared::utils::{calculate_backoff_delay, current_timestamp, decode_jwt_expiry};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Seconds before the recorded expiry at which a token counts as stale
const TOKEN_REFRESH_MARGIN_SECONDS: u64 = 30;

/// Base delay between repeated authentication attempts
const AUTH_BACKOFF_BASE_MS: u64 = 1_000;

/// Cap on the delay between repeated authentication attempts
const AUTH_BACKOFF_MAX_MS: u64 = 30_000;

/// Errors surfaced by the transport layer
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Network or protocol-layer failure (connection refused, reset, timeout)
    #[error("request failed: {0}")]
    Request(String),

    /// Token exchange failed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server kept rejecting credentials after refresh and backoff
    #[error("unauthorized after {0} attempts")]
    Unauthorized(u32),

    /// Non-success response from the server
    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },

    /// 409/404 on an update: the lease expired and the server reassigned
    /// the task. Logged and never retried.
    #[error("task no longer owned by this worker (status {status})")]
    TaskMovedOn { status: u16 },

    /// Response body could not be parsed
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Short classification used as the `exception` metric label
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Request(_) => "TransportError",
            TransportError::Auth(_) | TransportError::Unauthorized(_) => "AuthorizationError",
            TransportError::Server { .. } => "ServerError",
            TransportError::TaskMovedOn { .. } => "Conflict",
            TransportError::Decode(_) => "DecodeError",
        }
    }

    pub fn is_task_moved_on(&self) -> bool {
        matches!(self, TransportError::TaskMovedOn { .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        TransportError::Request(error.to_string())
    }
}

/// Cached bearer token with its client-side expiry estimate
struct TokenState {
    token: String,
    expires_at: u64,
}

/// Shared HTTP client for the orchestrator API
pub struct ApiClient {
    settings: ServerSettings,
    /// Recreated after protocol-layer errors; reads clone the cheap handle
    client: RwLock<reqwest::Client>,
    /// Token cache; the mutex makes concurrent 401s coalesce into a single
    /// refresh (waiters re-check freshness after acquiring the lock)
    token: Mutex<Option<TokenState>>,
    events: EventBus,
}

impl ApiClient {
    pub fn new(settings: ServerSettings, events: EventBus) -> shared::Result<Self> {
        let client = build_client(&settings)?;
        Ok(Self {
            settings,
            client: RwLock::new(client),
            token: Mutex::new(None),
            events,
        })
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Eagerly exchange credentials for a token. Called at handler startup
    /// so an unreachable server or bad credentials fail fast.
    pub async fn authenticate(&self) -> Result<(), TransportError> {
        if self.settings.auth.is_some() {
            self.bearer_token().await?;
            info!("Authenticated with the orchestrator");
        }
        Ok(())
    }

    /// Batch poll for up to `count` tasks of `task_type`
    pub async fn poll_batch(
        &self,
        task_type: &str,
        worker_id: &str,
        domain: Option<&str>,
        count: usize,
        timeout_millis: u64,
    ) -> Result<Vec<Task>, TransportError> {
        let path = endpoints::poll_batch(task_type);
        let mut query = vec![
            ("workerid", worker_id.to_string()),
            ("count", count.to_string()),
            ("timeout", timeout_millis.to_string()),
        ];
        if let Some(domain) = domain {
            query.push(("domain", domain.to_string()));
        }

        let response = self.send(Method::GET, &path, &query, None).await?;
        let response = expect_success(response, false).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// Submit a result through the legacy endpoint (acknowledgment only)
    pub async fn update(&self, result: &TaskResult) -> Result<(), TransportError> {
        let body = serde_json::to_value(result).map_err(|e| TransportError::Decode(e.to_string()))?;
        let response = self
            .send(Method::POST, endpoints::UPDATE, &[], Some(body))
            .await?;
        expect_success(response, true).await?;
        Ok(())
    }

    /// Submit a result through the V2 endpoint. The response may carry the
    /// next pending task of the same type; a payload without a task id is
    /// treated as "no next task".
    pub async fn update_v2(&self, result: &TaskResult) -> Result<Option<Task>, TransportError> {
        let body = serde_json::to_value(result).map_err(|e| TransportError::Decode(e.to_string()))?;
        let response = self
            .send(Method::POST, endpoints::UPDATE_V2, &[], Some(body))
            .await?;
        let response = expect_success(response, true).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        match serde_json::from_slice::<Task>(&bytes) {
            Ok(task) if !task.task_id.is_empty() => Ok(Some(task)),
            Ok(_) => {
                warn!("Update response carried a task without a taskId; ignoring it");
                Ok(None)
            }
            Err(_) => {
                // Plain acknowledgment bodies are valid V2 responses.
                debug!("Update response carried no next task");
                Ok(None)
            }
        }
    }

    /// Append one log line to a task
    pub async fn append_log(&self, task_id: &str, line: &str) -> Result<(), TransportError> {
        let response = self
            .send(
                Method::POST,
                &endpoints::task_log(task_id),
                &[],
                Some(Value::String(line.to_string())),
            )
            .await?;
        expect_success(response, true).await?;
        Ok(())
    }

    /// Fetch a task by id (diagnostics)
    pub async fn get_task(&self, task_id: &str) -> Result<Task, TransportError> {
        let response = self
            .send(Method::GET, &endpoints::task_by_id(task_id), &[], None)
            .await?;
        let response = expect_success(response, false).await?;
        response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// Queue depth per task type (used for gauge-style diagnostics)
    pub async fn queue_sizes(
        &self,
        task_types: &[&str],
    ) -> Result<HashMap<String, i64>, TransportError> {
        let query: Vec<(&str, String)> = task_types
            .iter()
            .map(|task_type| ("taskType", task_type.to_string()))
            .collect();
        let response = self
            .send(Method::GET, endpoints::QUEUE_SIZES, &query, None)
            .await?;
        let response = expect_success(response, false).await?;
        response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// Register a task definition at startup
    pub async fn register_task_def(
        &self,
        task_def: &TaskDef,
        overwrite: bool,
    ) -> Result<(), TransportError> {
        let response = if overwrite {
            let body =
                serde_json::to_value(task_def).map_err(|e| TransportError::Decode(e.to_string()))?;
            self.send(Method::PUT, endpoints::TASK_DEFS, &[], Some(body))
                .await?
        } else {
            let body = serde_json::to_value(vec![task_def])
                .map_err(|e| TransportError::Decode(e.to_string()))?;
            self.send(Method::POST, endpoints::TASK_DEFS, &[], Some(body))
                .await?
        };
        expect_success(response, false).await?;
        Ok(())
    }

    /// Core request path: attach authentication, time the request, handle
    /// 401 refresh-and-retry and protocol-error client recreation.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<reqwest::Response, TransportError> {
        let max_auth_attempts = default_auth_max_attempts();
        let mut auth_attempt: u32 = 0;
        let mut protocol_retry_used = false;

        loop {
            let token = self.bearer_token().await?;

            let client = self.client.read().await.clone();
            let url = format!("{}{}", self.settings.base_url, path);
            let mut request = client.request(method.clone(), &url);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }
            if let Some(token) = &token {
                request = request.header(headers::AUTHORIZATION, token);
            }

            let started = Instant::now();
            let outcome = request.send().await;
            self.emit_timing(&method, path, &outcome, started.elapsed());

            match outcome {
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED
                    && self.settings.auth.is_some() =>
                {
                    auth_attempt += 1;
                    if auth_attempt >= max_auth_attempts {
                        return Err(TransportError::Unauthorized(auth_attempt));
                    }
                    warn!(
                        path,
                        attempt = auth_attempt,
                        "Received 401, refreshing token and retrying"
                    );
                    self.refresh_token(token.as_deref()).await?;
                    if auth_attempt > 1 {
                        // Persistent 401s back off with jitter before the
                        // next attempt rather than hammering the server.
                        let delay = calculate_backoff_delay(
                            auth_attempt - 2,
                            AUTH_BACKOFF_BASE_MS,
                            AUTH_BACKOFF_MAX_MS,
                        );
                        tokio::time::sleep(jittered_delay(delay)).await;
                    }
                }
                Ok(response) => return Ok(response),
                Err(error)
                    if !protocol_retry_used
                        && method == Method::GET
                        && is_protocol_error(&error) =>
                {
                    // A connection-layer failure mid-request: recreate the
                    // client once and retry the idempotent request.
                    warn!(path, %error, "Protocol error, recreating HTTP client and retrying");
                    protocol_retry_used = true;
                    self.rebuild_client().await?;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn emit_timing(
        &self,
        method: &Method,
        path: &str,
        outcome: &Result<reqwest::Response, reqwest::Error>,
        duration: Duration,
    ) {
        let status = match outcome {
            Ok(response) => response.status().as_u16().to_string(),
            Err(_) => "ERROR".to_string(),
        };
        self.events.publish(&WorkerEvent::HttpRequest {
            method: method.to_string(),
            uri: uri_pattern(path),
            status,
            duration,
        });
    }

    /// Current bearer token, refreshing when absent or stale.
    /// Returns `None` when no credentials are configured.
    async fn bearer_token(&self) -> Result<Option<String>, TransportError> {
        let Some(credentials) = &self.settings.auth else {
            return Ok(None);
        };

        let mut cached = self.token.lock().await;
        let now = current_timestamp();
        if let Some(state) = cached.as_ref() {
            if state.expires_at > now + TOKEN_REFRESH_MARGIN_SECONDS {
                return Ok(Some(state.token.clone()));
            }
        }

        let state = self.exchange_token(credentials).await?;
        let token = state.token.clone();
        *cached = Some(state);
        Ok(Some(token))
    }

    /// Refresh after a 401. Requests that raced on the same stale token
    /// queue on the mutex; whoever arrives after the refresh finds a fresh
    /// token and skips the exchange.
    async fn refresh_token(&self, stale: Option<&str>) -> Result<(), TransportError> {
        let Some(credentials) = &self.settings.auth else {
            return Ok(());
        };

        let mut cached = self.token.lock().await;
        let now = current_timestamp();
        if let Some(state) = cached.as_ref() {
            let already_refreshed = stale.is_some_and(|stale| stale != state.token);
            if already_refreshed && state.expires_at > now {
                return Ok(());
            }
        }

        *cached = Some(self.exchange_token(credentials).await?);
        Ok(())
    }

    /// Exchange key+secret for a bearer token. The expiry comes from the
    /// token's `exp` claim when decodable, else a fixed TTL.
    async fn exchange_token(
        &self,
        credentials: &AuthCredentials,
    ) -> Result<TokenState, TransportError> {
        let client = self.client.read().await.clone();
        let url = format!("{}{}", self.settings.base_url, endpoints::TOKEN);
        let request = TokenRequest {
            key_id: credentials.key_id.clone(),
            key_secret: credentials.key_secret.clone(),
        };

        let started = Instant::now();
        let outcome = client.post(&url).json(&request).send().await;
        self.emit_timing(&Method::POST, endpoints::TOKEN, &outcome, started.elapsed());

        let response = outcome?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Auth(format!(
                "token exchange returned {}: {}",
                status, body
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        let expires_at = decode_jwt_expiry(&token_response.token)
            .unwrap_or_else(|| current_timestamp() + default_token_ttl_seconds());

        debug!(expires_at, "Obtained bearer token");
        Ok(TokenState {
            token: token_response.token,
            expires_at,
        })
    }

    async fn rebuild_client(&self) -> Result<(), TransportError> {
        let fresh = build_client(&self.settings)
            .map_err(|e| TransportError::Request(format!("failed to rebuild client: {e}")))?;
        *self.client.write().await = fresh;
        Ok(())
    }
}

fn build_client(settings: &ServerSettings) -> shared::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.http_client_timeout_seconds));
    if !settings.http2_enabled {
        builder = builder.http1_only();
    }
    builder
        .build()
        .map_err(|e| shared::RuntimeError::Network(format!("failed to build HTTP client: {e}")).into())
}

/// Non-success handling shared by the typed calls. When `moved_on_aware`
/// is set (updates and log appends), 409 and 404 map to
/// [`TransportError::TaskMovedOn`] so callers can stop retrying.
async fn expect_success(
    response: reqwest::Response,
    moved_on_aware: bool,
) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if moved_on_aware
        && (status == StatusCode::CONFLICT || status == StatusCode::NOT_FOUND)
    {
        return Err(TransportError::TaskMovedOn {
            status: status.as_u16(),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Server {
        status: status.as_u16(),
        body,
    })
}

fn is_protocol_error(error: &reqwest::Error) -> bool {
    !error.is_timeout() && (error.is_connect() || error.is_request())
}

/// Apply ±10% jitter to a millisecond delay
pub(crate) fn jittered_delay(base_ms: u64) -> Duration {
    let factor: f64 = rand::rng().random_range(0.9..=1.1);
    Duration::from_millis((base_ms as f64 * factor) as u64)
}
