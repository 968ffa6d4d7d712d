//! Utility functions for the worker runtime
//!
//! This module provides common helpers used across the shared and worker
//! crates: timestamps, validation, backoff math, worker identity and
//! bearer-token expiry decoding.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in seconds
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Validate server URL format and structure
///
/// Ensures the URL is syntactically valid, uses an http or https scheme,
/// has a host, and carries no embedded credentials.
pub fn validate_url(url_str: &str) -> crate::Result<()> {
    use url::Url;

    let parsed = Url::parse(url_str).map_err(|e| {
        crate::RuntimeError::Validation(format!("Invalid URL '{}': {}", url_str, e))
    })?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(crate::RuntimeError::Validation(format!(
            "URL '{}' must use http:// or https:// scheme",
            url_str
        ))
        .into());
    }

    if parsed.host().is_none() {
        return Err(crate::RuntimeError::Validation(format!(
            "URL '{}' must have a valid host",
            url_str
        ))
        .into());
    }

    // Security: reject URLs with embedded credentials
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(crate::RuntimeError::Validation(format!(
            "URL '{}' must not contain embedded credentials (use the token flow)",
            url_str
        ))
        .into());
    }

    Ok(())
}

/// Truncate string to maximum length with ellipsis
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let mut end = max_len - 3;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

/// Calculate exponential backoff delay for retries
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let delay = base_delay_ms.saturating_mul(2_u64.pow(attempt.min(10)));
    delay.min(max_delay_ms)
}

/// Derive a default worker id from the host environment
///
/// Uses the HOSTNAME environment variable when available, falling back to a
/// pid-qualified identifier so concurrent processes stay distinguishable.
pub fn default_worker_id() -> String {
    match std::env::var("HOSTNAME") {
        Ok(hostname) if !hostname.trim().is_empty() => hostname,
        _ => format!("worker-{}", std::process::id()),
    }
}

/// Decode the `exp` claim (Unix seconds) from a JWT bearer token
///
/// Returns `None` when the token is not a decodable JWT; callers fall back
/// to a fixed time-to-live in that case. The signature is not verified:
/// the claim is only used to schedule client-side refresh.
pub fn decode_jwt_expiry(token: &str) -> Option<u64> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp")?.as_u64()
}
