//! Shared HTTP plumbing: client construction, timed request logging and
//! URL sanitization that never leaks signed-URL parameters.

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// User agent string for all Hotjar requests.
const CLIENT_USER_AGENT: &str = concat!("tap-hotjar/", env!("CARGO_PKG_VERSION"));

/// Query parameter keys (case-insensitive) whose values are redacted in logs.
/// Download URLs are pre-signed, so their signature parameters are secrets.
const SENSITIVE_QUERY_PARAMS: &[&str] = &[
    "signature",
    "sig",
    "token",
    "expires",
    "policy",
    "key-pair-id",
    "x-amz-signature",
    "x-amz-credential",
    "x-amz-security-token",
    "password",
];

// ─────────────────────────────────────────────────────────────────────────────
// LoggingMode
// ─────────────────────────────────────────────────────────────────────────────

/// Controls how URLs are sanitized for logging.
///
/// Configured as `"path_only"` or `"path_and_query_redacted"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggingMode {
    /// Log only the path component. Strips scheme, host, query, and fragment.
    /// Example: `/api/v1/sites/12/polls/34/responses/export`
    #[default]
    PathOnly,

    /// Log path and query parameters, but redact sensitive values.
    /// Example: `/exports/abc.zip?X-Amz-Signature=***&response-content-type=zip`
    PathAndQueryRedacted,
}

// ─────────────────────────────────────────────────────────────────────────────
// URL Sanitization
// ─────────────────────────────────────────────────────────────────────────────

/// Determines if a query parameter key is sensitive and should be redacted.
fn is_sensitive_param(key: &str) -> bool {
    let key_lower = key.to_ascii_lowercase();
    SENSITIVE_QUERY_PARAMS
        .iter()
        .any(|&sensitive| key_lower == sensitive)
}

/// Sanitizes a URL for safe logging based on the specified mode.
///
/// The result never contains the scheme, host, or fragment.
pub fn sanitize_url_for_logs(url: &Url, mode: LoggingMode) -> String {
    let path = url.path();

    match mode {
        LoggingMode::PathOnly => path.to_string(),
        LoggingMode::PathAndQueryRedacted => {
            let query_pairs: Vec<_> = url.query_pairs().collect();
            if query_pairs.is_empty() {
                return path.to_string();
            }

            let redacted_pairs: Vec<String> = query_pairs
                .into_iter()
                .map(|(key, value)| {
                    if is_sensitive_param(&key) {
                        format!("{}=***", key)
                    } else {
                        format!("{}={}", key, value)
                    }
                })
                .collect();

            format!("{}?{}", path, redacted_pairs.join("&"))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client & request helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Builds the configured HTTP client.
pub(crate) fn build_http_client(timeout: Duration) -> Result<reqwest::Client, AppError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))
}

/// Sends a request, logging method, sanitized path, status and duration.
///
/// Connection failures and timeouts map to `TransientNetwork`. The raw
/// reqwest error is never surfaced since it may contain the full URL.
pub(crate) async fn send_logged(
    request: reqwest::RequestBuilder,
    method: &Method,
    url: &Url,
    mode: LoggingMode,
) -> Result<reqwest::Response, AppError> {
    let start = Instant::now();
    let sanitized_url = sanitize_url_for_logs(url, mode);

    let result = request.send().await;
    let duration_ms = start.elapsed().as_millis();

    match result {
        Ok(response) => {
            info!(
                "[HTTP] {} {} {} {}ms",
                method,
                sanitized_url,
                response.status().as_u16(),
                duration_ms
            );
            Ok(response)
        }
        Err(e) => {
            info!("[HTTP] {} {} FAILED {}ms", method, sanitized_url, duration_ms);
            let kind = if e.is_timeout() { "timed out" } else { "failed" };
            Err(AppError::TransientNetwork(format!(
                "{} {} {}",
                method, sanitized_url, kind
            )))
        }
    }
}

/// Maps a non-success status to the error taxonomy.
///
/// 5xx and 429 are retryable. Everything else is terminal for the call.
pub(crate) fn status_error(status: StatusCode) -> AppError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AppError::TransientNetwork(format!(
            "HTTP {} - {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown error")
        ))
    } else {
        AppError::RequestRejected {
            status: status.as_u16(),
        }
    }
}

/// True for statuses that mean the session is not (or no longer) accepted.
pub(crate) fn is_auth_rejection(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}
