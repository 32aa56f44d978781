//! Upstream HTTP plumbing shared by the providers
//!
//! Maps transport failures and non-success statuses onto the gateway's error
//! kinds so retry decisions can be made without inspecting provider details.

use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::warn;

use chatgate_core::{Error, Result};

/// Build the shared HTTP client. `connect_timeout` bounds connection setup;
/// the gateway enforces the between-chunk idle timeout.
pub fn build_client(connect_timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))
}

/// Classify a transport error
pub fn map_reqwest_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::upstream_timeout(err.to_string())
    } else if let Some(status) = err.status() {
        Error::upstream(Some(status.as_u16()), err.to_string())
    } else {
        Error::upstream(None, err.to_string())
    }
}

/// Pass a successful response through; turn anything else into an error.
pub async fn check_status(provider: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after_ms = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    warn!("{} API error {}: {}", provider, status, body);

    Err(status_error(provider, status, retry_after_ms, &body))
}

fn status_error(provider: &str, status: StatusCode, retry_after_ms: Option<u64>, body: &str) -> Error {
    let message = format!("{} API error {}: {}", provider, status, body);
    match status {
        StatusCode::TOO_MANY_REQUESTS => Error::rate_limited(message, retry_after_ms),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Error::upstream_timeout(message),
        _ => Error::upstream(Some(status.as_u16()), message),
    }
}

/// `retry-after-ms` (milliseconds) or `retry-after` (seconds)
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(ms) = header("retry-after-ms").and_then(|v| v.trim().parse::<f64>().ok()) {
        return Some(ms.max(0.0) as u64);
    }
    header("retry-after")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|secs| (secs.max(0.0) * 1000.0) as u64)
}
