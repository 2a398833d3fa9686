//! Shared HTTP client construction and status classification.

use std::time::Duration;

use reqwest::StatusCode;

use crate::error::LlmError;

/// Create a shared HTTP client with standard Quarry configuration.
///
/// Config: 30s connect timeout, 120s request timeout, rustls TLS,
/// `quarry/{version}` user-agent, redirect limit 10.
///
/// # Errors
///
/// Returns `LlmError::Http` if the TLS backend cannot be initialised.
pub fn default_client() -> Result<reqwest::Client, LlmError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(120))
        .user_agent(concat!("quarry/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?)
}

/// Parse the `Retry-After` header value as whole seconds.
pub(crate) fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success status to an error that tells the retry loop whether to try again.
pub(crate) fn status_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> LlmError {
    let detail = format!("{provider} returned {status}: {}", truncate(body, 200));
    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::Auth(detail),
        StatusCode::REQUEST_TIMEOUT => LlmError::Unavailable(detail),
        s if s.is_server_error() => LlmError::Unavailable(detail),
        s if s.is_client_error() => LlmError::InvalidRequest(detail),
        _ => LlmError::Other(detail),
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
