//! HTTP retry with exponential backoff.
//!
//! Every request to the feature service and the token endpoint goes through
//! [`send_json`] rather than `reqwest::RequestBuilder::send()` so transient
//! failures (timeouts, connection resets, HTTP 429, HTTP 5xx) are retried
//! with bounded backoff.
//!
//! ```ignore
//! let body = retry::send_json(&policy, || client.get(&url).query(&params)).await?;
//! ```

use std::time::Duration;

use crate::FeatureServiceError;

/// Maximum length of the response body preview included in error logs.
const BODY_PREVIEW_LEN: usize = 500;

/// Bounds on how hard a single logical request is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Connection-level retries (connection failures, timeouts, 429, 5xx).
    pub max_retries: u32,
    /// Full re-fetches when the body cannot be read or decoded.
    pub max_body_retries: u32,
    /// Delay before the first retry. Doubles on each further attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    /// Five retries at 2s, 4s, 8s, 16s, 32s.
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_body_retries: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            max_body_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

/// Sends an HTTP request and parses the response body as JSON.
///
/// `build_request` is called once per attempt since builders are consumed
/// by `.send()`.
///
/// Two layers of retry:
///
/// 1. **Connection-level**: up to [`RetryPolicy::max_retries`] on
///    connection errors, timeouts, HTTP 429 and HTTP 5xx.
/// 2. **Body-decode**: a body that cannot be read or parsed triggers a
///    full re-fetch, up to [`RetryPolicy::max_body_retries`] times.
///
/// HTTP 4xx other than 429 is permanent and returned immediately.
///
/// # Errors
///
/// Returns [`FeatureServiceError`] once retries are exhausted or on a
/// permanent failure.
#[allow(clippy::future_not_send)]
pub async fn send_json<F>(
    policy: &RetryPolicy,
    build_request: F,
) -> Result<serde_json::Value, FeatureServiceError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut body_attempt = 0;
    loop {
        let response = send_inner(policy, &build_request).await?;
        let url = response.url().to_string();
        let status = response.status();

        let failure = match response.text().await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(value) => return Ok(value),
                Err(json_err) => {
                    let preview: String = text.chars().take(BODY_PREVIEW_LEN).collect();
                    log::warn!(
                        "JSON parse failed\n  url: {url}\n  status: {status}\n  \
                         received: {} bytes\n  parse error: {json_err}\n  \
                         body preview: {preview}",
                        text.len(),
                    );
                    FeatureServiceError::Json(json_err)
                }
            },
            Err(e) => {
                log::warn!("Response body read failed\n  url: {url}\n  status: {status}\n  error: {e}");
                FeatureServiceError::Http(e)
            }
        };

        if body_attempt >= policy.max_body_retries {
            log::error!("Giving up on {url} after {body_attempt} body retries");
            return Err(failure);
        }
        body_attempt += 1;
        let delay = policy.delay_for(body_attempt);
        log::warn!(
            "  body retry {body_attempt}/{} in {delay:?}...",
            policy.max_body_retries
        );
        tokio::time::sleep(delay).await;
    }
}

/// Connection-level retry loop. Returns the first 2xx/3xx response.
#[allow(clippy::future_not_send)]
async fn send_inner<F>(
    policy: &RetryPolicy,
    build_request: &F,
) -> Result<reqwest::Response, FeatureServiceError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            log::warn!("  retry {attempt}/{} in {delay:?}...", policy.max_retries);
            tokio::time::sleep(delay).await;
        }
        let can_retry = attempt < policy.max_retries;
        attempt += 1;

        match build_request().send().await {
            Err(e) => {
                if is_transient(&e) && can_retry {
                    log::warn!("  transient error: {e}");
                    continue;
                }
                return Err(FeatureServiceError::Http(e));
            }
            Ok(response) => {
                let status = response.status();
                match classify_status(status) {
                    StatusClass::Success => return Ok(response),
                    StatusClass::Retryable if can_retry => {
                        log::warn!("  HTTP {status}");
                    }
                    StatusClass::Retryable => {
                        return Err(FeatureServiceError::Protocol {
                            message: format!(
                                "HTTP {status} after {} retries",
                                policy.max_retries
                            ),
                        });
                    }
                    StatusClass::Permanent => {
                        return Err(FeatureServiceError::Protocol {
                            message: format!("HTTP {status}"),
                        });
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Success,
    Retryable,
    Permanent,
}

fn classify_status(status: reqwest::StatusCode) -> StatusClass {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StatusClass::Retryable
    } else if status.is_client_error() {
        StatusClass::Permanent
    } else {
        StatusClass::Success
    }
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(32));
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(reqwest::StatusCode::OK),
            StatusClass::Success
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS),
            StatusClass::Retryable
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY),
            StatusClass::Retryable
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::NOT_FOUND),
            StatusClass::Permanent
        );
    }

    #[tokio::test]
    async fn connection_refused_fails_without_retry_budget() {
        let client = reqwest::Client::new();
        let result = send_json(&RetryPolicy::none(), || {
            client.get("http://127.0.0.1:9/arcgis/rest/services")
        })
        .await;
        assert!(matches!(result, Err(FeatureServiceError::Http(_))));
    }
}
