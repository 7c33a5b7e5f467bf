use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;
use tracing::warn;

/// Error taxonomy surfaced by adapters. `TransientUpstream`/`RateLimited`
/// have already exhausted [`RetryPolicy`] by the time they reach a caller.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("transient upstream error: {0}")]
    TransientUpstream(String),
    #[error("permanent upstream error: {0}")]
    PermanentUpstream(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
}

/// Single reusable retry policy composed with every adapter call: base delay
/// 1s, factor 2, max 3 retries on network errors and HTTP 429/5xx. 429
/// additionally honors a `Retry-After` header when present. 4xx other than
/// 429 fails immediately with no retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: f64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_secs(1), factor: 2.0, max_retries: 3 }
    }
}

impl RetryPolicy {
    /// Runs `builder_fn` (a fresh `RequestBuilder` per attempt, since a sent
    /// request can't be resent) until it succeeds, permanently fails, or
    /// exhausts retries.
    pub async fn call(
        &self,
        label: &str,
        mut builder_fn: impl FnMut() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, AdapterError> {
        let mut attempt = 0u32;
        let mut delay = self.base_delay;

        loop {
            let sent = builder_fn()
                .send()
                .await
                .map_err(|e| AdapterError::TransientUpstream(format!("{label}: {e}")));

            let response = match sent {
                Ok(r) => r,
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(e);
                    }
                    warn!("{label}: network error, retrying ({}/{})", attempt + 1, self.max_retries);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    delay = delay.mul_f64(self.factor);
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.max_retries {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(delay);
                warn!("{label}: rate limited, retrying in {:?} ({}/{})", retry_after, attempt + 1, self.max_retries);
                tokio::time::sleep(retry_after).await;
                attempt += 1;
                delay = delay.mul_f64(self.factor);
                continue;
            }

            if status.is_server_error() && attempt < self.max_retries {
                warn!("{label}: server error {}, retrying ({}/{})", status, attempt + 1, self.max_retries);
                tokio::time::sleep(delay).await;
                attempt += 1;
                delay = delay.mul_f64(self.factor);
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(label, status, &body));
        }
    }
}

fn classify_failure(label: &str, status: StatusCode, body: &str) -> AdapterError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AdapterError::AuthFailed(format!("{label}: {status}: {body}"))
        }
        StatusCode::NOT_FOUND => AdapterError::NotFound(format!("{label}: {body}")),
        StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited(format!("{label}: {body}")),
        s if s.is_server_error() => AdapterError::PermanentUpstream(format!("{label}: {s}: {body}")),
        _ => AdapterError::InvalidArgument(format!("{label}: {status}: {body}")),
    }
}
