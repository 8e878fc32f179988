//! HTTP retry with backoff for transient service errors.
//!
//! Wraps `reqwest` sends with exponential backoff on 429 and 5xx
//! responses, honoring Retry-After where present. Non-retryable statuses
//! (4xx except 429) pass straight through to the caller.

use reqwest::{Client, Request, Response};
use std::time::Duration;

/// Retry behavior shared by all backends.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Exponential backoff with up to 50% random jitter, capped.
fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let base = policy.base_delay_ms as f64 * policy.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(policy.max_delay_ms as f64);
    Duration::from_millis((capped * (1.0 + rand::random::<f64>() * 0.5)) as u64)
}

/// Delay before the next attempt. An explicit Retry-After in whole
/// seconds wins, capped at five minutes; the HTTP-date form is rare in
/// cloud storage APIs and falls through to backoff.
fn retry_delay(attempt: u32, response: &Response, policy: &RetryPolicy) -> Duration {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs.min(300)))
        .unwrap_or_else(|| backoff_delay(attempt, policy))
}

/// Send a request, retrying 429/5xx responses with backoff.
///
/// Every request built by the backends carries a buffered body, so it is
/// cloned for the next attempt up front; a request with a streaming body
/// would go out once without retries rather than fail the call.
pub async fn send_with_retry(
    client: &Client,
    request: Request,
    policy: &RetryPolicy,
    operation: &str,
) -> Result<Response, reqwest::Error> {
    let mut request = request;
    let mut attempt = 0;
    loop {
        let next = request.try_clone();
        let response = client.execute(request).await?;
        let status = response.status().as_u16();

        let Some(retry) =
            next.filter(|_| is_retryable_status(status) && attempt < policy.max_retries)
        else {
            return Ok(response);
        };

        let delay = retry_delay(attempt, &response, policy);
        attempt += 1;
        tracing::debug!(
            "{}: HTTP {} from {}, attempt {}/{} in {:?}",
            operation,
            status,
            retry.url(),
            attempt,
            policy.max_retries,
            delay
        );
        tokio::time::sleep(delay).await;
        request = retry;
    }
}
