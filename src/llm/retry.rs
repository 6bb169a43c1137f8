//! Retry policy for LLM transport.
//!
//! Exponential backoff with jitter. Transport errors and 5xx responses
//! retry; 4xx responses are terminal except 408 and 429. A `Retry-After`
//! header, when present, overrides the computed delay.

use std::time::Duration;

use rand::Rng;

use crate::config::AgentConfig;
use crate::error::{DbRheoError, Result};

/// Backoff settings, sourced from config.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Reads the policy from config keys under `retry.`.
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_attempts: config.get_u64("retry.max_attempts", 3) as u32,
            base_delay: Duration::from_millis(config.get_u64("retry.base_delay_ms", 500)),
            backoff_factor: config.get_f64("retry.backoff_factor", 2.0),
            max_delay: Duration::from_millis(config.get_u64("retry.max_delay_ms", 30_000)),
        }
    }

    /// Delay before the given retry attempt (0-based), with jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let exponential = base * self.backoff_factor.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_millis() as f64);
        // Up to 10% jitter to avoid thundering herds.
        let jitter = capped * 0.1 * rand::thread_rng().gen::<f64>();
        Duration::from_millis((capped + jitter) as u64)
    }
}

/// Classifies an HTTP status for retry purposes. Returns the mapped error
/// and whether it is retryable.
pub fn classify_status(status: u16, body: &str) -> (DbRheoError, bool) {
    match status {
        401 | 403 => (
            DbRheoError::auth(format!("Provider rejected the API key ({status})")),
            false,
        ),
        408 => (DbRheoError::timeout("Provider timed out (408)"), true),
        429 => (
            DbRheoError::rate_limit(format!("Rate limited (429): {}", truncate(body))),
            true,
        ),
        s if s >= 500 => (
            DbRheoError::llm_transport(format!("Server error ({s}): {}", truncate(body))),
            true,
        ),
        s => (
            DbRheoError::llm_protocol(format!("Request failed ({s}): {}", truncate(body))),
            false,
        ),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(300).collect()
}

/// Parses a `Retry-After` header value (seconds form).
pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Sends a request repeatedly until it succeeds, the error is terminal, or
/// attempts are exhausted. The closure builds a fresh request each try.
pub async fn send_with_retry<F, Fut>(policy: &RetryPolicy, mut send: F) -> Result<reqwest::Response>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
{
    let mut last_error: Option<DbRheoError> = None;

    for attempt in 0..policy.max_attempts.max(1) {
        match send().await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                let status = response.status().as_u16();
                let retry_after = parse_retry_after(
                    response.headers().get(reqwest::header::RETRY_AFTER),
                );
                let body = response.text().await.unwrap_or_default();
                let (error, retryable) = classify_status(status, &body);
                if !retryable || attempt + 1 >= policy.max_attempts {
                    return Err(error);
                }
                let delay = retry_after.unwrap_or_else(|| policy.delay_for(attempt));
                tracing::warn!(status, attempt, ?delay, "LLM request failed, retrying");
                last_error = Some(error);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                let error = if e.is_timeout() {
                    DbRheoError::timeout(format!("Provider request timed out: {e}"))
                } else {
                    DbRheoError::llm_transport(format!("Request failed: {e}"))
                };
                if attempt + 1 >= policy.max_attempts {
                    return Err(error);
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(attempt, ?delay, "LLM transport error, retrying");
                last_error = Some(error);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| DbRheoError::internal("retry loop made no attempts")))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_config() {
        let config = AgentConfig::for_tests(
            serde_yaml::from_str("retry:\n  max_attempts: 5\n  base_delay_ms: 100").unwrap(),
        );
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        };
        let d0 = policy.delay_for(0);
        let d2 = policy.delay_for(2);
        assert!(d2 > d0);
        // With 10% jitter the delay stays within [base, base * 1.1].
        assert!(d0 >= Duration::from_millis(100));
        assert!(d0 <= Duration::from_millis(110));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            backoff_factor: 10.0,
            max_delay: Duration::from_secs(5),
        };
        assert!(policy.delay_for(9) <= Duration::from_millis(5500));
    }

    #[test]
    fn test_classify_status() {
        let (err, retryable) = classify_status(401, "");
        assert_eq!(err.kind(), "AuthError");
        assert!(!retryable);

        let (err, retryable) = classify_status(429, "slow down");
        assert_eq!(err.kind(), "RateLimitError");
        assert!(retryable);

        let (err, retryable) = classify_status(503, "");
        assert_eq!(err.kind(), "LLMTransportError");
        assert!(retryable);

        let (err, retryable) = classify_status(400, "bad request");
        assert_eq!(err.kind(), "LLMProtocolError");
        assert!(!retryable);

        let (_, retryable) = classify_status(408, "");
        assert!(retryable);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let value = reqwest::header::HeaderValue::from_static("7");
        assert_eq!(
            parse_retry_after(Some(&value)),
            Some(Duration::from_secs(7))
        );
        let junk = reqwest::header::HeaderValue::from_static("soon");
        assert_eq!(parse_retry_after(Some(&junk)), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
