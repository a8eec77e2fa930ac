//! Retry, polling, and backoff policy
//!
//! Three independent budgets apply to a request:
//! - long-request polling follows `DELAY_BEFORE_POLLING`
//! - 503 responses follow `CONCURRENCY_BACKOFF` with their own counter
//! - everything else transient consumes the generic retry budget

use reqwest::StatusCode;
use std::time::Duration;

/// Polling delays for long-running requests: five tries at 500ms, five at
/// 1s, five at 2s, then steady 5s.
pub const DELAY_BEFORE_POLLING: &[u64] = &[
    500, 500, 500, 500, 500, 1000, 1000, 1000, 1000, 1000, 2000, 2000, 2000, 2000, 2000, 5000,
];

/// Backoff for concurrency-blocked (503) requests: five tries at 2s, four
/// at 5s, then steady 10s.
pub const CONCURRENCY_BACKOFF: &[u64] = &[
    2000, 2000, 2000, 2000, 2000, 5000, 5000, 5000, 5000, 10_000,
];

/// Delay for the `attempt`-th poll/backoff, saturating at the last tier.
pub fn schedule_delay(schedule: &[u64], attempt: usize) -> Duration {
    let index = attempt.min(schedule.len() - 1);
    Duration::from_millis(schedule[index])
}

/// Generic retry budget for one request
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay_before_retry: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            delay_before_retry: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, delay_before_retry: Duration) -> Self {
        Self {
            retries,
            delay_before_retry,
        }
    }
}

/// HTTP statuses retried under the generic budget
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::NOT_FOUND
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Connection-level failures retried under the generic budget
/// (reset/aborted/timeout/dns failures surface through reqwest this way).
pub fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

/// Parse a `Retry-After` header value (seconds) into a delay.
pub fn retry_after_delay(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_schedule_tiers() {
        assert_eq!(schedule_delay(DELAY_BEFORE_POLLING, 0).as_millis(), 500);
        assert_eq!(schedule_delay(DELAY_BEFORE_POLLING, 4).as_millis(), 500);
        assert_eq!(schedule_delay(DELAY_BEFORE_POLLING, 5).as_millis(), 1000);
        assert_eq!(schedule_delay(DELAY_BEFORE_POLLING, 12).as_millis(), 2000);
        assert_eq!(schedule_delay(DELAY_BEFORE_POLLING, 15).as_millis(), 5000);
        // Saturates at the steady tier
        assert_eq!(schedule_delay(DELAY_BEFORE_POLLING, 100).as_millis(), 5000);
    }

    #[test]
    fn concurrency_backoff_tiers() {
        assert_eq!(schedule_delay(CONCURRENCY_BACKOFF, 0).as_millis(), 2000);
        assert_eq!(schedule_delay(CONCURRENCY_BACKOFF, 5).as_millis(), 5000);
        assert_eq!(schedule_delay(CONCURRENCY_BACKOFF, 9).as_millis(), 10_000);
        assert_eq!(schedule_delay(CONCURRENCY_BACKOFF, 40).as_millis(), 10_000);
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::NOT_FOUND));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::GATEWAY_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::OK));
    }
}
