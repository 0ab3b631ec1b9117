//! Per-candidate retry with backoff, and failure bookkeeping for failover.
//!
//! A candidate gets one attempt plus up to `max_retries` retries, but only
//! for errors that may succeed on a second try against the same upstream
//! (5xx and transport failures). Timeouts and upstream rate limits move on
//! to the next candidate immediately.

use std::future::Future;
use std::time::Duration;

use crate::provider::ProviderError;

/// Fixed exponential backoff: 1s, 2s, 4s.
///
/// Retries beyond the third reuse the last slot.
pub(crate) const BACKOFF_DURATIONS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Whether an HTTP status code should trigger a retry.
///
/// Returns `true` for 500, 502, 503, 504 (server errors that are typically transient).
/// Returns `false` for all other codes including 4xx (permanent client errors).
pub fn is_retryable(status_code: u16) -> bool {
    matches!(status_code, 500 | 502 | 503 | 504)
}

/// Delay before retry number `retry` (1-based).
pub(crate) fn backoff_for(retry: u32) -> Duration {
    let index = (retry.saturating_sub(1) as usize).min(BACKOFF_DURATIONS.len() - 1);
    BACKOFF_DURATIONS[index]
}

/// Why one candidate was given up on.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub provider: String,
    /// Calls made to this provider, including retries.
    pub attempts: u32,
    /// The last error returned.
    pub error: ProviderError,
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.provider, self.error.kind(), self.error)?;
        if self.attempts > 1 {
            write!(f, " after {} attempts", self.attempts)?;
        }
        Ok(())
    }
}

/// Format every candidate failure on one line, in the order tried.
///
/// Format: `"alpha: timeout (timed out after 30000ms); beta: upstream (...)"`.
pub fn format_attempts(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return "no candidates were tried".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Call `send` until it succeeds, returns a non-retryable error, or
/// `max_retries` retries are used up.
///
/// Returns the final result and the number of calls made.
pub async fn call_with_retries<T, F, Fut>(
    provider_name: &str,
    max_retries: u32,
    mut send: F,
) -> (Result<T, ProviderError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut calls = 0;
    loop {
        calls += 1;
        match send().await {
            Ok(value) => return (Ok(value), calls),
            Err(err) => {
                let retries_used = calls - 1;
                if !err.is_retryable() || retries_used >= max_retries {
                    return (Err(err), calls);
                }

                let delay = backoff_for(calls);
                tracing::debug!(
                    provider = %provider_name,
                    attempt = calls,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "retryable provider error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
