//! Retry logic with exponential backoff and jitter.
//!
//! Any outbound call can be wrapped in [`retry`]: attempt `i` (0-indexed)
//! waits `min(base·2^i, cap) + Uniform(jitter_min, jitter_max)` before the
//! next try. Only Transient errors are retried; Permanent and Critical
//! errors surface immediately. A server-provided `Retry-After` replaces the
//! computed wait when the policy says to respect it.

use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::error::{PipelineError, PipelineResult};
use crate::logging::{log_debug, log_warn};

/// Retry policy for one service.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay for the exponential schedule.
    pub base_delay: Duration,
    /// Cap on the exponential component.
    pub max_delay: Duration,
    /// Uniform jitter bounds added on top of the exponential component.
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    /// Per-attempt timeout.
    pub request_timeout: Duration,
    /// Let a 429's Retry-After override the computed wait.
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::workspace()
    }
}

impl RetryPolicy {
    /// Mail and workspace calls: 3 attempts, 30 s per attempt.
    pub fn workspace() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter_min: Duration::from_millis(0),
            jitter_max: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            respect_retry_after: true,
        }
    }

    pub fn mail() -> Self {
        Self::workspace()
    }

    /// LLM calls tolerate slower responses: 60 s per attempt.
    pub fn llm() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            ..Self::workspace()
        }
    }

    /// Secrets are local-ish and cheap: 2 attempts, 10 s, 5 s cap.
    pub fn secrets() -> Self {
        Self {
            max_attempts: 2,
            max_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            ..Self::workspace()
        }
    }

    /// LLM policy bounded by a provider's configured attempt budget.
    pub fn llm_with(max_retries: u32, timeout: Duration) -> Self {
        Self {
            max_attempts: max_retries.max(1),
            request_timeout: timeout,
            ..Self::llm()
        }
    }

    /// Wait before the next attempt after 0-indexed attempt `i`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(16) as i32);
        let exponential =
            (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        let spread = (self.jitter_max - self.jitter_min).as_secs_f64();
        let jitter = self.jitter_min.as_secs_f64() + fastrand::f64() * spread;
        Duration::from_secs_f64(exponential + jitter)
    }
}

/// Successful result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// How many retries were needed (0 = first attempt succeeded).
    pub retries: u32,
}

/// Run `op` under `policy`, retrying Transient failures.
///
/// Returns the value and the retry count, or the first non-retryable error,
/// or [`PipelineError::RetriesExhausted`] carrying the attempt history.
pub async fn retry<F, Fut, T>(
    service: &str,
    policy: &RetryPolicy,
    op: F,
) -> PipelineResult<RetryOutcome<T>>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = PipelineResult<T>>,
{
    let start = Instant::now();
    let mut history: Vec<String> = Vec::new();
    let mut last_error: Option<PipelineError> = None;

    for attempt in 0..policy.max_attempts {
        let result = tokio::time::timeout(policy.request_timeout, op()).await;
        let error = match result {
            Ok(Ok(value)) => {
                log_debug!(
                    service = %service,
                    attempt = attempt + 1,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Operation succeeded"
                );
                return Ok(RetryOutcome {
                    value,
                    retries: attempt,
                });
            }
            Ok(Err(error)) => error,
            Err(_elapsed) => {
                PipelineError::timeout(service, policy.request_timeout.as_millis() as u64)
            }
        };

        history.push(format!("attempt {}: {}", attempt + 1, error));

        if !error.is_retryable() {
            return Err(error);
        }

        let is_last = attempt + 1 >= policy.max_attempts;
        if is_last {
            last_error = Some(error);
            break;
        }

        let wait = match error.retry_after() {
            Some(seconds) if policy.respect_retry_after => Duration::from_secs(seconds),
            _ => policy.backoff_delay(attempt),
        };
        log_warn!(
            service = %service,
            attempt = attempt + 1,
            max_attempts = policy.max_attempts,
            retry_in_ms = wait.as_millis() as u64,
            error = %error,
            "Transient failure, retrying"
        );
        last_error = Some(error);
        sleep(wait).await;
    }

    let last = last_error
        .unwrap_or_else(|| PipelineError::network(service, "retry loop ran zero attempts", None));
    Err(PipelineError::retries_exhausted(
        service,
        policy.max_attempts,
        history,
        last,
    ))
}
