//! Bounded retry with exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ProviderError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `op` under `policy.timeout`, mapping an elapsed timer to `ProviderError::Timeout`.
pub async fn with_timeout<T, Fut>(policy: &RetryPolicy, label: &str, fut: Fut) -> Result<T, ProviderError>
where
    Fut: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(policy.timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(format!(
            "{label} did not complete within {}s",
            policy.timeout.as_secs()
        ))),
    }
}

/// Retry `op` until it succeeds or the attempt budget is spent.
///
/// `op` receives the 1-based attempt number. `NotFound` is returned
/// immediately since retrying cannot change it.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max = policy.max_attempts();
    let mut attempt = 1;
    loop {
        match with_timeout(policy, label, op(attempt)).await {
            Ok(value) => return Ok(value),
            Err(err @ ProviderError::NotFound(_)) => return Err(err),
            Err(err) if attempt >= max => {
                warn!(operation = label, attempt, "retry budget exhausted: {err}");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.backoff(attempt);
                warn!(
                    operation = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "provider call failed, retrying: {err}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
