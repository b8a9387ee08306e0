// Retry-with-backoff for network operations.
//
// Strategies implement `Backoff`; the default is exponential backoff with
// jitter and a max-delay cap. Retry eligibility is driven by the error
// classification in `NetworkError::is_retryable`.

use crate::error::{EngineError, NetworkError, OrchestratorError};
use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A retry strategy: how many attempts, whether a given failure is worth
/// another one, and how long to wait before it.
pub trait Backoff: Send + Sync {
    /// Total attempts, the initial one included.
    fn max_attempts(&self) -> u32;

    /// Delay before the retry following attempt `attempt` (0-indexed).
    fn delay_before_retry(&self, attempt: u32) -> Duration;

    fn should_retry(&self, error: &NetworkError, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts() && error.is_retryable()
    }
}

/// Exponential backoff: `delay = min(base * 2^attempt + jitter, cap)`,
/// jitter uniform in `[-jitter_factor * delay, +jitter_factor * delay]`,
/// clamped to non-negative.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub cap: Duration,
    pub attempts: u32,
    pub jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            attempts: 3,
            jitter_factor: 0.1,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn max_attempts(&self) -> u32 {
        self.attempts
    }

    fn delay_before_retry(&self, attempt: u32) -> Duration {
        // 2^attempt with a checked shift so misconfigured attempts saturate.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp = self
            .base
            .checked_mul(multiplier)
            .unwrap_or(self.cap)
            .as_secs_f64();

        let jitter = if self.jitter_factor > 0.0 {
            rand::rng().random_range(-1.0..=1.0) * self.jitter_factor * exp
        } else {
            0.0
        };

        let secs = (exp + jitter).max(0.0).min(self.cap.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Linear backoff: `delay = base * (attempt + 1)`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    pub base: Duration,
    pub attempts: u32,
}

impl Backoff for LinearBackoff {
    fn max_attempts(&self) -> u32 {
        self.attempts
    }

    fn delay_before_retry(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt + 1)
    }
}

/// Fixed delay between attempts.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    pub delay: Duration,
    pub attempts: u32,
}

impl Backoff for FixedDelay {
    fn max_attempts(&self) -> u32 {
        self.attempts
    }

    fn delay_before_retry(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Single attempt, no retries.
#[derive(Debug, Clone, Default)]
pub struct NoRetry;

impl Backoff for NoRetry {
    fn max_attempts(&self) -> u32 {
        1
    }

    fn delay_before_retry(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Execute an async operation under a retry strategy.
///
/// The closure receives the current attempt number (0-indexed). Only
/// `EngineError::Network` failures consult the strategy; every other kind
/// fails immediately. Cancellation is checked before each attempt and
/// during backoff sleeps.
pub async fn retry_with_backoff<F, Fut, T>(
    strategy: &dyn Backoff,
    token: &CancellationToken,
    operation: F,
) -> Result<T, EngineError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(OrchestratorError::Cancelled.into());
        }

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retry = match &err {
                    EngineError::Network(net) => strategy.should_retry(net, attempt),
                    _ => false,
                };
                if !retry {
                    return Err(err);
                }
                let delay = strategy.delay_before_retry(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = strategy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(OrchestratorError::Cancelled.into());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
