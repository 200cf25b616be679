//! Retry policy: exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::domain::RelayError;

/// Upper bound for a single backoff delay, jitter included.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    pub multiplier: f64,

    /// Total attempts, the first one included.
    pub max_attempts: u32,

    /// Random spread applied to each delay, as a fraction (0.0 = none).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_attempts: 3,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_attempts: u32) -> Self {
        Self {
            base_delay,
            multiplier,
            max_attempts: max_attempts.max(1),
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self::new(Duration::ZERO, 1.0, 1)
    }

    /// `base_delay * multiplier^(attempts - 1)`, capped at [`MAX_RETRY_DELAY`];
    /// `attempts` is 1-indexed.
    ///
    /// base 500ms, multiplier 2.0:
    /// - attempt 1: 500ms
    /// - attempt 2: 1s
    /// - attempt 3: 2s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = capped(base_secs * self.multiplier.powi(exponent));
        if self.jitter > 0.0 {
            let spread = 1.0 + self.jitter * (rand::random::<f64>() * 2.0 - 1.0);
            capped(delay.as_secs_f64() * spread)
        } else {
            delay
        }
    }
}

/// Overflow and infinity land on the cap; negatives and NaN (0 * inf) become zero.
fn capped(secs: f64) -> Duration {
    if secs.is_nan() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs.max(0.0))
        .unwrap_or(MAX_RETRY_DELAY)
        .min(MAX_RETRY_DELAY)
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// `op` receives the 1-indexed attempt number. Only transient errors are
/// retried; the last error is returned as-is.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, RelayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.next_delay(attempt);
                warn!(
                    operation = what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
