//! Retry with backoff for single remote calls.
//!
//! Used for one-shot operations such as the collector status probe. The sync
//! dispatcher does not retry batches; a failed cycle is simply rerun on the
//! next trigger.
//!
//! ```rust,ignore
//! let status = with_retry(&RetryPolicy::bounded(3, Duration::from_secs(1)), || async move {
//!     transport.probe(&url, &headers).await
//! })
//! .await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::duration_ms;

/// How often and how patiently to retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. `None` retries forever and is
    /// only meant for idempotent setup calls.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry; no retry waits less than this.
    #[serde(rename = "min_delay_ms", with = "duration_ms")]
    pub min_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Extra random delay as a fraction of the computed one (0.1 = up to +10%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// At most `attempts` tries, waiting at least `min_delay` between them.
    pub fn bounded(attempts: u32, min_delay: Duration) -> Self {
        Self {
            max_attempts: Some(attempts.max(1)),
            min_delay,
            max_delay: Duration::from_secs(30).max(min_delay),
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }

    /// Retry until success.
    pub fn forever(min_delay: Duration) -> Self {
        Self {
            max_attempts: None,
            ..Self::bounded(1, min_delay)
        }
    }

    /// Single attempt.
    pub fn no_retry() -> Self {
        Self::bounded(1, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the `retry`-th failure (0-indexed), before jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(retry.min(31) as i32);
        let min_ns = self.min_delay.as_nanos() as f64;
        let max_ns = (self.max_delay.as_nanos() as f64).max(min_ns);
        Duration::from_nanos((min_ns * factor).min(max_ns).round() as u64)
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        base.mul_f64(1.0 + fastrand::f64() * jitter)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// A failed attempt.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// 1-based number of the attempt that failed.
    pub attempt: u32,
    /// Wait before the next attempt; zero when `last` is set.
    pub delay: Duration,
    /// No further attempt follows; `error` is what the caller gets back.
    pub last: bool,
    pub error: &'a E,
}

/// Run `operation` under `policy`, logging each retry.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_observed(policy, operation, |retry: &RetryAttempt<'_, E>| {
        if retry.last {
            return;
        }
        warn!(
            attempt = retry.attempt,
            delay_ms = retry.delay.as_millis() as u64,
            error = %retry.error,
            "attempt failed, retrying"
        );
    })
    .await
}

/// Run `operation` under `policy`, calling `observer` after every failed
/// attempt, including the final one.
///
/// Returns the first success or the last error once attempts run out.
pub async fn with_retry_observed<T, E, F, Fut, O>(
    policy: &RetryPolicy,
    mut operation: F,
    mut observer: O,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    O: FnMut(&RetryAttempt<'_, E>),
{
    let mut attempts = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempts > 0 {
                    debug!(attempts = attempts + 1, "succeeded after retries");
                }
                return Ok(value);
            }
            Err(error) => {
                attempts = attempts.saturating_add(1);
                if policy.exhausted(attempts) {
                    observer(&RetryAttempt {
                        attempt: attempts,
                        delay: Duration::ZERO,
                        last: true,
                        error: &error,
                    });
                    warn!(attempts, error = %error, "giving up after retries");
                    return Err(error);
                }

                let delay = policy.delay_for(attempts - 1);
                observer(&RetryAttempt {
                    attempt: attempts,
                    delay,
                    last: false,
                    error: &error,
                });
                tokio::time::sleep(delay).await;
            }
        }
    }
}
