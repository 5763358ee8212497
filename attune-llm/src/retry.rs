//! Bounded retries with explicit per-call timeouts.
//!
//! Two distinct waits:
//! - transient errors (network, 5xx, malformed response, timeout) retry up
//!   to `max_attempts` with a short fixed delay;
//! - rate-limit errors wait a long fixed cooldown. A cooldown does not
//!   consume an attempt, but each one draws on a separate, bounded budget
//!   of rate-limit waits so a persistently throttled call still ends.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{LlmError, Result};

/// Retry and timeout policy for one class of provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up (at least 1).
    pub max_attempts: u32,
    /// Delay between transient-error attempts.
    pub retry_delay: Duration,
    /// Wait after a rate-limit signal.
    pub rate_limit_cooldown: Duration,
    /// Rate-limit cooldowns allowed per call.
    pub max_rate_limit_waits: u32,
    /// Bound on each individual attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            rate_limit_cooldown: Duration::from_secs(60),
            max_rate_limit_waits: 1,
            call_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// A single attempt with no waits, bounded by `call_timeout`.
    #[must_use]
    pub fn no_retry(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            retry_delay: Duration::ZERO,
            rate_limit_cooldown: Duration::ZERO,
            max_rate_limit_waits: 0,
            call_timeout,
        }
    }
}

/// Run `call` under `policy`.
///
/// Permanent errors (credential, configuration, schema) return as-is on
/// the first failure. A transient or rate-limit failure that outlives its
/// budget returns `LlmError::RetriesExhausted` boxing the last cause.
///
/// # Errors
/// See above.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;
    let mut rate_limit_waits: u32 = 0;

    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(millis(policy.call_timeout))),
        };

        let err = match outcome {
            Ok(value) => {
                if attempt > 1 || rate_limit_waits > 0 {
                    debug!(operation, attempt, rate_limit_waits, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        match err {
            LlmError::RateLimited { .. } if rate_limit_waits < policy.max_rate_limit_waits => {
                rate_limit_waits += 1;
                attempt -= 1;
                warn!(
                    operation,
                    cooldown_secs = policy.rate_limit_cooldown.as_secs(),
                    rate_limit_waits,
                    "rate limited, cooling down"
                );
                tokio::time::sleep(policy.rate_limit_cooldown).await;
            }
            e if e.is_retryable() && attempt < max_attempts => {
                warn!(operation, attempt, max_attempts, error = %e, "transient failure, retrying");
                tokio::time::sleep(policy.retry_delay).await;
            }
            e if e.is_retryable() || matches!(e, LlmError::RateLimited { .. }) => {
                warn!(operation, attempts = attempt, error = %e, "giving up");
                return Err(LlmError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(e),
                });
            }
            e => return Err(e),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}
