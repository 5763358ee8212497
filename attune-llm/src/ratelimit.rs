//! Token-bucket pacing for batch jobs.
//!
//! Consolidation scans and embedding backfills issue many provider calls
//! back to back. Each call first takes a token from a [`RateLimitBudget`]
//! (GCRA, via `governor`), so the job stays under a requests-per-minute
//! budget without sleep constants.

use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Requests-per-minute budget with a burst allowance.
pub struct RateLimitBudget {
    limiter: DefaultDirectRateLimiter,
    per_minute: NonZeroU32,
    burst: NonZeroU32,
}

impl std::fmt::Debug for RateLimitBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitBudget")
            .field("per_minute", &self.per_minute)
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}

impl RateLimitBudget {
    /// Budget of `per_minute` requests with up to `burst` at once.
    /// Zero values are raised to 1.
    #[must_use]
    pub fn per_minute(per_minute: u32, burst: u32) -> Self {
        let per_minute = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_minute(per_minute).allow_burst(burst)),
            per_minute,
            burst,
        }
    }

    /// Wait until a request may be sent.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a token if one is available right now.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Configured requests per minute.
    #[must_use]
    pub fn requests_per_minute(&self) -> u32 {
        self.per_minute.get()
    }
}
