use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::fmt;
use std::num::NonZeroU32;

/// Optional global pacing gate shared by all workers.
///
/// Burst is pinned to one token, so requests are spread evenly at the
/// configured rate instead of arriving in bursts.
pub struct RateGate {
    limiter: Option<DefaultDirectRateLimiter>,
}

impl RateGate {
    /// `per_second == 0` disables pacing.
    pub fn new(per_second: u32) -> Self {
        let limiter = NonZeroU32::new(per_second)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate).allow_burst(NonZeroU32::MIN)));
        Self { limiter }
    }

    pub fn unlimited() -> Self {
        Self { limiter: None }
    }

    pub fn is_limited(&self) -> bool {
        self.limiter.is_some()
    }

    /// Suspend the calling task until a token is available.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}

impl fmt::Debug for RateGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateGate")
            .field("limited", &self.is_limited())
            .finish()
    }
}
