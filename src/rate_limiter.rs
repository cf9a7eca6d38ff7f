//! Token-bucket rate limiting for inbound ingest and outbound broadcast.

use std::num::NonZeroU32;

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};

use crate::config::RateLimiterConfig;

type Bucket = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

fn bucket(rate_per_sec: u32) -> Bucket {
    let rate = NonZeroU32::new(rate_per_sec.max(1)).unwrap();
    // Burst = 2x the sustained rate, per spec 4.4.
    let burst = NonZeroU32::new(rate.get().saturating_mul(2)).unwrap();
    GovernorLimiter::direct(Quota::per_second(rate).allow_burst(burst))
}

/// Two independent token buckets, one for upstream ingest admission and one
/// for the broadcast-side admission check in `Hub::ingest`.
pub struct RateLimiter {
    inbound_bucket: Bucket,
    broadcast_bucket: Bucket,
}

impl RateLimiter {
    pub fn new(config: &RateLimiterConfig) -> Self {
        Self {
            inbound_bucket: bucket(config.max_inbound_rate),
            broadcast_bucket: bucket(config.max_broadcast_rate),
        }
    }

    /// O(1), lock-free (governor uses an atomic CAS loop internally).
    /// Returns `true` if the request is admitted.
    pub fn try_acquire_inbound(&self) -> bool {
        self.inbound_bucket.check().is_ok()
    }

    pub fn try_acquire_broadcast(&self) -> bool {
        self.broadcast_bucket.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimiterConfig;

    fn config(rate: u32) -> RateLimiterConfig {
        RateLimiterConfig {
            max_inbound_rate: rate,
            max_broadcast_rate: rate,
        }
    }

    #[test]
    fn admits_within_burst_then_rejects() {
        let limiter = RateLimiter::new(&config(1));
        // Burst = 2x rate = 2 tokens available up front.
        assert!(limiter.try_acquire_inbound());
        assert!(limiter.try_acquire_inbound());
        assert!(!limiter.try_acquire_inbound());
    }

    #[test]
    fn refills_after_interval() {
        let limiter = RateLimiter::new(&config(100));
        for _ in 0..200 {
            limiter.try_acquire_inbound();
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(limiter.try_acquire_inbound());
    }

    #[test]
    fn inbound_and_broadcast_buckets_are_independent() {
        let limiter = RateLimiter::new(&config(1));
        assert!(limiter.try_acquire_inbound());
        assert!(limiter.try_acquire_inbound());
        assert!(!limiter.try_acquire_inbound());
        // Broadcast bucket is untouched by inbound exhaustion.
        assert!(limiter.try_acquire_broadcast());
    }
}
