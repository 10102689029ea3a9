//! Per-user token-bucket rate limiting for the call endpoint.

use std::time::Instant;

use dashmap::DashMap;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// `limit_per_minute` calls per user, burstable up to the full limit.
pub struct RateLimiter {
    limit_per_minute: u32,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            buckets: DashMap::new(),
        }
    }

    /// Takes one token for the user; false means rate limited.
    pub fn try_acquire(&self, user: &str) -> bool {
        if self.limit_per_minute == 0 {
            return true; // limiting disabled
        }
        let capacity = self.limit_per_minute as f64;
        let refill_per_second = capacity / 60.0;
        let mut bucket = self.buckets.entry(user.to_string()).or_insert_with(|| Bucket {
            tokens: capacity,
            last_refill: Instant::now(),
        });
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_second).min(capacity);
        bucket.last_refill = Instant::now();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
