//! Per-user request rate limiting.
//!
//! A token bucket per chat user, refilled continuously at the configured
//! requests-per-minute. Users with a stored override use their own limit.

use dashmap::DashMap;
use std::time::Instant;

use crate::domain::ChatUserId;

struct Bucket {
    tokens: f64,
    limit: u32,
    last_refill: Instant,
}

/// Token-bucket limiter keyed by chat user.
pub struct RateLimiter {
    default_per_minute: u32,
    buckets: DashMap<ChatUserId, Bucket>,
}

impl RateLimiter {
    /// Creates a limiter with a default per-minute budget.
    #[must_use]
    pub fn new(default_per_minute: u32) -> Self {
        Self {
            default_per_minute: default_per_minute.max(1),
            buckets: DashMap::new(),
        }
    }

    /// Attempts to spend one request. Returns false when the user is over
    /// budget.
    pub fn check(&self, user: &ChatUserId, override_per_minute: Option<u32>) -> bool {
        self.check_at(user, override_per_minute, Instant::now())
    }

    fn check_at(&self, user: &ChatUserId, override_per_minute: Option<u32>, now: Instant) -> bool {
        let limit = override_per_minute.unwrap_or(self.default_per_minute).max(1);
        let mut bucket = self.buckets.entry(user.clone()).or_insert_with(|| Bucket {
            tokens: f64::from(limit),
            limit,
            last_refill: now,
        });

        // A changed override takes effect on the next check.
        if bucket.limit != limit {
            bucket.limit = limit;
            bucket.tokens = bucket.tokens.min(f64::from(limit));
        }

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let refill = elapsed * f64::from(bucket.limit) / 60.0;
        bucket.tokens = (bucket.tokens + refill).min(f64::from(bucket.limit));
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn user(id: &str) -> ChatUserId {
        ChatUserId::try_new(id.to_string()).unwrap()
    }

    #[test]
    fn budget_exhausts_and_refills() {
        let limiter = RateLimiter::new(3);
        let u = user("U1");
        let start = Instant::now();

        assert!(limiter.check_at(&u, None, start));
        assert!(limiter.check_at(&u, None, start));
        assert!(limiter.check_at(&u, None, start));
        assert!(!limiter.check_at(&u, None, start));

        // Twenty seconds refills one token at 3/min.
        let later = start + Duration::from_secs(21);
        assert!(limiter.check_at(&u, None, later));
        assert!(!limiter.check_at(&u, None, later));
    }

    #[test]
    fn per_user_override_wins() {
        let limiter = RateLimiter::new(1);
        let privileged = user("U-admin");
        let start = Instant::now();

        for _ in 0..10 {
            assert!(limiter.check_at(&privileged, Some(60), start));
        }

        let plain = user("U-plain");
        assert!(limiter.check_at(&plain, None, start));
        assert!(!limiter.check_at(&plain, None, start));
    }
}
