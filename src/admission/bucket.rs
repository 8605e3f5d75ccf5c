//! Token bucket state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Admission decision for one `admit` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Zero when allowed.
    pub retry_after: Duration,
    /// Whole tokens left after this decision.
    pub remaining: u32,
}

/// A token bucket with lazy refill, stored per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub tokens: f64,
    pub capacity: u32,
    pub refill_rate: f64,
    /// Milliseconds since the epoch.
    pub last_refill: u64,
}

impl TokenBucket {
    /// A full bucket.
    pub fn full(capacity: u32, refill_rate: f64, now: u64) -> Self {
        Self {
            tokens: f64::from(capacity),
            capacity,
            refill_rate,
            last_refill: now,
        }
    }

    /// Adopt a changed policy without granting free tokens.
    pub fn reconfigure(&mut self, capacity: u32, refill_rate: f64) {
        self.capacity = capacity;
        self.refill_rate = refill_rate;
        self.tokens = self.tokens.clamp(0.0, f64::from(capacity));
    }

    /// Add tokens for the time elapsed since the last refill.
    pub fn refill(&mut self, now: u64) {
        // Clock stepped backwards: keep the level, move the mark.
        let elapsed_ms = now.saturating_sub(self.last_refill);
        #[allow(clippy::cast_precision_loss)]
        let added = elapsed_ms as f64 / 1000.0 * self.refill_rate;
        self.tokens = (self.tokens + added).min(f64::from(self.capacity)).max(0.0);
        self.last_refill = self.last_refill.max(now);
    }

    /// Refill, then try to deduct `cost`.
    pub fn try_acquire(&mut self, cost: u32, now: u64) -> Decision {
        self.refill(now);
        let cost = f64::from(cost);
        if self.tokens >= cost {
            self.tokens -= cost;
            Decision {
                allowed: true,
                retry_after: Duration::ZERO,
                remaining: self.remaining(),
            }
        } else {
            let missing = cost - self.tokens;
            let retry_after = if self.refill_rate > 0.0 {
                Duration::try_from_secs_f64(missing / self.refill_rate).unwrap_or(Duration::MAX)
            } else {
                Duration::MAX
            };
            Decision {
                allowed: false,
                retry_after,
                remaining: self.remaining(),
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn remaining(&self) -> u32 {
        self.tokens.floor().max(0.0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_capacity_then_denies() {
        let mut bucket = TokenBucket::full(5, 1.0, 0);
        for i in 0..5 {
            let d = bucket.try_acquire(1, 0);
            assert!(d.allowed, "call {i} should be admitted");
            assert_eq!(d.remaining, 4 - i);
        }
        let denied = bucket.try_acquire(1, 0);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(1));

        assert!(!bucket.try_acquire(1, 999).allowed);
        assert!(bucket.try_acquire(1, 2000).allowed);
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let mut bucket = TokenBucket::full(3, 2.5, 0);
        let mut now = 0;
        for step in 0..500u64 {
            now += (step * 37) % 700;
            let cost = u32::try_from(step % 4).unwrap();
            bucket.try_acquire(cost, now);
            assert!(bucket.tokens >= 0.0);
            assert!(bucket.tokens <= 3.0);
        }
    }

    #[test]
    fn test_tiny_refill_rate_saturates_retry_after() {
        let mut bucket = TokenBucket::full(1, 1e-20, 0);
        assert!(bucket.try_acquire(1, 0).allowed);
        let denied = bucket.try_acquire(1, 0);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::MAX);
    }

    #[test]
    fn test_reconfigure_clamps() {
        let mut bucket = TokenBucket::full(10, 1.0, 0);
        bucket.reconfigure(4, 1.0);
        assert_eq!(bucket.tokens, 4.0);
    }

    #[test]
    fn test_backwards_clock_does_not_refill() {
        let mut bucket = TokenBucket::full(2, 1.0, 10_000);
        assert!(bucket.try_acquire(2, 10_000).allowed);
        assert!(!bucket.try_acquire(1, 5_000).allowed);
        assert_eq!(bucket.last_refill, 10_000);
    }
}
