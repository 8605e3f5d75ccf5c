//! Exponential backoff with full jitter.

use std::time::Duration;
use rand::Rng;

/// Upper bound of the backoff delay before `attempt + 1`.
///
/// `min(max, base * 2^(attempt-1))`; attempt 0 yields zero.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponential_base = 2u32.saturating_pow(attempt - 1);
    base.saturating_mul(exponential_base).min(max)
}

/// Uniformly random delay in `[0, ceiling]`.
pub fn full_jitter(ceiling: Duration) -> Duration {
    let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
    if ceiling_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
}

/// Jittered delay to sleep after a failed `attempt`.
pub fn jittered_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    full_jitter(calculate_backoff(attempt, base, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(2000);
        assert_eq!(calculate_backoff(1, base, max), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, base, max), Duration::from_millis(200));
        assert_eq!(calculate_backoff(3, base, max), Duration::from_millis(400));
        assert_eq!(calculate_backoff(10, base, max), max);
        assert_eq!(calculate_backoff(64, base, max), max);
    }

    #[test]
    fn test_jitter_within_bounds() {
        let ceiling = Duration::from_millis(250);
        for _ in 0..200 {
            assert!(full_jitter(ceiling) <= ceiling);
        }
        assert_eq!(full_jitter(Duration::ZERO), Duration::ZERO);
    }
}
