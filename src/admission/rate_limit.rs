//! Per-key token bucket rate limiting over the shared key store.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::admission::bucket::{Decision, TokenBucket};
use crate::config::schema::RateLimitPolicy;
use crate::guard::types::GuardError;
use crate::observability::events::{self, Event, EventSink, Mechanism};
use crate::resilience::timeouts::Deadline;
use crate::store::{decode, encode, KeyStore, Mutation, SharedClock};

/// Extra lifetime on stored buckets beyond the full-refill time.
const STATE_TTL_SLACK: Duration = Duration::from_secs(1);

/// Buckets that take longer than this to refill are stored without expiry.
const MAX_STATE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

fn state_ttl(policy: &RateLimitPolicy) -> Option<Duration> {
    let ttl = policy.full_refill().saturating_add(STATE_TTL_SLACK);
    (ttl <= MAX_STATE_TTL).then_some(ttl)
}

fn state_key(key: &str) -> String {
    format!("rl:{key}")
}

/// Read-only view of one bucket, refilled to the current instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub key: String,
    pub tokens: f64,
    pub capacity: u32,
    pub refill_rate: f64,
    pub last_refill: u64,
}

/// Token bucket admission control.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyStore>,
    clock: SharedClock,
    events: Arc<dyn EventSink>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyStore>, clock: SharedClock, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            clock,
            events,
        }
    }

    /// Try to deduct the policy's cost from its bucket.
    pub async fn admit(&self, policy: &RateLimitPolicy) -> Result<Decision, GuardError> {
        self.admit_cost(policy, policy.cost).await
    }

    /// Try to deduct `cost` tokens from the policy's bucket.
    ///
    /// The refill and deduction run as one read-modify-write on the key, so
    /// concurrent admitters for the same key never overdraw it.
    pub async fn admit_cost(
        &self,
        policy: &RateLimitPolicy,
        cost: u32,
    ) -> Result<Decision, GuardError> {
        let started = Instant::now();
        let now = self.clock.now_millis();
        let ttl = state_ttl(policy);
        let mut decision = None;

        let result = self
            .store
            .update(&state_key(&policy.key), &mut |current| {
                let stored = current.and_then(|bytes| match decode::<TokenBucket>(bytes) {
                    Ok(bucket) => Some(bucket),
                    Err(e) => {
                        tracing::warn!(key = %policy.key, error = %e, "Corrupt rate limit state, refilling bucket");
                        None
                    }
                });
                let mut bucket = stored
                    .unwrap_or_else(|| TokenBucket::full(policy.capacity, policy.refill_rate, now));
                bucket.reconfigure(policy.capacity, policy.refill_rate);
                let d = bucket.try_acquire(cost, now);
                decision = Some(d);
                if !d.allowed {
                    return Mutation::Keep;
                }
                match encode(&bucket) {
                    Ok(value) => Mutation::Put {
                        value,
                        ttl,
                    },
                    Err(_) => Mutation::Keep,
                }
            })
            .await;

        if let Err(e) = result {
            tracing::warn!(
                key = %policy.key,
                error = %e,
                fail_open = policy.fail_open,
                "Rate limit backend unavailable"
            );
            return if policy.fail_open {
                self.emit(events::RATE_LIMIT_ADMITTED, &policy.key, "fail_open", started);
                Ok(Decision {
                    allowed: true,
                    retry_after: Duration::ZERO,
                    remaining: 0,
                })
            } else {
                self.emit(events::RATE_LIMIT_DENIED, &policy.key, "backend_unavailable", started);
                Err(GuardError::from(e))
            };
        }

        let decision = decision.ok_or_else(|| {
            GuardError::BackendUnavailable(format!("no decision recorded for {}", policy.key))
        })?;
        if decision.allowed {
            self.emit(events::RATE_LIMIT_ADMITTED, &policy.key, "admitted", started);
        } else {
            self.emit(events::RATE_LIMIT_DENIED, &policy.key, "denied", started);
        }
        Ok(decision)
    }

    /// Admit or fail with `RateLimitExceeded`.
    pub async fn check(&self, policy: &RateLimitPolicy) -> Result<Decision, GuardError> {
        let decision = self.admit(policy).await?;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(GuardError::RateLimitExceeded {
                key: policy.key.clone(),
                retry_after: decision.retry_after,
            })
        }
    }

    /// Admit, sleeping out denials when the policy asks to wait.
    ///
    /// A wait that cannot finish before `deadline` fails immediately with
    /// `DeadlineExceeded`.
    pub async fn admit_or_wait(
        &self,
        policy: &RateLimitPolicy,
        deadline: &Deadline,
    ) -> Result<Decision, GuardError> {
        loop {
            let decision = self.admit(policy).await?;
            if decision.allowed {
                return Ok(decision);
            }
            if !policy.wait || decision.retry_after == Duration::MAX {
                return Err(GuardError::RateLimitExceeded {
                    key: policy.key.clone(),
                    retry_after: decision.retry_after,
                });
            }
            tracing::debug!(
                key = %policy.key,
                wait_ms = decision.retry_after.as_millis() as u64,
                "Waiting for rate limit tokens"
            );
            deadline
                .sleep(decision.retry_after)
                .await
                .map_err(|_| GuardError::DeadlineExceeded)?;
        }
    }

    /// Check every bucket in series. The first denial wins.
    pub async fn admit_all(
        &self,
        policies: &[RateLimitPolicy],
        deadline: &Deadline,
    ) -> Result<(), GuardError> {
        for policy in policies {
            self.admit_or_wait(policy, deadline).await?;
        }
        Ok(())
    }

    /// Current bucket state, or `None` if the key has no live state.
    pub async fn status(&self, key: &str) -> Result<Option<RateLimitStatus>, GuardError> {
        let Some(stored) = self.store.get(&state_key(key)).await? else {
            return Ok(None);
        };
        let mut bucket: TokenBucket = decode(&stored.value)?;
        bucket.refill(self.clock.now_millis());
        Ok(Some(RateLimitStatus {
            key: key.to_string(),
            tokens: bucket.tokens,
            capacity: bucket.capacity,
            refill_rate: bucket.refill_rate,
            last_refill: bucket.last_refill,
        }))
    }

    fn emit(&self, name: &'static str, key: &str, outcome: &'static str, started: Instant) {
        self.events.emit(&Event::new(
            name,
            key,
            Mechanism::RateLimit,
            outcome,
            started.elapsed(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::events::MemorySink;
    use crate::store::{ManualClock, MemoryStore, StoreError, StoreResult, Versioned};
    use async_trait::async_trait;

    fn limiter(clock: &ManualClock) -> (RateLimiter, Arc<MemorySink>) {
        let clock: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new(clock.clone(), 0));
        let sink = Arc::new(MemorySink::new());
        (RateLimiter::new(store, clock, sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_capacity_five_refill_one_per_second() {
        let clock = ManualClock::new(1_000_000);
        let (limiter, sink) = limiter(&clock);
        let policy = RateLimitPolicy::new("user:42", 5, 1.0);

        for _ in 0..5 {
            assert!(limiter.admit(&policy).await.unwrap().allowed);
        }
        let denied = limiter.admit(&policy).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(1));

        clock.advance(Duration::from_secs(1));
        assert!(limiter.admit(&policy).await.unwrap().allowed);

        assert_eq!(sink.count(events::RATE_LIMIT_ADMITTED), 6);
        assert_eq!(sink.count(events::RATE_LIMIT_DENIED), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let clock = ManualClock::new(0);
        let (limiter, _) = limiter(&clock);
        let a = RateLimitPolicy::new("ip:a", 1, 1.0);
        let b = RateLimitPolicy::new("ip:b", 1, 1.0);

        assert!(limiter.check(&a).await.is_ok());
        assert!(matches!(
            limiter.check(&a).await,
            Err(GuardError::RateLimitExceeded { .. })
        ));
        assert!(limiter.check(&b).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_admits_never_overdraw() {
        let clock = ManualClock::new(0);
        let (limiter, _) = limiter(&clock);
        let policy = RateLimitPolicy::new("org:acme", 10, 0.001);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            let policy = policy.clone();
            handles.push(tokio::spawn(async move {
                limiter.admit(&policy).await.unwrap().allowed
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);

        let status = limiter.status("org:acme").await.unwrap().unwrap();
        assert!(status.tokens >= 0.0 && status.tokens < 1.0);
        assert_eq!(status.capacity, 10);
    }

    #[tokio::test]
    async fn test_first_denial_wins() {
        let clock = ManualClock::new(0);
        let (limiter, _) = limiter(&clock);
        let wide = RateLimitPolicy::new("org:acme", 100, 10.0);
        let narrow = RateLimitPolicy::new("ip:1", 1, 1.0);
        let chain = [wide, narrow];

        assert!(limiter.admit_all(&chain, &Deadline::none()).await.is_ok());
        let err = limiter.admit_all(&chain, &Deadline::none()).await.unwrap_err();
        match err {
            GuardError::RateLimitExceeded { key, .. } => assert_eq!(key, "ip:1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_gives_up_before_deadline() {
        let clock = ManualClock::new(0);
        let (limiter, _) = limiter(&clock);
        let mut policy = RateLimitPolicy::new("endpoint:/slow", 1, 0.5);
        policy.wait = true;

        limiter.check(&policy).await.unwrap();
        let deadline = Deadline::after(Duration::from_millis(500));
        let err = limiter.admit_or_wait(&policy, &deadline).await.unwrap_err();
        assert_eq!(err, GuardError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_near_zero_refill_rate_denies_without_panicking() {
        let clock = ManualClock::new(0);
        let (limiter, _) = limiter(&clock);
        let policy = RateLimitPolicy::new("ip:1", 5, 1e-20);
        assert_eq!(state_ttl(&policy), None);

        for _ in 0..5 {
            assert!(limiter.admit(&policy).await.unwrap().allowed);
        }
        let denied = limiter.admit(&policy).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::MAX);
        assert!(limiter.status("ip:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_state_starts_a_full_bucket() {
        let clock = ManualClock::new(0);
        let shared: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new(shared.clone(), 0));
        let limiter = RateLimiter::new(store.clone(), shared, Arc::new(MemorySink::new()));
        let policy = RateLimitPolicy::new("ip:1", 2, 1.0);

        store.set("rl:ip:1", b"{\"tokens\":".to_vec(), None).await.unwrap();
        let decision = limiter.admit(&policy).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[derive(Debug)]
    struct DownStore;

    #[async_trait]
    impl KeyStore for DownStore {
        async fn get(&self, _: &str) -> StoreResult<Option<Versioned>> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _: &str, _: Vec<u8>, _: Option<Duration>) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn compare_and_swap(
            &self,
            _: &str,
            _: Option<u64>,
            _: Vec<u8>,
            _: Option<Duration>,
        ) -> StoreResult<bool> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _: &str) -> StoreResult<bool> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_backend_failure_mode_follows_policy() {
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::new(Arc::new(DownStore), clock, Arc::new(MemorySink::new()));

        let closed = RateLimitPolicy::new("ip:1", 5, 1.0);
        assert!(matches!(
            limiter.admit(&closed).await,
            Err(GuardError::BackendUnavailable(_))
        ));

        let mut open = closed.clone();
        open.fail_open = true;
        assert!(limiter.admit(&open).await.unwrap().allowed);
    }
}
