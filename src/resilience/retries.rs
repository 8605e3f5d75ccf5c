//! Retry logic.
//!
//! # Responsibilities
//! - Classify each failure as retryable or final
//! - Execute retries with exponential backoff + full jitter
//! - Consult the circuit breaker before every attempt and report every outcome to it
//!
//! # Design Decisions
//! - Backoff sleeps are deadline-aware; a delay that would overrun the deadline fails fast
//! - Final (non-retryable) failures propagate unchanged as `Downstream`
//! - A breaker that opens mid-sequence short-circuits the remaining attempts
//! - Client errors (validation, 4xx) count as breaker successes; every other failure counts
//!   against the breaker whether or not it is retried
//! - Each outcome is reported with the admission it was made under, so only a half-open probe
//!   can close or reopen the breaker

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::schema::{CircuitPolicy, RetryPolicy};
use crate::guard::types::GuardError;
use crate::observability::events::{self, Event, EventSink, Mechanism};
use crate::resilience::backoff::jittered_backoff;
use crate::resilience::circuit_breaker::{Admission, CircuitBreaker};
use crate::resilience::classify::{CallError, ErrorClass};
use crate::resilience::timeouts::{with_attempt_timeout, Deadline};

/// State of one `execute` call. Never shared or persisted.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Starts at 1.
    pub attempt: u32,
    pub max_attempts: u32,
    pub error_class: Option<ErrorClass>,
    started: Instant,
}

impl RetryContext {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 1,
            max_attempts: max_attempts.max(1),
            error_class: None,
            started: Instant::now(),
        }
    }

    /// Time since the first attempt started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_last(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Re-invokes failing calls according to a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    breaker: CircuitBreaker,
    events: Arc<dyn EventSink>,
}

impl RetryExecutor {
    pub fn new(breaker: CircuitBreaker, events: Arc<dyn EventSink>) -> Self {
        Self { breaker, events }
    }

    /// Run `call` until it succeeds, fails finally, or attempts run out.
    pub async fn execute<T, F, Fut>(
        &self,
        mut call: F,
        policy: &RetryPolicy,
        circuit: Option<&CircuitPolicy>,
        deadline: &Deadline,
    ) -> Result<T, GuardError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut ctx = RetryContext::new(policy.max_attempts);
        let key = circuit.map_or("", |c| c.key.as_str());

        loop {
            let admission = match circuit {
                Some(circuit) => self.breaker.check(circuit).await?,
                None => Admission::Allowed,
            };
            if deadline.is_expired() {
                return Err(GuardError::DeadlineExceeded);
            }

            let attempt_started = Instant::now();
            let result = deadline
                .run(with_attempt_timeout(policy.attempt_timeout(), call()))
                .await
                .map_err(|_| GuardError::DeadlineExceeded)?;

            let err = match result {
                Ok(value) => {
                    if let Some(circuit) = circuit {
                        self.breaker.record(circuit, admission, true).await;
                    }
                    self.emit(events::RETRY_ATTEMPT, key, "success", attempt_started);
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = policy.classifier.classify(&err);
            ctx.error_class = Some(class);
            if let Some(circuit) = circuit {
                self.breaker
                    .record(circuit, admission, err.is_client_error())
                    .await;
            }

            if class == ErrorClass::NonRetryable {
                self.emit(events::RETRY_ATTEMPT, key, "non_retryable", attempt_started);
                return Err(GuardError::Downstream(err));
            }
            self.emit(events::RETRY_ATTEMPT, key, "failure", attempt_started);

            if ctx.is_last() {
                if ctx.attempt == 1 {
                    return Err(GuardError::Downstream(err));
                }
                tracing::warn!(
                    key = %key,
                    attempts = ctx.attempt,
                    elapsed_ms = ctx.elapsed().as_millis() as u64,
                    error = %err,
                    "Retries exhausted"
                );
                self.emit(events::RETRY_EXHAUSTED, key, "exhausted", ctx.started);
                return Err(GuardError::RetryExhausted {
                    last_error: err,
                    attempts: ctx.attempt,
                });
            }

            let delay = jittered_backoff(ctx.attempt, policy.base_delay(), policy.max_delay());
            tracing::debug!(
                key = %key,
                attempt = ctx.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after backoff"
            );
            deadline
                .sleep(delay)
                .await
                .map_err(|_| GuardError::DeadlineExceeded)?;
            ctx.attempt += 1;
        }
    }

    fn emit(&self, name: &'static str, key: &str, outcome: &'static str, started: Instant) {
        self.events.emit(&Event::new(
            name,
            key,
            Mechanism::Retry,
            outcome,
            started.elapsed(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::events::MemorySink;
    use crate::resilience::circuit_breaker::BreakerStatus;
    use crate::resilience::classify::Classifier;
    use crate::store::{ManualClock, MemoryStore, SharedClock};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor() -> (RetryExecutor, Arc<MemorySink>) {
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone(), 0));
        let sink = Arc::new(MemorySink::new());
        let breaker = CircuitBreaker::new(store, clock, sink.clone());
        (RetryExecutor::new(breaker, sink.clone()), sink)
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_makes_three_attempts() {
        let (executor, sink) = executor();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(CallError::Connection("refused".into())) }
                },
                &policy(),
                None,
                &Deadline::none(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            result.unwrap_err(),
            GuardError::RetryExhausted {
                last_error: CallError::Connection("refused".into()),
                attempts: 3
            }
        );
        assert_eq!(sink.count(events::RETRY_ATTEMPT), 3);
        assert_eq!(sink.count(events::RETRY_EXHAUSTED), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_makes_one_attempt() {
        let (executor, _) = executor();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(CallError::Validation("bad id".into())) }
                },
                &policy(),
                None,
                &Deadline::none(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            result.unwrap_err(),
            GuardError::Downstream(CallError::Validation("bad id".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let (executor, _) = executor();
        let calls = AtomicU32::new(0);

        let result = executor
            .execute(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(CallError::Status {
                                code: 503,
                                message: "busy".into(),
                            })
                        } else {
                            Ok(n)
                        }
                    }
                },
                &policy(),
                None,
                &Deadline::none(),
            )
            .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_stays_under_cap() {
        let (executor, _) = executor();
        let start = Instant::now();
        let _: Result<(), _> = executor
            .execute(
                || async { Err(CallError::Timeout) },
                &policy(),
                None,
                &Deadline::none(),
            )
            .await;
        // Jitter ceilings are 100ms then 200ms.
        assert!(start.elapsed() <= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_short_circuits_remaining_attempts() {
        let (executor, _) = executor();
        let circuit = CircuitPolicy::new("svc", 1.0, 2);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(CallError::Timeout) }
                },
                &RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(50)),
                Some(&circuit),
                &Deadline::none(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(result, Err(GuardError::CircuitOpen { .. })));
        let status = executor.breaker.status("svc").await.unwrap().unwrap();
        assert_eq!(status.status, BreakerStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unretried_timeouts_still_open_the_breaker() {
        let (executor, _) = executor();
        let circuit = CircuitPolicy::new("db", 0.5, 2);
        let policy = RetryPolicy::new(1, Duration::from_millis(10), Duration::from_millis(50))
            .with_classifier(Classifier::Never);

        for _ in 0..2 {
            let result: Result<(), _> = executor
                .execute(
                    || async { Err(CallError::Timeout) },
                    &policy,
                    Some(&circuit),
                    &Deadline::none(),
                )
                .await;
            assert_eq!(result.unwrap_err(), GuardError::Downstream(CallError::Timeout));
        }

        let status = executor.breaker.status("db").await.unwrap().unwrap();
        assert_eq!(status.status, BreakerStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_do_not_open_the_breaker() {
        let (executor, _) = executor();
        let circuit = CircuitPolicy::new("db", 0.5, 2);

        for _ in 0..4 {
            let _: Result<(), _> = executor
                .execute(
                    || async {
                        Err(CallError::Status {
                            code: 404,
                            message: "no such order".into(),
                        })
                    },
                    &policy(),
                    Some(&circuit),
                    &Deadline::none(),
                )
                .await;
        }

        let status = executor.breaker.status("db").await.unwrap().unwrap();
        assert_eq!(status.status, BreakerStatus::Closed);
        assert_eq!(status.success_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_backoff() {
        let (executor, _) = executor();
        let policy = RetryPolicy::new(5, Duration::from_secs(10), Duration::from_secs(10))
            .with_classifier(Classifier::Always);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(CallError::Other("flaky".into())) }
                },
                &policy,
                None,
                &Deadline::after(Duration::from_millis(1)),
            )
            .await;

        // A jittered delay below 1ms is possible, so at most one retry happens.
        assert!(calls.load(Ordering::SeqCst) <= 2);
        assert_eq!(result.unwrap_err(), GuardError::DeadlineExceeded);
    }
}
