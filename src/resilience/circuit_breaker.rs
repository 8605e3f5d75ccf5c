//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through and outcomes are counted
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: a single probe call tests whether the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure ratio >= threshold with at least minimum_samples in the window
//! Open → Half-Open: after open_duration since opened_at
//! Half-Open → Closed: probe succeeds
//! Half-Open → Open: probe fails (opened_at reset)
//! ```
//!
//! # Design Decisions
//! - Per-key breaker state lives in the key store under `cb:<key>`
//! - Every transition is one read-modify-write, so two callers never both move the same key
//! - Single probe in Half-Open; a probe that never reports is abandoned after open_duration
//! - Only the probe's outcome moves a half-open breaker; stragglers admitted earlier are ignored
//! - Closed breakers are read without writing on the admission path

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::schema::CircuitPolicy;
use crate::guard::types::GuardError;
use crate::observability::events::{self, Event, EventSink, Mechanism};
use crate::observability::metrics;
use crate::resilience::window::SlidingWindow;
use crate::store::{decode, encode, KeyStore, Mutation, SharedClock, StoreResult};

fn state_key(key: &str) -> String {
    format!("cb:{key}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Result of asking to pass a call through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Admitted as the single half-open probe.
    Probe,
    Rejected { opened_at: u64 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    Reopened,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Ignored,
    Counted,
    Moved(Transition),
}

/// Persisted breaker state for one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerState {
    pub status: BreakerStatus,
    pub window: SlidingWindow,
    pub window_ms: u64,
    pub opened_at: Option<u64>,
    pub probe_started: Option<u64>,
}

impl BreakerState {
    /// Decide admission, moving Open to Half-Open when the cool-down is over.
    /// Returns whether the state changed.
    pub fn try_acquire(&mut self, policy: &CircuitPolicy, now: u64) -> (Admission, bool) {
        match self.status {
            BreakerStatus::Closed => (Admission::Allowed, false),
            BreakerStatus::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                if now.saturating_sub(opened_at) >= policy.open_duration_ms {
                    self.status = BreakerStatus::HalfOpen;
                    self.probe_started = Some(now);
                    (Admission::Probe, true)
                } else {
                    (Admission::Rejected { opened_at }, false)
                }
            }
            BreakerStatus::HalfOpen => {
                let probing = self
                    .probe_started
                    .is_some_and(|started| now.saturating_sub(started) < policy.open_duration_ms);
                if probing {
                    (
                        Admission::Rejected {
                            opened_at: self.opened_at.unwrap_or(now),
                        },
                        false,
                    )
                } else {
                    self.probe_started = Some(now);
                    (Admission::Probe, true)
                }
            }
        }
    }

    fn on_result(&mut self, success: bool, probe: bool, policy: &CircuitPolicy, now: u64) -> Change {
        match self.status {
            BreakerStatus::Closed => {
                self.window_ms = policy.window_ms;
                self.window.record(success, now, policy.window_ms);
                let (successes, failures) = self.window.totals(now, policy.window_ms);
                let total = successes.saturating_add(failures);
                if total >= policy.minimum_samples
                    && total > 0
                    && f64::from(failures) / f64::from(total) >= policy.threshold
                {
                    self.trip(now);
                    Change::Moved(Transition::Opened)
                } else {
                    Change::Counted
                }
            }
            BreakerStatus::HalfOpen if !probe => Change::Ignored,
            BreakerStatus::HalfOpen => {
                if success {
                    self.status = BreakerStatus::Closed;
                    self.opened_at = None;
                    self.probe_started = None;
                    self.window.clear();
                    Change::Moved(Transition::Closed)
                } else {
                    self.trip(now);
                    Change::Moved(Transition::Reopened)
                }
            }
            // Late result from a call admitted before the breaker opened.
            BreakerStatus::Open => Change::Ignored,
        }
    }

    fn trip(&mut self, now: u64) {
        self.status = BreakerStatus::Open;
        self.opened_at = Some(now);
        self.probe_started = None;
        self.window.clear();
    }
}

/// Diagnostic view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub status: BreakerStatus,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<u64>,
}

fn decode_state(key: &str, bytes: &[u8]) -> BreakerState {
    decode(bytes).unwrap_or_else(|e| {
        tracing::warn!(key = %key, error = %e, "Corrupt breaker state, starting closed");
        BreakerState::default()
    })
}

fn persist(state: &BreakerState, policy: &CircuitPolicy) -> Mutation {
    // Open and half-open state must outlive any TTL; closed state may evaporate.
    let ttl = match state.status {
        BreakerStatus::Closed => Some(policy.window() + policy.open_duration()),
        BreakerStatus::Open | BreakerStatus::HalfOpen => None,
    };
    match encode(state) {
        Ok(value) => Mutation::Put { value, ttl },
        Err(_) => Mutation::Keep,
    }
}

/// Failure-rate circuit breaker over the shared key store.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn KeyStore>,
    clock: SharedClock,
    events: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn KeyStore>, clock: SharedClock, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            clock,
            events,
        }
    }

    /// Whether a call may proceed. Admitting a half-open probe counts as true.
    pub async fn allow(&self, policy: &CircuitPolicy) -> Result<bool, GuardError> {
        Ok(self.acquire(policy).await?.is_admitted())
    }

    /// Like [`allow`](Self::allow) but fails with `CircuitOpen` when rejected.
    pub async fn check(&self, policy: &CircuitPolicy) -> Result<Admission, GuardError> {
        match self.acquire(policy).await? {
            Admission::Rejected { opened_at } => Err(GuardError::CircuitOpen {
                key: policy.key.clone(),
                opened_at,
            }),
            admission => Ok(admission),
        }
    }

    /// Decide admission, applying the policy's backend failure mode.
    pub async fn acquire(&self, policy: &CircuitPolicy) -> Result<Admission, GuardError> {
        let started = Instant::now();
        match self.try_acquire(policy).await {
            Ok(admission) => {
                match admission {
                    Admission::Allowed => {}
                    Admission::Probe => {
                        metrics::record_breaker_state(&policy.key, BreakerStatus::HalfOpen);
                        self.emit(events::CIRCUIT_HALF_OPEN_PROBE, &policy.key, "probe", started);
                    }
                    Admission::Rejected { .. } => {
                        self.emit(events::CIRCUIT_REJECTED, &policy.key, "rejected", started);
                    }
                }
                Ok(admission)
            }
            Err(e) => {
                tracing::warn!(
                    key = %policy.key,
                    error = %e,
                    fail_open = policy.fail_open,
                    "Circuit breaker backend unavailable"
                );
                if policy.fail_open {
                    Ok(Admission::Allowed)
                } else {
                    Err(GuardError::from(e))
                }
            }
        }
    }

    async fn try_acquire(&self, policy: &CircuitPolicy) -> StoreResult<Admission> {
        let key = state_key(&policy.key);
        let now = self.clock.now_millis();

        match self.store.get(&key).await? {
            None => return Ok(Admission::Allowed),
            Some(stored) if decode_state(&key, &stored.value).status == BreakerStatus::Closed => {
                return Ok(Admission::Allowed)
            }
            Some(_) => {}
        }

        let mut admission = Admission::Allowed;
        self.store
            .update(&key, &mut |current| {
                let mut state = current
                    .map(|bytes| decode_state(&key, bytes))
                    .unwrap_or_default();
                let (decided, changed) = state.try_acquire(policy, now);
                admission = decided;
                if changed {
                    persist(&state, policy)
                } else {
                    Mutation::Keep
                }
            })
            .await?;
        Ok(admission)
    }

    /// Count a success from a call admitted while closed.
    pub async fn record_success(&self, policy: &CircuitPolicy) {
        self.record(policy, Admission::Allowed, true).await;
    }

    /// Count a failure from a call admitted while closed.
    pub async fn record_failure(&self, policy: &CircuitPolicy) {
        self.record(policy, Admission::Allowed, false).await;
    }

    /// Report the outcome of a call admitted with `admission`.
    ///
    /// Only a [`Admission::Probe`] result can close or reopen a half-open
    /// breaker.
    pub async fn record(&self, policy: &CircuitPolicy, admission: Admission, success: bool) {
        let started = Instant::now();
        let now = self.clock.now_millis();
        let key = state_key(&policy.key);
        let probe = admission == Admission::Probe;
        let mut change = Change::Ignored;

        let result = self
            .store
            .update(&key, &mut |current| {
                let mut state = current
                    .map(|bytes| decode_state(&key, bytes))
                    .unwrap_or_default();
                change = state.on_result(success, probe, policy, now);
                match change {
                    Change::Ignored => Mutation::Keep,
                    Change::Counted | Change::Moved(_) => persist(&state, policy),
                }
            })
            .await;

        if let Err(e) = result {
            tracing::warn!(key = %policy.key, error = %e, success, "Failed to record call outcome");
            return;
        }

        match change {
            Change::Moved(Transition::Opened) => {
                metrics::record_breaker_state(&policy.key, BreakerStatus::Open);
                self.emit(events::CIRCUIT_OPENED, &policy.key, "opened", started);
            }
            Change::Moved(Transition::Reopened) => {
                metrics::record_breaker_state(&policy.key, BreakerStatus::Open);
                self.emit(events::CIRCUIT_OPENED, &policy.key, "probe_failed", started);
            }
            Change::Moved(Transition::Closed) => {
                metrics::record_breaker_state(&policy.key, BreakerStatus::Closed);
                self.emit(events::CIRCUIT_CLOSED, &policy.key, "probe_succeeded", started);
            }
            Change::Counted | Change::Ignored => {}
        }
    }

    /// Current state of a breaker, or `None` if it has no recorded state.
    pub async fn status(&self, key: &str) -> Result<Option<BreakerSnapshot>, GuardError> {
        let Some(stored) = self.store.get(&state_key(key)).await? else {
            return Ok(None);
        };
        let state: BreakerState = decode(&stored.value)?;
        let (success_count, failure_count) =
            state.window.totals(self.clock.now_millis(), state.window_ms);
        Ok(Some(BreakerSnapshot {
            key: key.to_string(),
            status: state.status,
            failure_count,
            success_count,
            opened_at: state.opened_at,
        }))
    }

    /// Forget all state for a breaker, closing it.
    pub async fn reset(&self, key: &str) -> Result<bool, GuardError> {
        let removed = self.store.delete(&state_key(key)).await?;
        if removed {
            metrics::record_breaker_state(key, BreakerStatus::Closed);
            tracing::info!(key = %key, "Circuit breaker reset");
        }
        Ok(removed)
    }

    fn emit(&self, name: &'static str, key: &str, outcome: &'static str, started: Instant) {
        self.events.emit(&Event::new(
            name,
            key,
            Mechanism::Circuit,
            outcome,
            started.elapsed(),
        ));
    }
}
