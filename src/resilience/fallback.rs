//! Ordered degradation after the primary path fails.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::cache::ResponseCache;
use crate::config::schema::{CallPolicy, FallbackStrategy};
use crate::guard::types::{GuardError, Outcome};
use crate::observability::events::{self, Event, EventSink, Mechanism};

/// Whether `failure` should be handed to the policy's fallback chain.
///
/// Rate-limit denials, invalid policies and an expired caller deadline always
/// propagate, as do codes listed in `fallback_bypass`.
pub fn applies_to(policy: &CallPolicy, failure: &GuardError) -> bool {
    if policy.fallback.is_empty() {
        return false;
    }
    if matches!(
        failure,
        GuardError::RateLimitExceeded { .. }
            | GuardError::InvalidPolicy(_)
            | GuardError::DeadlineExceeded
    ) {
        return false;
    }
    !policy.fallback_bypass.iter().any(|code| code == failure.code())
}

/// Tries each configured strategy in order.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    cache: ResponseCache,
    events: Arc<dyn EventSink>,
}

impl FallbackChain {
    pub fn new(cache: ResponseCache, events: Arc<dyn EventSink>) -> Self {
        Self { cache, events }
    }

    /// Produce a degraded result for `failure`, or propagate it.
    ///
    /// Failures the chain does not apply to come back unchanged; a chain that runs
    /// out of strategies returns `FallbackExhausted` wrapping the original.
    pub async fn resolve<T: DeserializeOwned>(
        &self,
        key: &str,
        policy: &CallPolicy,
        failure: GuardError,
    ) -> Result<Outcome<T>, GuardError> {
        if !applies_to(policy, &failure) {
            return Err(failure);
        }
        let started = Instant::now();

        for strategy in &policy.fallback {
            if let Some(outcome) = self.try_strategy(key, policy, strategy).await {
                tracing::info!(
                    key = %key,
                    strategy = strategy.name(),
                    error = %failure,
                    "Serving fallback"
                );
                self.emit(events::FALLBACK_INVOKED, key, strategy.name(), started);
                return Ok(outcome);
            }
        }

        self.emit(events::FALLBACK_EXHAUSTED, key, "exhausted", started);
        Err(GuardError::FallbackExhausted {
            original: Box::new(failure),
        })
    }

    async fn try_strategy<T: DeserializeOwned>(
        &self,
        key: &str,
        policy: &CallPolicy,
        strategy: &FallbackStrategy,
    ) -> Option<Outcome<T>> {
        match strategy {
            FallbackStrategy::LastKnownGood => {
                let cache_key = &policy.cache.as_ref()?.key;
                let value = match self.cache.get_stale(cache_key).await {
                    Ok(value) => value?,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Last-known-good lookup failed");
                        return None;
                    }
                };
                self.convert(key, strategy, value)
            }
            FallbackStrategy::Static { value } => self.convert(key, strategy, value.clone()),
            FallbackStrategy::Degraded => Some(Outcome::Degraded),
        }
    }

    fn convert<T: DeserializeOwned>(
        &self,
        key: &str,
        strategy: &FallbackStrategy,
        value: serde_json::Value,
    ) -> Option<Outcome<T>> {
        match serde_json::from_value(value) {
            Ok(value) => Some(Outcome::Fallback {
                strategy: strategy.name(),
                value,
            }),
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    strategy = strategy.name(),
                    error = %e,
                    "Fallback value has the wrong shape"
                );
                None
            }
        }
    }

    fn emit(&self, name: &'static str, key: &str, outcome: &'static str, started: Instant) {
        self.events.emit(&Event::new(
            name,
            key,
            Mechanism::Fallback,
            outcome,
            started.elapsed(),
        ));
    }
}
