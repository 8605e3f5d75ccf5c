//! The guarded-call pipeline.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::admission::{RateLimitStatus, RateLimiter};
use crate::cache::ResponseCache;
use crate::config::schema::{CallPolicy, ResilienceConfig, RetryPolicy};
use crate::config::validation::validate_policy;
use crate::guard::types::{GuardError, Outcome};
use crate::observability::events::{EventSink, TracingSink};
use crate::resilience::circuit_breaker::{BreakerSnapshot, BreakerStatus, CircuitBreaker};
use crate::resilience::classify::CallError;
use crate::resilience::fallback::FallbackChain;
use crate::resilience::retries::RetryExecutor;
use crate::resilience::timeouts::Deadline;
use crate::store::{KeyStore, MemoryStore, SharedClock, SystemClock};

type SiteTable = HashMap<String, Arc<CallPolicy>>;

struct GuardInner {
    store: Arc<dyn KeyStore>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    retry: RetryExecutor,
    cache: ResponseCache,
    fallback: FallbackChain,
    sites: ArcSwap<SiteTable>,
    default_deadline_ms: AtomicU64,
}

/// Runs calls through rate limiting, caching, circuit breaking, retries and fallback.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Guard {
    inner: Arc<GuardInner>,
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("store", &self.inner.store)
            .field("sites", &self.inner.sites.load().len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Guard`].
#[derive(Default)]
pub struct GuardBuilder {
    store: Option<Arc<dyn KeyStore>>,
    clock: Option<SharedClock>,
    events: Option<Arc<dyn EventSink>>,
    sites: SiteTable,
    default_deadline_ms: u64,
}

impl GuardBuilder {
    /// Coordination backend. Defaults to an unbounded in-process store.
    pub fn store(mut self, store: Arc<dyn KeyStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Event sink. Defaults to [`TracingSink`].
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn site(mut self, name: impl Into<String>, policy: CallPolicy) -> Self {
        self.sites.insert(name.into(), Arc::new(policy));
        self
    }

    /// Take site policies and the default deadline from configuration.
    pub fn config(mut self, config: &ResilienceConfig) -> Self {
        self.sites = site_table(config);
        self.default_deadline_ms = config.defaults.deadline_ms;
        self
    }

    /// Deadline applied by `execute_site` and to detached cache computes (0 = none).
    pub fn default_deadline_ms(mut self, ms: u64) -> Self {
        self.default_deadline_ms = ms;
        self
    }

    pub fn build(self) -> Guard {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as SharedClock);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(clock.clone(), 0)) as Arc<dyn KeyStore>);
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(TracingSink) as Arc<dyn EventSink>);

        let limiter = RateLimiter::new(store.clone(), clock.clone(), events.clone());
        let breaker = CircuitBreaker::new(store.clone(), clock.clone(), events.clone());
        let retry = RetryExecutor::new(breaker.clone(), events.clone());
        let cache = ResponseCache::new(store.clone(), clock, events.clone());
        let fallback = FallbackChain::new(cache.clone(), events);

        Guard {
            inner: Arc::new(GuardInner {
                store,
                limiter,
                breaker,
                retry,
                cache,
                fallback,
                sites: ArcSwap::from_pointee(self.sites),
                default_deadline_ms: AtomicU64::new(self.default_deadline_ms),
            }),
        }
    }
}

fn site_table(config: &ResilienceConfig) -> SiteTable {
    config
        .sites
        .iter()
        .map(|(name, policy)| (name.clone(), Arc::new(policy.clone())))
        .collect()
}

/// Name used in events when a call has no site name.
fn policy_label(policy: &CallPolicy) -> &str {
    policy
        .cache
        .as_ref()
        .map(|c| c.key.as_str())
        .or_else(|| policy.circuit.as_ref().map(|c| c.key.as_str()))
        .or_else(|| policy.rate_limit.first().map(|r| r.key.as_str()))
        .unwrap_or("call")
}

impl Guard {
    pub fn builder() -> GuardBuilder {
        GuardBuilder::default()
    }

    /// A guard over `store` with default clock and tracing events.
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self::builder().store(store).build()
    }

    /// Run `call` under `policy`.
    ///
    /// Order: rate limits, cache, circuit breaker + retries, fallback. Fresh results
    /// are stored in the cache; fallback results never are.
    pub async fn execute<T, F, Fut>(
        &self,
        policy: &CallPolicy,
        deadline: Deadline,
        call: F,
    ) -> Result<Outcome<T>, GuardError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        let label = policy_label(policy).to_string();
        self.run(&label, policy, deadline, call).await
    }

    /// Run `call` under the named site's policy and the default deadline.
    pub async fn execute_site<T, F, Fut>(&self, site: &str, call: F) -> Result<Outcome<T>, GuardError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        let policy = self
            .site(site)
            .ok_or_else(|| GuardError::InvalidPolicy(format!("unknown call site: {site}")))?;
        let deadline = Deadline::from_millis(self.inner.default_deadline_ms.load(Ordering::Relaxed));
        self.run(site, &policy, deadline, call).await
    }

    async fn run<T, F, Fut>(
        &self,
        label: &str,
        policy: &CallPolicy,
        deadline: Deadline,
        call: F,
    ) -> Result<Outcome<T>, GuardError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        if let Err(errors) = validate_policy(policy) {
            let message = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(GuardError::InvalidPolicy(message));
        }

        match self.primary(policy, &deadline, call).await {
            Ok(outcome) => Ok(outcome),
            Err(failure) => {
                tracing::debug!(site = %label, error = %failure, code = failure.code(), "Guarded call failed");
                self.inner.fallback.resolve(label, policy, failure).await
            }
        }
    }

    async fn primary<T, F, Fut>(
        &self,
        policy: &CallPolicy,
        deadline: &Deadline,
        call: F,
    ) -> Result<Outcome<T>, GuardError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    {
        self.inner
            .limiter
            .admit_all(&policy.rate_limit, deadline)
            .await?;

        let retry = policy
            .retry
            .clone()
            .unwrap_or_else(|| RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            });
        let circuit = policy.circuit.clone();

        let Some(cache_policy) = &policy.cache else {
            let value = self
                .inner
                .retry
                .execute(&call, &retry, circuit.as_ref(), deadline)
                .await?;
            return Ok(Outcome::Fresh(value));
        };

        let executor = self.inner.retry.clone();
        let compute_deadline_ms = self.inner.default_deadline_ms.load(Ordering::Relaxed);
        let compute = move || async move {
            // Detached from the caller: bounded by the default deadline, not the caller's.
            let deadline = Deadline::from_millis(compute_deadline_ms);
            let value = executor
                .execute(&call, &retry, circuit.as_ref(), &deadline)
                .await?;
            serde_json::to_value(value).map_err(|e| {
                GuardError::InvalidPolicy(format!("result cannot be cached: {e}"))
            })
        };

        let lookup = self
            .inner
            .cache
            .get_or_set(cache_policy, deadline, compute)
            .await?;
        let value: T = serde_json::from_value(Value::clone(&lookup.value)).map_err(|e| {
            GuardError::InvalidPolicy(format!(
                "cached value for {} has the wrong shape: {e}",
                cache_policy.key
            ))
        })?;
        Ok(if lookup.cached {
            Outcome::Cached(value)
        } else {
            Outcome::Fresh(value)
        })
    }

    /// Policy for a named site.
    pub fn site(&self, name: &str) -> Option<Arc<CallPolicy>> {
        self.inner.sites.load().get(name).cloned()
    }

    /// Names of all configured sites, sorted.
    pub fn site_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.sites.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Atomically replace site policies and the default deadline.
    pub fn reload(&self, config: &ResilienceConfig) {
        self.inner.sites.store(Arc::new(site_table(config)));
        self.inner
            .default_deadline_ms
            .store(config.defaults.deadline_ms, Ordering::Relaxed);
        tracing::info!(sites = config.sites.len(), "Guard policies reloaded");
    }

    pub async fn breaker_status(&self, key: &str) -> Result<Option<BreakerSnapshot>, GuardError> {
        self.inner.breaker.status(key).await
    }

    pub async fn rate_limit_status(&self, key: &str) -> Result<Option<RateLimitStatus>, GuardError> {
        self.inner.limiter.status(key).await
    }

    /// Breaker keys of every configured site that are currently open.
    pub async fn open_breakers(&self) -> Result<Vec<String>, GuardError> {
        let sites = self.inner.sites.load_full();
        let mut keys: Vec<&str> = sites
            .values()
            .filter_map(|p| p.circuit.as_ref().map(|c| c.key.as_str()))
            .collect();
        keys.sort_unstable();
        keys.dedup();

        let mut open = Vec::new();
        for key in keys {
            if let Some(snapshot) = self.inner.breaker.status(key).await? {
                if snapshot.status == BreakerStatus::Open {
                    open.push(key.to_string());
                }
            }
        }
        Ok(open)
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.inner.retry
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    pub fn fallback(&self) -> &FallbackChain {
        &self.inner.fallback
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.inner.store
    }
}
