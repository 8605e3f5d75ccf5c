//! TTL response cache with single-flight computes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::cache::lease::{self, LeaseOutcome};
use crate::config::schema::CachePolicy;
use crate::guard::types::GuardError;
use crate::observability::events::{self, Event, EventSink, Mechanism};
use crate::observability::metrics;
use crate::resilience::classify::CallError;
use crate::resilience::timeouts::Deadline;
use crate::store::{decode, encode, KeyStore, SharedClock, StoreResult};

fn entry_key(key: &str) -> String {
    format!("cache:{key}")
}

/// A stored result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub stored_at: u64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: u64) -> bool {
        now < self.stored_at.saturating_add(self.ttl_ms)
    }
}

/// Value returned by [`ResponseCache::get_or_set`].
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub value: Arc<Value>,
    /// True when served from an entry rather than computed for this request.
    pub cached: bool,
}

type Shared = Option<Result<Lookup, GuardError>>;

/// One in-flight compute.
#[derive(Debug, Clone)]
struct Flight {
    result: watch::Receiver<Shared>,
    /// Set by `delete` while the compute runs; its result must not be stored.
    invalidated: Arc<AtomicBool>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn KeyStore>,
    clock: SharedClock,
    events: Arc<dyn EventSink>,
    /// In-flight computes. Present only while a leader task is running for the key.
    flights: DashMap<String, Flight>,
    inflight: AtomicUsize,
}

/// Removes the flight marker even if the leader task unwinds.
struct FlightGuard {
    inner: Arc<Inner>,
    key: String,
    marker: Flight,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inner
            .flights
            .remove_if(&self.key, |_, f| f.result.same_channel(&self.marker.result));
        let now = self.inner.inflight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::record_inflight(now);
    }
}

/// Response cache over the shared key store.
///
/// At most one compute runs per key per process. Computes run in their own task,
/// so a caller whose deadline elapses detaches without cancelling the compute
/// or disturbing other waiters.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    inner: Arc<Inner>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KeyStore>, clock: SharedClock, events: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                events,
                flights: DashMap::new(),
                inflight: AtomicUsize::new(0),
            }),
        }
    }

    /// Fresh value for `key`, if any.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, GuardError> {
        let now = self.inner.clock.now_millis();
        Ok(self
            .inner
            .read(key)
            .await?
            .filter(|e| e.is_fresh(now))
            .map(|e| e.value))
    }

    /// Most recent value for `key`, ignoring its TTL (last known good).
    pub async fn get_stale(&self, key: &str) -> Result<Option<Value>, GuardError> {
        Ok(self.inner.read(key).await?.map(|e| e.value))
    }

    /// Store a value under the policy's TTL.
    pub async fn set(&self, policy: &CachePolicy, value: Value) -> Result<(), GuardError> {
        Ok(self.inner.write(policy, value).await?)
    }

    /// Invalidate an entry. Returns whether one existed.
    ///
    /// A compute already in flight for `key` still answers its waiters, but its
    /// result is not stored.
    pub async fn delete(&self, key: &str) -> Result<bool, GuardError> {
        if let Some(flight) = self.inner.flights.get(key) {
            flight.invalidated.store(true, Ordering::SeqCst);
        }
        Ok(self.inner.store.delete(&entry_key(key)).await?)
    }

    /// Number of computes currently running in this process.
    pub fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::SeqCst)
    }

    /// Return the fresh entry for `policy.key`, or compute it exactly once.
    ///
    /// Callers arriving while a compute is in flight wait for its result. A failed
    /// compute stores nothing and its error reaches every waiter.
    pub async fn get_or_set<F, Fut>(
        &self,
        policy: &CachePolicy,
        deadline: &Deadline,
        compute: F,
    ) -> Result<Lookup, GuardError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, GuardError>> + Send + 'static,
    {
        let started = Instant::now();
        let key = policy.key.as_str();
        let now = self.inner.clock.now_millis();

        let stale = match self.inner.read(key).await {
            Ok(Some(entry)) if entry.is_fresh(now) => {
                self.inner.emit(events::CACHE_HIT, key, "hit", started);
                return Ok(Lookup {
                    value: Arc::new(entry.value),
                    cached: true,
                });
            }
            Ok(entry) => entry.is_some(),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                false
            }
        };

        let (flight, leader) = match self.inner.flights.entry(key.to_string()) {
            Entry::Occupied(flight) => (flight.get().clone(), None),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                let flight = Flight {
                    result: rx,
                    invalidated: Arc::new(AtomicBool::new(false)),
                };
                slot.insert(flight.clone());
                (flight, Some(tx))
            }
        };

        let role = if leader.is_some() { "leader" } else { "follower" };
        if stale {
            self.inner.emit(events::CACHE_STALE, key, role, started);
        } else {
            self.inner.emit(events::CACHE_MISS, key, role, started);
        }

        let rx = flight.result.clone();
        if let Some(tx) = leader {
            self.spawn_leader(policy.clone(), tx, flight, compute);
        }

        deadline
            .run(wait(rx))
            .await
            .map_err(|_| GuardError::DeadlineExceeded)?
    }

    fn spawn_leader<F, Fut>(
        &self,
        policy: CachePolicy,
        tx: watch::Sender<Shared>,
        flight: Flight,
        compute: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, GuardError>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let count = inner.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_inflight(count);

        tokio::spawn(async move {
            let invalidated = Arc::clone(&flight.invalidated);
            let guard = FlightGuard {
                inner: Arc::clone(&inner),
                key: policy.key.clone(),
                marker: flight,
            };
            let result = inner.lead(&policy, &invalidated, compute).await;
            drop(guard);
            let _ = tx.send(Some(result));
        });
    }
}

async fn wait(mut rx: watch::Receiver<Shared>) -> Result<Lookup, GuardError> {
    let result = rx.wait_for(Option::is_some).await.map(|r| r.clone());
    match result {
        Ok(Some(shared)) => shared,
        Ok(None) | Err(_) => Err(GuardError::Downstream(CallError::Other(
            "cache compute abandoned".to_string(),
        ))),
    }
}

impl Inner {
    async fn read(&self, key: &str) -> StoreResult<Option<CacheEntry>> {
        match self.store.get(&entry_key(key)).await? {
            Some(stored) => Ok(Some(decode(&stored.value)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, policy: &CachePolicy, value: Value) -> StoreResult<()> {
        let entry = CacheEntry {
            value,
            stored_at: self.clock.now_millis(),
            ttl_ms: policy.ttl_ms,
        };
        let retain = policy.ttl() + policy.stale_ttl();
        self.store
            .set(&entry_key(&policy.key), encode(&entry)?, Some(retain))
            .await
    }

    async fn fresh(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_millis();
        self.read(key)
            .await
            .ok()
            .flatten()
            .filter(|e| e.is_fresh(now))
    }

    async fn lead<F, Fut>(
        &self,
        policy: &CachePolicy,
        invalidated: &AtomicBool,
        compute: F,
    ) -> Result<Lookup, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, GuardError>>,
    {
        let key = policy.key.as_str();

        // A previous leader may have filled the entry after this caller's first read.
        if let Some(entry) = self.fresh(key).await {
            return Ok(Lookup {
                value: Arc::new(entry.value),
                cached: true,
            });
        }

        let mut held = None;
        if self.store.is_shared() {
            match lease::acquire(&self.store, key, policy, || async move {
                self.fresh(key).await.is_some()
            })
            .await
            {
                LeaseOutcome::Acquired(lease) => held = Some(lease),
                LeaseOutcome::Filled => {
                    if let Some(entry) = self.fresh(key).await {
                        return Ok(Lookup {
                            value: Arc::new(entry.value),
                            cached: true,
                        });
                    }
                }
                LeaseOutcome::Unavailable => {}
            }
        }

        let result = compute().await;
        if let Ok(value) = &result {
            if !invalidated.load(Ordering::SeqCst) {
                if let Err(e) = self.write(policy, value.clone()).await {
                    tracing::warn!(key = %key, error = %e, "Cache write failed, serving uncached result");
                }
            }
            // An invalidation that raced the write above must still win.
            if invalidated.load(Ordering::SeqCst) {
                tracing::debug!(key = %key, "Entry invalidated during compute, result not stored");
                if let Err(e) = self.store.delete(&entry_key(key)).await {
                    tracing::warn!(key = %key, error = %e, "Failed to drop invalidated cache entry");
                }
            }
        }
        if let Some(lease) = held {
            lease.release(&self.store).await;
        }

        result.map(|value| Lookup {
            value: Arc::new(value),
            cached: false,
        })
    }

    fn emit(&self, name: &'static str, key: &str, outcome: &'static str, started: Instant) {
        self.events.emit(&Event::new(
            name,
            key,
            Mechanism::Cache,
            outcome,
            started.elapsed(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::events::MemorySink;
    use crate::store::{ManualClock, MemoryStore};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn cache(clock: &ManualClock) -> (ResponseCache, Arc<MemorySink>) {
        let shared: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new(shared.clone(), 0));
        let sink = Arc::new(MemorySink::new());
        (ResponseCache::new(store, shared, sink.clone()), sink)
    }

    type Compute = futures_util::future::BoxFuture<'static, Result<Value, GuardError>>;

    fn counting(counter: &Arc<AtomicU32>) -> impl FnOnce() -> Compute + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!(n))
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hundred_concurrent_callers_compute_once() {
        let clock = ManualClock::new(0);
        let (cache, _) = cache(&clock);
        let policy = CachePolicy::new("report:daily", Duration::from_secs(60));
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let cache = cache.clone();
            let policy = policy.clone();
            let compute = counting(&counter);
            handles.push(tokio::spawn(async move {
                cache.get_or_set(&policy, &Deadline::none(), compute).await
            }));
        }
        for h in handles {
            let lookup = h.await.unwrap().unwrap();
            assert_eq!(*lookup.value, json!(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.inflight(), 0);
    }

    #[tokio::test]
    async fn test_expired_entry_recomputed_once() {
        let clock = ManualClock::new(0);
        let (cache, sink) = cache(&clock);
        let policy = CachePolicy::new("k", Duration::from_secs(10));
        let counter = Arc::new(AtomicU32::new(0));

        let first = cache
            .get_or_set(&policy, &Deadline::none(), counting(&counter))
            .await
            .unwrap();
        assert!(!first.cached);
        let second = cache
            .get_or_set(&policy, &Deadline::none(), counting(&counter))
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(10));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = cache.clone();
            let policy = policy.clone();
            let compute = counting(&counter);
            handles.push(tokio::spawn(async move {
                cache.get_or_set(&policy, &Deadline::none(), compute).await
            }));
        }
        for h in handles {
            assert_eq!(*h.await.unwrap().unwrap().value, json!(2));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(sink.count(events::CACHE_STALE) >= 1);

        // The expired value was retained for last-known-good reads.
        assert_eq!(cache.get_stale("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter_and_stores_nothing() {
        let clock = ManualClock::new(0);
        let (cache, _) = cache(&clock);
        let policy = CachePolicy::new("k", Duration::from_secs(10));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let leader = {
            let cache = cache.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                cache
                    .get_or_set(&policy, &Deadline::none(), move || async move {
                        let _ = release_rx.await;
                        Err(GuardError::Downstream(CallError::Connection("reset".into())))
                    })
                    .await
            })
        };
        while cache.inflight() == 0 {
            tokio::task::yield_now().await;
        }
        let follower = {
            let cache = cache.clone();
            let policy = policy.clone();
            tokio::spawn(async move {
                cache
                    .get_or_set(&policy, &Deadline::none(), || async { Ok(json!("unused")) })
                    .await
            })
        };
        tokio::task::yield_now().await;
        release_tx.send(()).unwrap();

        let expected = GuardError::Downstream(CallError::Connection("reset".into()));
        assert_eq!(leader.await.unwrap().unwrap_err(), expected);
        assert_eq!(follower.await.unwrap().unwrap_err(), expected);
        assert_eq!(cache.get_stale("k").await.unwrap(), None);
        assert_eq!(cache.inflight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_detaches_waiter_but_compute_finishes() {
        let clock = ManualClock::new(0);
        let (cache, _) = cache(&clock);
        let policy = CachePolicy::new("slow", Duration::from_secs(60));

        let result = cache
            .get_or_set(&policy, &Deadline::after(Duration::from_millis(10)), || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!("done"))
            })
            .await;
        assert_eq!(result.unwrap_err(), GuardError::DeadlineExceeded);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.get("slow").await.unwrap(), Some(json!("done")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_during_compute_is_not_undone() {
        let clock = ManualClock::new(0);
        let (cache, _) = cache(&clock);
        let policy = CachePolicy::new("k", Duration::from_secs(60));
        let counter = Arc::new(AtomicU32::new(0));

        let caller = {
            let cache = cache.clone();
            let policy = policy.clone();
            let compute = counting(&counter);
            tokio::spawn(async move { cache.get_or_set(&policy, &Deadline::none(), compute).await })
        };
        while cache.inflight() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!cache.delete("k").await.unwrap());

        let lookup = caller.await.unwrap().unwrap();
        assert_eq!(*lookup.value, json!(1));
        assert!(!lookup.cached);
        assert_eq!(cache.get_stale("k").await.unwrap(), None);

        let next = cache
            .get_or_set(&policy, &Deadline::none(), counting(&counter))
            .await
            .unwrap();
        assert_eq!(*next.value, json!(2));
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_delete_invalidates() {
        let clock = ManualClock::new(0);
        let (cache, _) = cache(&clock);
        let policy = CachePolicy::new("k", Duration::from_secs(10));
        cache.set(&policy, json!({"v": 1})).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!({"v": 1})));
        assert!(cache.delete("k").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
