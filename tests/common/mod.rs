//! Shared utilities for integration tests: scripted dependencies and guards
//! wired to an in-memory event sink.

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulwark::observability::MemorySink;
use bulwark::store::{KeyStore, ManualClock, MemoryStore, SharedClock};
use bulwark::{CallError, Guard};

pub type CallFuture<T> = Pin<Box<dyn Future<Output = Result<T, CallError>> + Send>>;

/// A dependency whose behaviour is scripted per call.
#[derive(Clone)]
pub struct Dependency {
    calls: Arc<AtomicU32>,
}

impl Dependency {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fails with a connection error `n` times, then returns `value`.
    pub fn fail_times<T>(&self, n: u32, value: T) -> impl Fn() -> CallFuture<T> + Send + Sync + 'static
    where
        T: Clone + Send + Sync + 'static,
    {
        let calls = Arc::clone(&self.calls);
        move || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            let fut: CallFuture<T> = Box::pin(async move {
                if attempt < n {
                    Err(CallError::Connection(format!("refused (call {})", attempt + 1)))
                } else {
                    Ok(value)
                }
            });
            fut
        }
    }

    /// Never answers within `hang`.
    pub fn hangs<T>(&self, hang: Duration) -> impl Fn() -> CallFuture<T> + Send + Sync + 'static
    where
        T: Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let fut: CallFuture<T> = Box::pin(async move {
                tokio::time::sleep(hang).await;
                Err(CallError::Other("answered too late".into()))
            });
            fut
        }
    }

    /// Returns `value` after `delay`.
    pub fn slow<T>(&self, delay: Duration, value: T) -> impl Fn() -> CallFuture<T> + Send + Sync + 'static
    where
        T: Clone + Send + Sync + 'static,
    {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            let fut: CallFuture<T> = Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(value)
            });
            fut
        }
    }

    /// Always fails with `error`.
    pub fn failing<T>(&self, error: CallError) -> impl Fn() -> CallFuture<T> + Send + Sync + 'static
    where
        T: Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let error = error.clone();
            let fut: CallFuture<T> = Box::pin(async move { Err(error) });
            fut
        }
    }
}

/// Everything a test needs to inspect a guard.
pub struct Harness {
    pub guard: Guard,
    pub store: Arc<dyn KeyStore>,
    pub clock: ManualClock,
    pub events: Arc<MemorySink>,
}

/// A guard over a fresh in-memory store and a manual clock.
pub fn harness() -> Harness {
    let clock = ManualClock::new(1_000_000);
    let shared: SharedClock = Arc::new(clock.clone());
    harness_on(Arc::new(MemoryStore::new(shared, 0)), clock)
}

/// A guard over `store`, e.g. to simulate a second node sharing it.
pub fn harness_on(store: Arc<dyn KeyStore>, clock: ManualClock) -> Harness {
    let events = Arc::new(MemorySink::new());
    let guard = Guard::builder()
        .store(store.clone())
        .clock(Arc::new(clock.clone()))
        .events(events.clone())
        .build();
    Harness {
        guard,
        store,
        clock,
        events,
    }
}
