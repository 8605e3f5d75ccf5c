//! Structured resilience events.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::observability::metrics;

pub const RATE_LIMIT_ADMITTED: &str = "rate_limit.admitted";
pub const RATE_LIMIT_DENIED: &str = "rate_limit.denied";
pub const CIRCUIT_OPENED: &str = "circuit.opened";
pub const CIRCUIT_CLOSED: &str = "circuit.closed";
pub const CIRCUIT_HALF_OPEN_PROBE: &str = "circuit.half_open_probe";
pub const CIRCUIT_REJECTED: &str = "circuit.rejected";
pub const RETRY_ATTEMPT: &str = "retry.attempt";
pub const RETRY_EXHAUSTED: &str = "retry.exhausted";
pub const CACHE_HIT: &str = "cache.hit";
pub const CACHE_MISS: &str = "cache.miss";
pub const CACHE_STALE: &str = "cache.stale";
pub const FALLBACK_INVOKED: &str = "fallback.invoked";
pub const FALLBACK_EXHAUSTED: &str = "fallback.exhausted";

/// Which mechanism produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    RateLimit,
    Circuit,
    Retry,
    Cache,
    Fallback,
}

impl Mechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::RateLimit => "rate_limit",
            Mechanism::Circuit => "circuit",
            Mechanism::Retry => "retry",
            Mechanism::Cache => "cache",
            Mechanism::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured event: `{key, mechanism, outcome, elapsed}` plus its name.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: &'static str,
    pub key: String,
    pub mechanism: Mechanism,
    pub outcome: &'static str,
    pub elapsed: Duration,
}

impl Event {
    pub fn new(
        name: &'static str,
        key: impl Into<String>,
        mechanism: Mechanism,
        outcome: &'static str,
        elapsed: Duration,
    ) -> Self {
        Self {
            name,
            key: key.into(),
            mechanism,
            outcome,
            elapsed,
        }
    }
}

/// Destination for resilience events.
pub trait EventSink: Send + Sync + fmt::Debug {
    fn emit(&self, event: &Event);
}

/// Default sink: a tracing event plus metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &Event) {
        let elapsed_ms = u64::try_from(event.elapsed.as_millis()).unwrap_or(u64::MAX);
        match event.name {
            RATE_LIMIT_DENIED | CIRCUIT_OPENED | RETRY_EXHAUSTED | FALLBACK_INVOKED
            | FALLBACK_EXHAUSTED => tracing::warn!(
                event = event.name,
                key = %event.key,
                mechanism = %event.mechanism,
                outcome = event.outcome,
                elapsed_ms,
                "resilience event"
            ),
            CIRCUIT_CLOSED | CIRCUIT_HALF_OPEN_PROBE => tracing::info!(
                event = event.name,
                key = %event.key,
                mechanism = %event.mechanism,
                outcome = event.outcome,
                elapsed_ms,
                "resilience event"
            ),
            _ => tracing::debug!(
                event = event.name,
                key = %event.key,
                mechanism = %event.mechanism,
                outcome = event.outcome,
                elapsed_ms,
                "resilience event"
            ),
        }
        metrics::record_event(event);
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of recorded events, oldest first.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.name).collect()
    }

    /// How many events with `name` were recorded.
    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name == name).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
