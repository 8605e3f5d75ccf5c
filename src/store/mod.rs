//! Shared-state substrate for every resilience mechanism.
//!
//! # Data Flow
//! ```text
//! RateLimiter / CircuitBreaker / ResponseCache
//!     → KeyStore::update (read-modify-write, exclusive per key)
//!     → KeyStore::get / set / compare_and_swap / delete
//!         → MemoryStore (single node, per-key locks, LRU bounded)
//!         → RedisStore  (multi node, versioned hashes + Lua CAS)
//! ```
//!
//! # Design Decisions
//! - The backend is chosen once at construction; core logic only sees `Arc<dyn KeyStore>`
//! - Values are opaque bytes; components encode their own state as JSON
//! - Every write carries an optional TTL so idle state evaporates on its own
//! - Each mechanism namespaces its keys (`rl:`, `cb:`, `cache:`, `lease:`) so equal
//!   caller keys never collide across mechanisms

pub mod clock;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use memory::MemoryStore;

/// Upper bound on optimistic retries in the default `update` implementation.
const MAX_CAS_ATTEMPTS: usize = 32;

/// Errors raised by a coordination backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the command.
    #[error("coordination backend unavailable: {0}")]
    Unavailable(String),

    /// Optimistic updates kept losing the race for this key.
    #[error("contention on key {0}: compare-and-swap attempts exhausted")]
    Contention(String),

    /// Stored state could not be encoded or decoded.
    #[error("state encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Snapshot file could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A stored value together with its write version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    /// Monotonic per-write version used for compare-and-swap.
    pub version: u64,
}

/// What a read-modify-write closure wants done with the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Replace the value (and refresh its TTL).
    Put { value: Vec<u8>, ttl: Option<Duration> },
    /// Leave the stored value untouched.
    Keep,
}

/// Minimal key-value contract shared by the in-process and external backends.
#[async_trait]
pub trait KeyStore: Send + Sync + fmt::Debug {
    /// Read a live (unexpired) value.
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>>;

    /// Unconditionally write a value.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()>;

    /// Write only if the current version matches `expected`.
    ///
    /// `expected = None` means the key must be absent (or expired).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Remove a key. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Atomic read-modify-write on a single key.
    ///
    /// `apply` may run more than once when the backend resolves races optimistically;
    /// only the invocation whose result is committed counts. Returns the value that
    /// is stored once the call completes.
    async fn update(
        &self,
        key: &str,
        apply: &mut (dyn for<'v> FnMut(Option<&'v [u8]>) -> Mutation + Send),
    ) -> StoreResult<Option<Vec<u8>>> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(key).await?;
            let mutation = apply(current.as_ref().map(|v| v.value.as_slice()));
            match mutation {
                Mutation::Keep => return Ok(current.map(|v| v.value)),
                Mutation::Put { value, ttl } => {
                    let expected = current.as_ref().map(|v| v.version);
                    if self
                        .compare_and_swap(key, expected, value.clone(), ttl)
                        .await?
                    {
                        return Ok(Some(value));
                    }
                }
            }
        }
        Err(StoreError::Contention(key.to_string()))
    }

    /// True when the backend is shared between processes.
    fn is_shared(&self) -> bool {
        false
    }
}

/// Encode component state for storage.
pub fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode component state read from storage.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}
