//! In-process key store for single-node deployments.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::clock::{millis, SharedClock};
use super::{KeyStore, Mutation, StoreResult, Versioned};

/// A stored value with its version and absolute expiry.
#[derive(Debug, Clone)]
struct Stored {
    value: Vec<u8>,
    version: u64,
    expires_at: Option<u64>,
}

impl Stored {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// One key's state. The mutex is the key's critical section.
#[derive(Debug, Default)]
struct Slot {
    entry: Mutex<Option<Stored>>,
    last_access: AtomicU64,
}

/// On-disk form of a live entry.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    value: Vec<u8>,
    expires_at: Option<u64>,
}

/// Per-key locked map with TTLs, LRU bound and optional file snapshots.
///
/// Two different keys never share a critical section: the map only hands out
/// `Arc<Slot>` handles and every read-modify-write runs under the slot's own mutex.
#[derive(Debug)]
pub struct MemoryStore {
    slots: DashMap<String, Arc<Slot>>,
    clock: SharedClock,
    /// Zero means unbounded.
    max_entries: usize,
    version: AtomicU64,
    tick: AtomicU64,
    persistence_path: Option<PathBuf>,
}

fn lock(slot: &Slot) -> MutexGuard<'_, Option<Stored>> {
    slot.entry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(clock: SharedClock, max_entries: usize) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            max_entries,
            version: AtomicU64::new(0),
            tick: AtomicU64::new(0),
            persistence_path: None,
        }
    }

    /// Create a store that snapshots to `path`, restoring any previous snapshot.
    pub fn with_persistence(
        clock: SharedClock,
        max_entries: usize,
        path: impl Into<PathBuf>,
    ) -> StoreResult<Self> {
        let mut store = Self::new(clock, max_entries);
        let path = path.into();
        let restored = store.restore(&path)?;
        if restored > 0 {
            tracing::info!(path = %path.display(), entries = restored, "Restored key store snapshot");
        }
        store.persistence_path = Some(path);
        Ok(store)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.slots
            .iter()
            .filter(|r| lock(r.value()).as_ref().is_some_and(|s| s.is_live(now)))
            .count()
    }

    /// True when no live entries exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write all live entries to the snapshot file. Returns the number written.
    pub fn save_to_file(&self) -> StoreResult<usize> {
        let Some(path) = &self.persistence_path else {
            return Ok(0);
        };

        let now = self.clock.now_millis();
        let map: HashMap<String, PersistedEntry> = self
            .slots
            .iter()
            .filter_map(|r| {
                let guard = lock(r.value());
                guard.as_ref().filter(|s| s.is_live(now)).map(|s| {
                    (
                        r.key().clone(),
                        PersistedEntry {
                            value: s.value.clone(),
                            expires_at: s.expires_at,
                        },
                    )
                })
            })
            .collect();

        let tmp = path.with_extension("tmp");
        {
            let writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(writer, &map)?;
        }
        fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), entries = map.len(), "Saved key store snapshot");
        Ok(map.len())
    }

    fn restore(&self, path: &Path) -> StoreResult<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(File::open(path)?);
        let map: HashMap<String, PersistedEntry> = serde_json::from_reader(reader)?;

        let now = self.clock.now_millis();
        let mut restored = 0;
        for (key, entry) in map {
            if entry.expires_at.is_some_and(|at| at <= now) {
                continue;
            }
            let slot = self.slot(&key);
            *lock(&slot) = Some(Stored {
                value: entry.value,
                version: self.next_version(),
                expires_at: entry.expires_at,
            });
            self.touch(&slot);
            restored += 1;
        }
        Ok(restored)
    }

    fn existing(&self, key: &str) -> Option<Arc<Slot>> {
        self.slots.get(key).map(|r| Arc::clone(r.value()))
    }

    fn slot(&self, key: &str) -> Arc<Slot> {
        if let Some(slot) = self.existing(key) {
            return slot;
        }
        let slot = Arc::clone(
            self.slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Slot::default()))
                .value(),
        );
        if self.max_entries > 0 && self.slots.len() > self.max_entries {
            self.evict(key);
        }
        slot
    }

    fn touch(&self, slot: &Slot) {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        slot.last_access.store(tick, Ordering::Relaxed);
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn write(&self, entry: &mut Option<Stored>, value: Vec<u8>, ttl: Option<Duration>) {
        let now = self.clock.now_millis();
        *entry = Some(Stored {
            value,
            version: self.next_version(),
            expires_at: ttl.map(|t| now.saturating_add(millis(t))),
        });
    }

    /// Drop least-recently-used slots until the map is back under 90% of the bound.
    ///
    /// Vacant and expired slots go first; slots currently borrowed by an operation
    /// are never evicted.
    fn evict(&self, keep: &str) {
        let now = self.clock.now_millis();
        let target = self.max_entries - self.max_entries / 10;

        let mut candidates: Vec<(u64, String)> = self
            .slots
            .iter()
            .filter(|r| r.key() != keep && Arc::strong_count(r.value()) == 1)
            .filter_map(|r| {
                let slot = r.value();
                let live = match slot.entry.try_lock() {
                    Ok(guard) => guard.as_ref().is_some_and(|s| s.is_live(now)),
                    Err(TryLockError::Poisoned(p)) => {
                        p.into_inner().as_ref().is_some_and(|s| s.is_live(now))
                    }
                    Err(TryLockError::WouldBlock) => return None,
                };
                let rank = if live {
                    slot.last_access.load(Ordering::Relaxed).saturating_add(1)
                } else {
                    0
                };
                Some((rank, r.key().clone()))
            })
            .collect();

        let excess = self.slots.len().saturating_sub(target);
        if excess == 0 {
            return;
        }
        candidates.sort_unstable();

        let mut evicted = 0;
        for (_, key) in candidates.into_iter().take(excess) {
            if self
                .slots
                .remove_if(&key, |_, slot| Arc::strong_count(slot) == 1)
                .is_some()
            {
                evicted += 1;
            }
        }
        tracing::debug!(evicted, remaining = self.slots.len(), "Evicted idle key store entries");
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        let Some(slot) = self.existing(key) else {
            return Ok(None);
        };
        let now = self.clock.now_millis();
        let mut entry = lock(&slot);
        match entry.as_ref() {
            Some(stored) if stored.is_live(now) => {
                let found = Versioned {
                    value: stored.value.clone(),
                    version: stored.version,
                };
                drop(entry);
                self.touch(&slot);
                Ok(Some(found))
            }
            Some(_) => {
                *entry = None;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()> {
        let slot = self.slot(key);
        self.write(&mut lock(&slot), value, ttl);
        self.touch(&slot);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let slot = self.slot(key);
        let now = self.clock.now_millis();
        let mut entry = lock(&slot);
        let current = entry
            .as_ref()
            .filter(|s| s.is_live(now))
            .map(|s| s.version);
        if current != expected {
            return Ok(false);
        }
        self.write(&mut entry, value, ttl);
        drop(entry);
        self.touch(&slot);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let Some(slot) = self.existing(key) else {
            return Ok(false);
        };
        let now = self.clock.now_millis();
        let removed = lock(&slot).take().is_some_and(|s| s.is_live(now));
        drop(slot);
        self.slots.remove_if(key, |_, slot| {
            Arc::strong_count(slot) == 1 && lock(slot).is_none()
        });
        Ok(removed)
    }

    async fn update(
        &self,
        key: &str,
        apply: &mut (dyn for<'v> FnMut(Option<&'v [u8]>) -> Mutation + Send),
    ) -> StoreResult<Option<Vec<u8>>> {
        let slot = self.slot(key);
        let now = self.clock.now_millis();
        let mut entry = lock(&slot);
        if entry.as_ref().is_some_and(|s| !s.is_live(now)) {
            *entry = None;
        }

        let mutation = apply(entry.as_ref().map(|s| s.value.as_slice()));
        let committed = match mutation {
            Mutation::Keep => entry.as_ref().map(|s| s.value.clone()),
            Mutation::Put { value, ttl } => {
                self.write(&mut entry, value.clone(), ttl);
                Some(value)
            }
        };
        drop(entry);
        self.touch(&slot);
        Ok(committed)
    }
}

/// Periodically snapshot `store` until shutdown, then write a final snapshot.
pub fn spawn_snapshot_task(
    store: Arc<MemoryStore>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let store = Arc::clone(&store);
                    match tokio::task::spawn_blocking(move || store.save_to_file()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::warn!(error = %e, "Key store snapshot failed"),
                        Err(e) => tracing::warn!(error = %e, "Key store snapshot task panicked"),
                    }
                }
                _ = shutdown.recv() => {
                    match store.save_to_file() {
                        Ok(entries) => tracing::info!(entries, "Final key store snapshot written"),
                        Err(e) => tracing::error!(error = %e, "Final key store snapshot failed"),
                    }
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::clock::ManualClock;

    fn store_with_clock(max_entries: usize) -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (MemoryStore::new(Arc::new(clock.clone()), max_entries), clock)
    }

    #[tokio::test]
    async fn test_set_get_and_ttl_expiry() {
        let (store, clock) = store_with_clock(0);
        store
            .set("a", b"1".to_vec(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().value, b"1");

        clock.advance(Duration::from_secs(5));
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_swap_versions() {
        let (store, _) = store_with_clock(0);

        assert!(store.compare_and_swap("k", None, b"a".to_vec(), None).await.unwrap());
        // Key now exists, so "must be absent" fails.
        assert!(!store.compare_and_swap("k", None, b"b".to_vec(), None).await.unwrap());

        let current = store.get("k").await.unwrap().unwrap();
        assert!(store
            .compare_and_swap("k", Some(current.version), b"c".to_vec(), None)
            .await
            .unwrap());
        // Stale version loses.
        assert!(!store
            .compare_and_swap("k", Some(current.version), b"d".to_vec(), None)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"c");
    }

    #[tokio::test]
    async fn test_delete_reports_live_removal() {
        let (store, _) = store_with_clock(0);
        store.set("k", b"v".to_vec(), None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized_per_key() {
        let (store, _) = store_with_clock(0);
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update("counter", &mut |current| {
                        let n: u64 = current
                            .map(|b| String::from_utf8_lossy(b).parse().unwrap_or(0))
                            .unwrap_or(0);
                        Mutation::Put {
                            value: (n + 1).to_string().into_bytes(),
                            ttl: None,
                        }
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let value = store.get("counter").await.unwrap().unwrap().value;
        assert_eq!(value, b"50");
    }

    #[tokio::test]
    async fn test_lru_bound_evicts_oldest() {
        let (store, _) = store_with_clock(10);
        for i in 0..10 {
            store.set(&format!("k{i}"), vec![i], None).await.unwrap();
        }
        // Refresh k0 so k1 becomes the oldest.
        store.get("k0").await.unwrap();
        store.set("k10", vec![10], None).await.unwrap();

        assert!(store.slots.len() <= 10);
        assert!(store.get("k0").await.unwrap().is_some());
        assert!(store.get("k1").await.unwrap().is_none());
        assert!(store.get("k10").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_persistence() {
        let path = std::env::temp_dir().join(format!("bulwark-store-{}.json", uuid::Uuid::new_v4()));
        let clock = ManualClock::new(5_000);

        let store =
            MemoryStore::with_persistence(Arc::new(clock.clone()), 0, &path).unwrap();
        store.set("keep", b"v".to_vec(), None).await.unwrap();
        store
            .set("short", b"x".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(store.save_to_file().unwrap(), 2);

        clock.advance(Duration::from_millis(20));
        let loaded = MemoryStore::with_persistence(Arc::new(clock), 0, &path).unwrap();
        assert_eq!(loaded.get("keep").await.unwrap().unwrap().value, b"v");
        assert!(loaded.get("short").await.unwrap().is_none());

        std::fs::remove_file(&path).unwrap_or_default();
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_task_saves_on_shutdown() {
        let path = std::env::temp_dir().join(format!("bulwark-store-{}.json", uuid::Uuid::new_v4()));
        let clock = ManualClock::new(0);
        let store = Arc::new(
            MemoryStore::with_persistence(Arc::new(clock.clone()), 0, &path).unwrap(),
        );
        let (tx, rx) = broadcast::channel(1);
        let handle = spawn_snapshot_task(Arc::clone(&store), Duration::from_secs(30), rx);

        store.set("cb:orders", b"open".to_vec(), None).await.unwrap();
        tx.send(()).unwrap();
        handle.await.unwrap();

        let restored = MemoryStore::with_persistence(Arc::new(clock), 0, &path).unwrap();
        assert_eq!(restored.get("cb:orders").await.unwrap().unwrap().value, b"open");

        std::fs::remove_file(&path).unwrap_or_default();
    }
}
