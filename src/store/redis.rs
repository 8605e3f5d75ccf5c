//! External key store backed by Redis, for multi-node deployments.
//!
//! Each key is a hash with a `v` (value) field and a `ver` (version) field.
//! Versions are drawn from one `INCR` counter per prefix inside a Lua script, so
//! compare-and-swap is a single atomic round trip and a key that is deleted and
//! recreated never reuses an earlier version.

use std::time::Duration;

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use ::redis::Script;

use super::clock::millis;
use super::{KeyStore, StoreError, StoreResult, Versioned};

const SET_SCRIPT: &str = r"
local ver = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'v', ARGV[1], 'ver', ver)
if tonumber(ARGV[2]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  redis.call('PERSIST', KEYS[1])
end
return ver
";

const CAS_SCRIPT: &str = r"
local cur = redis.call('HGET', KEYS[1], 'ver')
if ARGV[3] == '' then
  if cur then return 0 end
elseif cur ~= ARGV[3] then
  return 0
end
local ver = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'v', ARGV[1], 'ver', ver)
if tonumber(ARGV[2]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  redis.call('PERSIST', KEYS[1])
end
return 1
";

/// Suffix of the per-prefix version counter.
const VERSION_COUNTER: &str = "__version";

fn unavailable(e: ::redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn ttl_arg(ttl: Option<Duration>) -> u64 {
    ttl.map_or(0, |t| millis(t).max(1))
}

/// Redis-backed [`KeyStore`].
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    set_script: Script,
    cas_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url`, namespacing every key with `prefix`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> StoreResult<Self> {
        let client = ::redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        let prefix = prefix.into();
        tracing::info!(prefix = %prefix, "Connected to Redis coordination backend");
        Ok(Self {
            conn,
            prefix,
            set_script: Script::new(SET_SCRIPT),
            cas_script: Script::new(CAS_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn version_key(&self) -> String {
        self.key(VERSION_COUNTER)
    }
}

#[async_trait]
impl KeyStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        let mut conn = self.conn.clone();
        let (value, version): (Option<Vec<u8>>, Option<u64>) = ::redis::cmd("HMGET")
            .arg(self.key(key))
            .arg("v")
            .arg("ver")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(match (value, version) {
            (Some(value), Some(version)) => Some(Versioned { value, version }),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _version: u64 = self
            .set_script
            .key(self.key(key))
            .key(self.version_key())
            .arg(value)
            .arg(ttl_arg(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let expected = expected.map(|v| v.to_string()).unwrap_or_default();
        let swapped: i64 = self
            .cas_script
            .key(self.key(key))
            .key(self.version_key())
            .arg(value)
            .arg(ttl_arg(ttl))
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = ::redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(removed > 0)
    }

    fn is_shared(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_draw_versions_from_the_shared_counter() {
        for script in [SET_SCRIPT, CAS_SCRIPT] {
            assert!(script.contains("redis.call('INCR', KEYS[2])"));
            assert!(!script.contains("HINCRBY"));
        }
    }

    /// Needs a live server: `BULWARK_TEST_REDIS_URL=redis://127.0.0.1:6379 cargo test --features redis -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_recreated_key_rejects_stale_version() {
        let url = std::env::var("BULWARK_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let prefix = format!("bulwark-test-{}:", uuid::Uuid::new_v4());
        let store = RedisStore::connect(&url, prefix).await.unwrap();

        store.set("k", b"a".to_vec(), None).await.unwrap();
        let stale = store.get("k").await.unwrap().unwrap().version;
        assert!(store.delete("k").await.unwrap());
        store.set("k", b"b".to_vec(), None).await.unwrap();

        let current = store.get("k").await.unwrap().unwrap().version;
        assert!(current > stale);
        assert!(!store
            .compare_and_swap("k", Some(stale), b"c".to_vec(), None)
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("k", Some(current), b"c".to_vec(), None)
            .await
            .unwrap());

        store.delete("k").await.unwrap();
        store.delete(VERSION_COUNTER).await.unwrap();
    }
}
