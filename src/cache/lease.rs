//! Cross-node compute lease for shared backends.
//!
//! In-process single-flight already limits computes to one per key per process.
//! With a shared store, nodes race for a short-lived `lease:<key>` record via
//! compare-and-swap; losers poll for the winner's entry instead of computing.
//! The lease expires on its own, so a crashed holder only delays the others.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::config::schema::CachePolicy;
use crate::store::{KeyStore, StoreResult};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn lease_key(key: &str) -> String {
    format!("lease:{key}")
}

/// Result of trying to become the computing node.
#[derive(Debug)]
pub enum LeaseOutcome {
    /// This node holds the lease and should compute.
    Acquired(Lease),
    /// Another node's result became available while waiting.
    Filled,
    /// Could not coordinate (backend error or lease never resolved); compute anyway.
    Unavailable,
}

/// A held lease. Release it once the entry is written.
#[derive(Debug)]
pub struct Lease {
    key: String,
    token: String,
}

impl Lease {
    /// Release the lease if this node still holds it.
    pub async fn release(self, store: &Arc<dyn KeyStore>) {
        let result: StoreResult<()> = async {
            if let Some(current) = store.get(&self.key).await? {
                if current.value == self.token.as_bytes() {
                    store.delete(&self.key).await?;
                }
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::debug!(key = %self.key, error = %e, "Failed to release cache lease");
        }
    }
}

/// Acquire the lease for `key`, or wait until `is_filled` reports that another
/// node has stored a fresh entry.
pub async fn acquire<F, Fut>(
    store: &Arc<dyn KeyStore>,
    key: &str,
    policy: &CachePolicy,
    mut is_filled: F,
) -> LeaseOutcome
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let lease_key = lease_key(key);
    let token = Uuid::new_v4().to_string();
    let give_up = Instant::now() + policy.lease() * 2;

    loop {
        match store
            .compare_and_swap(&lease_key, None, token.as_bytes().to_vec(), Some(policy.lease()))
            .await
        {
            Ok(true) => {
                return LeaseOutcome::Acquired(Lease {
                    key: lease_key,
                    token,
                })
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache lease unavailable, computing locally");
                return LeaseOutcome::Unavailable;
            }
        }

        if Instant::now() >= give_up {
            tracing::warn!(key = %key, "Cache lease never resolved, computing locally");
            return LeaseOutcome::Unavailable;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
        if is_filled().await {
            return LeaseOutcome::Filled;
        }
    }
}
