//! Response cache subsystem.
//!
//! # Data Flow
//! ```text
//! get_or_set(policy, deadline, compute):
//!     → KeyStore "cache:<key>" fresh? → hit, return
//!     → miss: join or create the in-process flight for <key>
//!         leader task:
//!             → re-check the store (an earlier leader may have filled it)
//!             → shared backend: lease.rs races other nodes for "lease:<key>"
//!             → compute → store entry (ttl + stale retention) → wake waiters
//!         every caller waits on the flight, bounded by its own deadline
//! ```
//!
//! # Design Decisions
//! - The compute runs in a detached task; waiter cancellation never cancels it
//! - Failed computes store nothing and the error is shared with all waiters
//! - Expired entries are retained for `stale_ttl` so fallback can serve last-known-good
//! - Backend failures degrade to computing without storing

pub mod lease;
pub mod response;

pub use response::{CacheEntry, Lookup, ResponseCache};
