//! Admission control subsystem.
//!
//! # Data Flow
//! ```text
//! Guarded call:
//!     → rate_limit.rs (one bucket per policy key, checked in series)
//!         → KeyStore::update on "rl:<key>" (refill + deduct, exclusive per key)
//!         → bucket.rs (pure token arithmetic)
//!     → Decision { allowed, retry_after, remaining }
//! ```
//!
//! # Design Decisions
//! - Refill is lazy: computed from `last_refill` on access, no background timers
//! - Denials do not write; only successful deductions touch the store
//! - Fail closed on backend errors unless a policy opts into `fail_open`

pub mod bucket;
pub mod rate_limit;

pub use bucket::{Decision, TokenBucket};
pub use rate_limit::{RateLimitStatus, RateLimiter};
