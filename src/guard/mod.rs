//! Guarded calls.
//!
//! # Data Flow
//! ```text
//! Guard::execute(policy, deadline, call):
//!     → admission (every rate limit on the policy, first denial wins)
//!     → cache (fresh hit returns; misses share one computation)
//!     → circuit breaker + retries (per attempt)
//!     → On failure: fallback chain
//!     → Outcome { Fresh | Cached | Fallback | Degraded } or GuardError
//! ```
//!
//! `layer.rs` wraps any tower service in the same pipeline; `response.rs` maps
//! [`GuardError`] onto HTTP responses.

pub mod layer;
pub mod pipeline;
pub mod response;
pub mod types;

pub use layer::{GuardLayer, GuardService};
pub use pipeline::{Guard, GuardBuilder};
pub use types::{GuardError, Outcome};
