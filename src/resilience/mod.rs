//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to dependency:
//!     → circuit_breaker.rs (reject fast while open, single probe while half-open)
//!     → timeouts.rs (caller deadline, per-attempt timeout)
//!     → On failure: classify.rs (retryable or final)
//!         → retries.rs (backoff.rs full-jitter delay, then retry)
//!         → circuit_breaker.rs (window.rs counts outcomes, opens on failure ratio)
//!     → On exhaustion: fallback.rs (last-known-good, static value, degraded marker)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every wait is bounded by the caller's deadline
//! - Classification decides retries; downstream errors are never reinterpreted otherwise
//! - Circuit breaker prevents cascading failures and is consulted before every attempt
//! - The breaker never invokes the guarded function; it only admits and records

pub mod backoff;
pub mod circuit_breaker;
pub mod classify;
pub mod fallback;
pub mod retries;
pub mod timeouts;
pub mod window;

pub use circuit_breaker::{Admission, BreakerSnapshot, BreakerStatus, CircuitBreaker};
pub use classify::{CallError, Classifier, ErrorClass};
pub use fallback::FallbackChain;
pub use retries::{RetryContext, RetryExecutor};
pub use timeouts::Deadline;
