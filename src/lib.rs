//! Bulwark: a resilience control layer for calls to unreliable dependencies.
//!
//! # Architecture Overview
//!
//! ```text
//!     Caller
//!       │  Guard::execute(policy, deadline, call)
//!       ▼
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │ guard        admission ─▶ cache ─▶ circuit breaker + retries  │
//!  │                 │           │              │                 │
//!  │                 │           │              ▼                 │
//!  │                 │           │          fallback              │
//!  │                 ▼           ▼              ▼                 │
//!  │              ┌──────────────────────────────────┐            │
//!  │              │ store (memory | redis) + clock   │            │
//!  │              └──────────────────────────────────┘            │
//!  │                                                              │
//!  │  Cross-cutting: config, observability, admin, lifecycle      │
//!  └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All mechanism state lives in a [`store::KeyStore`], so nodes sharing an
//! external store share rate-limit budgets, breaker state and cache entries.

// Coordination state
pub mod store;

// Mechanisms
pub mod admission;
pub mod cache;
pub mod resilience;

// Composition
pub mod guard;

// Cross-cutting concerns
pub mod admin;
pub mod config;
pub mod lifecycle;
pub mod observability;

pub use config::schema::{CallPolicy, ResilienceConfig};
pub use guard::{Guard, GuardError, GuardLayer, Outcome};
pub use lifecycle::{Runtime, Shutdown};
pub use resilience::{CallError, Deadline};
