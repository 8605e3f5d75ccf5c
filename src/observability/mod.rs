//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! RateLimiter / CircuitBreaker / RetryExecutor / ResponseCache / FallbackChain
//!     → events.rs (Event { name, key, mechanism, outcome, elapsed })
//!     → EventSink
//!         → TracingSink: tracing event + metrics.rs counters/histograms
//!         → MemorySink: in-memory record (tests, diagnostics)
//!
//! Process setup:
//!     → logging.rs (tracing-subscriber, pretty or JSON)
//!     → metrics.rs (Prometheus exporter)
//! ```
//!
//! # Design Decisions
//! - The sink is injected at construction, never a global
//! - Metric labels carry event/mechanism/outcome only; keys stay in logs to bound cardinality
//! - Logger initialisation is idempotent so tests and embedders can both call it

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{Event, EventSink, Mechanism, MemorySink, TracingSink};
