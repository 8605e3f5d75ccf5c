//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → Logging/metrics → Key store (+ snapshot task) → Guard
//!         → Config watcher (hot reload of site policies) → Admin listener
//!
//! Shutdown (shutdown.rs):
//!     Signal or Runtime::shutdown → broadcast → tasks finish → final snapshot
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then store, then guard, then listeners
//! - Shutdown has a timeout: stuck tasks are aborted at the deadline

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{build_store, start, Runtime, StartupError};
