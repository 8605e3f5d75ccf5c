//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize, fill policy keys from site names)
//!     → validation.rs (semantic checks)
//!     → ResilienceConfig (validated, immutable)
//!     → store backend chosen once, site policies handed to the Guard
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → Guard swaps its site table atomically (ArcSwap)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Hot reload only replaces site policies; the store backend is fixed for the process

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    CachePolicy, CallPolicy, CircuitPolicy, FallbackStrategy, RateLimitPolicy, ResilienceConfig,
    RetryPolicy, StoreBackend,
};
pub use validation::{validate_config, validate_policy, ValidationError};
