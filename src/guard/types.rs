//! Guarded-call error taxonomy and result provenance.

use std::time::Duration;

use thiserror::Error;

use crate::resilience::classify::CallError;
use crate::store::StoreError;

/// Terminal failure of a guarded call.
///
/// Resilience-layer faults (`BackendUnavailable`, `InvalidPolicy`) are kept apart
/// from dependency faults so operators can tell a misconfigured layer from a down
/// dependency; see [`GuardError::is_internal`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GuardError {
    #[error("rate limit exceeded for {key}, retry after {}ms", retry_after.as_millis())]
    RateLimitExceeded { key: String, retry_after: Duration },

    #[error("circuit open for {key} since {opened_at}")]
    CircuitOpen { key: String, opened_at: u64 },

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { last_error: CallError, attempts: u32 },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("coordination backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("all fallback strategies failed: {original}")]
    FallbackExhausted { original: Box<GuardError> },

    #[error("dependency call failed: {0}")]
    Downstream(CallError),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

impl GuardError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            GuardError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GuardError::CircuitOpen { .. } => "circuit_open",
            GuardError::RetryExhausted { .. } => "retry_exhausted",
            GuardError::DeadlineExceeded => "deadline_exceeded",
            GuardError::BackendUnavailable(_) => "backend_unavailable",
            GuardError::FallbackExhausted { .. } => "fallback_exhausted",
            GuardError::Downstream(_) => "upstream_error",
            GuardError::InvalidPolicy(_) => "invalid_policy",
        }
    }

    /// HTTP status a caller-facing edge should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            GuardError::RateLimitExceeded { .. } => 429,
            GuardError::CircuitOpen { .. } | GuardError::BackendUnavailable(_) => 503,
            GuardError::RetryExhausted { last_error, .. } => {
                if last_error.is_timeout() {
                    504
                } else {
                    502
                }
            }
            GuardError::DeadlineExceeded => 504,
            GuardError::FallbackExhausted { original } => original.status_code(),
            GuardError::Downstream(err) => match err {
                CallError::Status { code, .. } if (400..500).contains(code) => *code,
                CallError::Validation(_) => 422,
                CallError::Timeout => 504,
                _ => 502,
            },
            GuardError::InvalidPolicy(_) => 500,
        }
    }

    /// True for faults of the resilience layer itself rather than the dependency.
    pub fn is_internal(&self) -> bool {
        match self {
            GuardError::BackendUnavailable(_) | GuardError::InvalidPolicy(_) => true,
            GuardError::FallbackExhausted { original } => original.is_internal(),
            _ => false,
        }
    }

    /// How long the caller should wait before trying again, when known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GuardError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            GuardError::FallbackExhausted { original } => original.retry_after(),
            _ => None,
        }
    }
}

impl From<StoreError> for GuardError {
    fn from(err: StoreError) -> Self {
        GuardError::BackendUnavailable(err.to_string())
    }
}

/// Where a successful guarded result came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// Computed by the dependency during this call (or a deduplicated peer call).
    Fresh(T),
    /// Served from a live cache entry.
    Cached(T),
    /// Produced by a fallback strategy after the primary path failed.
    Fallback { strategy: &'static str, value: T },
    /// Reduced-functionality marker: no value is available.
    Degraded,
}

impl<T> Outcome<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Fresh(v) | Outcome::Cached(v) | Outcome::Fallback { value: v, .. } => Some(v),
            Outcome::Degraded => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Fresh(v) | Outcome::Cached(v) | Outcome::Fallback { value: v, .. } => Some(v),
            Outcome::Degraded => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Outcome::Fresh(_))
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded)
    }

    /// Short label for logs and headers.
    pub fn source(&self) -> &'static str {
        match self {
            Outcome::Fresh(_) => "fresh",
            Outcome::Cached(_) => "cached",
            Outcome::Fallback { strategy, .. } => strategy,
            Outcome::Degraded => "degraded",
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Fresh(v) => Outcome::Fresh(f(v)),
            Outcome::Cached(v) => Outcome::Cached(f(v)),
            Outcome::Fallback { strategy, value } => Outcome::Fallback {
                strategy,
                value: f(value),
            },
            Outcome::Degraded => Outcome::Degraded,
        }
    }
}
