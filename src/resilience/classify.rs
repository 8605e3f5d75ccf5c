//! Downstream call errors and their retry classification.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a guarded call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallError {
    #[error("call timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("dependency returned status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("request rejected as invalid: {0}")]
    Validation(String),

    #[error("{0}")]
    Other(String),
}

impl CallError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout)
    }

    /// The dependency answered and rejected the request itself.
    pub fn is_client_error(&self) -> bool {
        match self {
            CallError::Validation(_) => true,
            CallError::Status { code, .. } => (400..500).contains(code),
            CallError::Timeout | CallError::Connection(_) | CallError::Other(_) => false,
        }
    }
}

/// Retry classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Caller-supplied classification function.
pub type ClassifyFn = Arc<dyn Fn(&CallError) -> ErrorClass + Send + Sync>;

/// Error classifier used by the retry executor.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classifier {
    /// 4xx and validation errors are final; timeouts, connection errors, 5xx and
    /// anything unrecognised are retried.
    #[default]
    Default,
    /// Retry every failure.
    Always,
    /// Never retry.
    Never,
    /// Programmatic classifier; cannot be expressed in a config file.
    #[serde(skip)]
    Custom(ClassifyFn),
}

impl Classifier {
    pub fn custom(f: impl Fn(&CallError) -> ErrorClass + Send + Sync + 'static) -> Self {
        Classifier::Custom(Arc::new(f))
    }

    pub fn classify(&self, error: &CallError) -> ErrorClass {
        match self {
            Classifier::Default => default_class(error),
            Classifier::Always => ErrorClass::Retryable,
            Classifier::Never => ErrorClass::NonRetryable,
            Classifier::Custom(f) => f(error),
        }
    }
}

fn default_class(error: &CallError) -> ErrorClass {
    if error.is_client_error() {
        ErrorClass::NonRetryable
    } else {
        ErrorClass::Retryable
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classifier::Default => f.write_str("Default"),
            Classifier::Always => f.write_str("Always"),
            Classifier::Never => f.write_str("Never"),
            Classifier::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl PartialEq for Classifier {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Classifier::Default, Classifier::Default)
            | (Classifier::Always, Classifier::Always)
            | (Classifier::Never, Classifier::Never) => true,
            (Classifier::Custom(a), Classifier::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
