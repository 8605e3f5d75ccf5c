//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacity > 0, threshold in (0, 1], delays ordered)
//! - Check backend selection is complete (redis needs a parsable URL)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ResilienceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system, including on hot reload

use thiserror::Error;

use crate::config::schema::{
    CachePolicy, CallPolicy, CircuitPolicy, FallbackStrategy, RateLimitPolicy, ResilienceConfig,
    RetryPolicy, StoreBackend,
};

/// One semantic problem, located by a dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Validate a whole configuration.
pub fn validate_config(config: &ResilienceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.store.backend == StoreBackend::Redis {
        match config.store.url.as_deref() {
            None | Some("") => errors.push(ValidationError::new(
                "store.url",
                "required when backend is redis",
            )),
            Some(raw) => {
                if let Err(e) = url::Url::parse(raw) {
                    errors.push(ValidationError::new("store.url", format!("invalid URL: {e}")));
                }
            }
        }
    }
    if config.store.persistence_path.is_some() && config.store.snapshot_interval_secs == 0 {
        errors.push(ValidationError::new(
            "store.snapshot_interval_secs",
            "must be greater than zero when persistence is enabled",
        ));
    }
    if config.admin.enabled {
        if let Err(e) = config.admin.bind_address.parse::<std::net::SocketAddr>() {
            errors.push(ValidationError::new("admin.bind_address", e.to_string()));
        }
    }
    if config.observability.metrics_enabled {
        if let Err(e) = config.observability.metrics_address.parse::<std::net::SocketAddr>() {
            errors.push(ValidationError::new("observability.metrics_address", e.to_string()));
        }
    }

    for (name, site) in &config.sites {
        collect_policy_errors(&format!("sites.{name}"), site, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a single call policy, e.g. one built in code.
pub fn validate_policy(policy: &CallPolicy) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    collect_policy_errors("policy", policy, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn collect_policy_errors(path: &str, policy: &CallPolicy, errors: &mut Vec<ValidationError>) {
    for (i, limit) in policy.rate_limit.iter().enumerate() {
        check_rate_limit(&format!("{path}.rate_limit[{i}]"), limit, errors);
    }
    if let Some(circuit) = &policy.circuit {
        check_circuit(&format!("{path}.circuit"), circuit, errors);
    }
    if let Some(retry) = &policy.retry {
        check_retry(&format!("{path}.retry"), retry, errors);
    }
    if let Some(cache) = &policy.cache {
        check_cache(&format!("{path}.cache"), cache, errors);
    }
    for (i, strategy) in policy.fallback.iter().enumerate() {
        if let FallbackStrategy::Static { value } = strategy {
            if value.is_null() {
                errors.push(ValidationError::new(
                    format!("{path}.fallback[{i}].value"),
                    "static fallback needs a value",
                ));
            }
        }
    }
}

fn check_rate_limit(path: &str, policy: &RateLimitPolicy, errors: &mut Vec<ValidationError>) {
    if policy.key.is_empty() {
        errors.push(ValidationError::new(format!("{path}.key"), "must not be empty"));
    }
    if policy.capacity == 0 {
        errors.push(ValidationError::new(format!("{path}.capacity"), "must be greater than zero"));
    }
    if !(policy.refill_rate.is_finite() && policy.refill_rate > 0.0) {
        errors.push(ValidationError::new(
            format!("{path}.refill_rate"),
            "must be a positive number",
        ));
    }
    if policy.cost == 0 {
        errors.push(ValidationError::new(format!("{path}.cost"), "must be greater than zero"));
    } else if policy.cost > policy.capacity {
        errors.push(ValidationError::new(
            format!("{path}.cost"),
            "exceeds capacity; no call could ever be admitted",
        ));
    }
}

fn check_circuit(path: &str, policy: &CircuitPolicy, errors: &mut Vec<ValidationError>) {
    if policy.key.is_empty() {
        errors.push(ValidationError::new(format!("{path}.key"), "must not be empty"));
    }
    if !(policy.threshold > 0.0 && policy.threshold <= 1.0) {
        errors.push(ValidationError::new(
            format!("{path}.threshold"),
            "must be in (0, 1]",
        ));
    }
    if policy.minimum_samples == 0 {
        errors.push(ValidationError::new(
            format!("{path}.minimum_samples"),
            "must be greater than zero",
        ));
    }
    if policy.open_duration_ms == 0 {
        errors.push(ValidationError::new(
            format!("{path}.open_duration_ms"),
            "must be greater than zero",
        ));
    }
    if policy.window_ms == 0 {
        errors.push(ValidationError::new(format!("{path}.window_ms"), "must be greater than zero"));
    }
}

fn check_retry(path: &str, policy: &RetryPolicy, errors: &mut Vec<ValidationError>) {
    if policy.max_attempts == 0 {
        errors.push(ValidationError::new(
            format!("{path}.max_attempts"),
            "must allow at least one attempt",
        ));
    }
    if policy.base_delay_ms > policy.max_delay_ms {
        errors.push(ValidationError::new(
            format!("{path}.base_delay_ms"),
            "must not exceed max_delay_ms",
        ));
    }
    if policy.attempt_timeout_ms == Some(0) {
        errors.push(ValidationError::new(
            format!("{path}.attempt_timeout_ms"),
            "must be greater than zero when set",
        ));
    }
}

fn check_cache(path: &str, policy: &CachePolicy, errors: &mut Vec<ValidationError>) {
    if policy.key.is_empty() {
        errors.push(ValidationError::new(format!("{path}.key"), "must not be empty"));
    }
    if policy.ttl_ms == 0 {
        errors.push(ValidationError::new(format!("{path}.ttl_ms"), "must be greater than zero"));
    }
    if policy.lease_ms == 0 {
        errors.push(ValidationError::new(format!("{path}.lease_ms"), "must be greater than zero"));
    }
}
