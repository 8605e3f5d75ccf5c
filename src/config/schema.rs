//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the resilience layer.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::resilience::classify::Classifier;

/// Root configuration for the resilience layer.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Coordination backend settings.
    pub store: StoreConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,

    /// Diagnostics surface.
    pub admin: AdminConfig,

    /// Values applied when a call does not supply its own.
    pub defaults: DefaultsConfig,

    /// Guarded call sites by name.
    pub sites: BTreeMap<String, CallPolicy>,
}

impl ResilienceConfig {
    /// Give policies without an explicit key the name of their site.
    pub fn apply_site_names(&mut self) {
        for (name, site) in &mut self.sites {
            for limit in &mut site.rate_limit {
                if limit.key.is_empty() {
                    limit.key = format!("site:{name}");
                }
            }
            if let Some(circuit) = &mut site.circuit {
                if circuit.key.is_empty() {
                    circuit.key = format!("site:{name}");
                }
            }
            if let Some(cache) = &mut site.cache {
                if cache.key.is_empty() {
                    cache.key = format!("site:{name}");
                }
            }
        }
    }
}

/// Which coordination backend holds shared state.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process map; single node.
    #[default]
    Memory,
    /// External Redis; multi node.
    Redis,
}

/// Coordination backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Backend URL (e.g., "redis://127.0.0.1:6379"). Required for redis.
    pub url: Option<String>,

    /// Prefix applied to every key in an external backend.
    pub key_prefix: String,

    /// LRU bound on in-process entries (0 = unbounded).
    pub max_entries: usize,

    /// Snapshot file for in-process state. Unset means state dies with the process.
    pub persistence_path: Option<PathBuf>,

    /// Seconds between snapshots.
    pub snapshot_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            key_prefix: "bulwark:".to_string(),
            max_entries: 100_000,
            persistence_path: None,
            snapshot_interval_secs: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9100".to_string(),
        }
    }
}

/// Admin surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin surface.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: Option<String>,

    /// Admin bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Call defaults.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Deadline for calls that do not bring their own (0 = none).
    pub deadline_ms: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self { deadline_ms: 30_000 }
    }
}

/// Policy for one guarded call site. Every mechanism is optional.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct CallPolicy {
    /// Buckets checked in series; the first denial wins.
    #[serde(deserialize_with = "one_or_many")]
    pub rate_limit: Vec<RateLimitPolicy>,

    pub circuit: Option<CircuitPolicy>,

    pub retry: Option<RetryPolicy>,

    pub cache: Option<CachePolicy>,

    /// Strategies tried in order once the primary path fails.
    pub fallback: Vec<FallbackStrategy>,

    /// Error codes that propagate without consulting the fallback chain.
    pub fallback_bypass: Vec<String>,
}

impl CallPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit.push(policy);
        self
    }

    pub fn with_circuit(mut self, policy: CircuitPolicy) -> Self {
        self.circuit = Some(policy);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    pub fn with_fallback(mut self, strategy: FallbackStrategy) -> Self {
        self.fallback.push(strategy);
        self
    }

    pub fn bypass_fallback_for(mut self, code: impl Into<String>) -> Self {
        self.fallback_bypass.push(code.into());
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(items) => items,
        OneOrMany::One(item) => vec![item],
    })
}

/// Token bucket policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub key: String,

    /// Maximum tokens (burst size).
    pub capacity: u32,

    /// Tokens added per second.
    pub refill_rate: f64,

    /// Tokens deducted per call.
    pub cost: u32,

    /// Admit when the backend is unreachable.
    pub fail_open: bool,

    /// Sleep until tokens are available instead of rejecting.
    pub wait: bool,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            key: String::new(),
            capacity: 100,
            refill_rate: 10.0,
            cost: 1,
            fail_open: false,
            wait: false,
        }
    }
}

impl RateLimitPolicy {
    pub fn new(key: impl Into<String>, capacity: u32, refill_rate: f64) -> Self {
        Self {
            key: key.into(),
            capacity,
            refill_rate,
            ..Self::default()
        }
    }

    /// Time for an empty bucket to refill completely.
    pub fn full_refill(&self) -> Duration {
        if self.refill_rate > 0.0 {
            Duration::try_from_secs_f64(f64::from(self.capacity) / self.refill_rate)
                .unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }
}

/// Circuit breaker policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CircuitPolicy {
    pub key: String,

    /// Failure ratio in (0, 1] that opens the circuit.
    pub threshold: f64,

    /// Samples required in the window before the ratio is evaluated.
    pub minimum_samples: u32,

    /// Time spent open before a probe is allowed.
    pub open_duration_ms: u64,

    /// Sliding window length.
    pub window_ms: u64,

    /// Admit when the backend is unreachable.
    pub fail_open: bool,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            key: String::new(),
            threshold: 0.5,
            minimum_samples: 10,
            open_duration_ms: 30_000,
            window_ms: 60_000,
            fail_open: true,
        }
    }
}

impl CircuitPolicy {
    pub fn new(key: impl Into<String>, threshold: f64, minimum_samples: u32) -> Self {
        Self {
            key: key.into(),
            threshold,
            minimum_samples,
            ..Self::default()
        }
    }

    pub fn with_open_duration(mut self, open_duration: Duration) -> Self {
        self.open_duration_ms = crate::store::clock::millis(open_duration);
        self
    }

    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Retry policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,

    pub base_delay_ms: u64,

    pub max_delay_ms: u64,

    /// Timeout for each individual attempt.
    pub attempt_timeout_ms: Option<u64>,

    pub classifier: Classifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            attempt_timeout_ms: None,
            classifier: Classifier::Default,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: crate::store::clock::millis(base_delay),
            max_delay_ms: crate::store::clock::millis(max_delay),
            ..Self::default()
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = Some(crate::store::clock::millis(timeout));
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }
}

/// Response cache policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CachePolicy {
    pub key: String,

    /// Freshness lifetime of an entry.
    pub ttl_ms: u64,

    /// How long an expired entry is retained for last-known-good fallback.
    pub stale_ttl_ms: u64,

    /// Cross-node compute lease, used with a shared backend.
    pub lease_ms: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            key: String::new(),
            ttl_ms: 60_000,
            stale_ttl_ms: 86_400_000,
            lease_ms: 10_000,
        }
    }
}

impl CachePolicy {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl_ms: crate::store::clock::millis(ttl),
            ..Self::default()
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn stale_ttl(&self) -> Duration {
        Duration::from_millis(self.stale_ttl_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

/// One degradation strategy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Serve the most recent cached value, ignoring its TTL.
    LastKnownGood,
    /// Serve a configured value.
    Static { value: serde_json::Value },
    /// Answer with the reduced-functionality marker.
    Degraded,
}

impl FallbackStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            FallbackStrategy::LastKnownGood => "last_known_good",
            FallbackStrategy::Static { .. } => "static",
            FallbackStrategy::Degraded => "degraded",
        }
    }
}
