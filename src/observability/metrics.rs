//! Metrics collection and exposition.
//!
//! # Metrics
//! - `bulwark_events_total` (counter): resilience events by event, mechanism, outcome
//! - `bulwark_event_duration_seconds` (histogram): time spent in the operation that emitted the event
//! - `bulwark_breaker_state` (gauge): 0=closed, 1=half-open, 2=open, per breaker key
//! - `bulwark_inflight_computes` (gauge): cache computes currently running in this process

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::observability::events::Event;
use crate::resilience::circuit_breaker::BreakerStatus;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record one resilience event.
pub fn record_event(event: &Event) {
    metrics::counter!(
        "bulwark_events_total",
        "event" => event.name,
        "mechanism" => event.mechanism.as_str(),
        "outcome" => event.outcome,
    )
    .increment(1);
    metrics::histogram!(
        "bulwark_event_duration_seconds",
        "event" => event.name,
        "mechanism" => event.mechanism.as_str(),
    )
    .record(event.elapsed.as_secs_f64());
}

/// Record the current state of a breaker.
pub fn record_breaker_state(key: &str, status: BreakerStatus) {
    let value = match status {
        BreakerStatus::Closed => 0.0,
        BreakerStatus::HalfOpen => 1.0,
        BreakerStatus::Open => 2.0,
    };
    metrics::gauge!("bulwark_breaker_state", "key" => key.to_string()).set(value);
}

/// Record how many cache computes are in flight.
pub fn record_inflight(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!("bulwark_inflight_computes").set(count as f64);
}
