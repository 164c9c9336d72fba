//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method and status
//! - `proxy_request_duration_seconds` (histogram): latency to response head
//! - `cache_lookups_total` (counter): cache lookups by outcome (hit, miss)
//! - `cache_writes_total` (counter): commits by result (ok, error, skipped)
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests need no setup
//! - Prometheus exporter serves its own HTTP listener

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus recorder and start its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a proxied request.
pub fn record_request(method: &str, status: u16, start: Instant) {
    let method = method.to_string();
    let status = status.to_string();
    counter!("proxy_requests_total", "method" => method.clone(), "status" => status.clone())
        .increment(1);
    histogram!("proxy_request_duration_seconds", "method" => method, "status" => status)
        .record(start.elapsed().as_secs_f64());
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    Hit,
    Miss,
}

/// Record a cache lookup.
pub fn record_cache_lookup(outcome: LookupOutcome) {
    let outcome = match outcome {
        LookupOutcome::Hit => "hit",
        LookupOutcome::Miss => "miss",
    };
    counter!("cache_lookups_total", "outcome" => outcome).increment(1);
}

/// Result of a cache commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Ok,
    Error,
    Skipped,
}

/// Record a cache commit attempt.
pub fn record_cache_write(result: WriteResult) {
    let result = match result {
        WriteResult::Ok => "ok",
        WriteResult::Error => "error",
        WriteResult::Skipped => "skipped",
    };
    counter!("cache_writes_total", "result" => result).increment(1);
}
