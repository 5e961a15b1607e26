//! Metrics collection and exposition.
//!
//! # Metrics
//! - `http_requests_total` (counter): requests by method, status
//! - `http_request_duration_seconds` (histogram): latency distribution
//! - `rate_limited_total` (counter): denials by limiter name
//! - `http_cache_total` (counter): cache outcomes (HIT, MISS, UNMODIFIED)
//! - `socket_connections_active` (gauge): live WebSocket connections
//! - `session_refresh_total` (counter): refreshes by outcome
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed, so tests and
//!   library users pay nothing
//! - Prometheus scrape endpoint is served by the exporter's own listener

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("http_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_rate_limited(limiter: &str) {
    metrics::counter!("rate_limited_total", "limiter" => limiter.to_string()).increment(1);
}

pub fn record_cache(status: &'static str) {
    metrics::counter!("http_cache_total", "status" => status).increment(1);
}

pub fn socket_opened() {
    metrics::gauge!("socket_connections_active").increment(1.0);
}

pub fn socket_closed() {
    metrics::gauge!("socket_connections_active").decrement(1.0);
}

pub fn record_session_refresh(ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    metrics::counter!("session_refresh_total", "outcome" => outcome).increment(1);
}
