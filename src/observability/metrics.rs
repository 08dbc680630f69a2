//! Metrics collection and exposition.
//!
//! # Metrics
//! - `engine_connections_total{kind}` (counter)
//! - `engine_connections_closed_total{reason}` (counter)
//! - `engine_mpx_handshakes_total{outcome}` (counter)
//! - `engine_mpx_channel_events_total{event}` (counter)
//! - `engine_pool_exhausted_total{pool}` (counter)
//! - `engine_handlers_in_use{pool}` (gauge)
//! - `engine_buffer_outstanding_bytes` (gauge)
//!
//! Without an installed recorder every call is a no-op.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(target: "program_flow", address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(
            target: "exceptions",
            address = %addr,
            error = %e,
            "Failed to install metrics exporter"
        ),
    }
}

pub fn record_connection_opened(kind: &'static str) {
    ::metrics::counter!("engine_connections_total", "kind" => kind).increment(1);
}

pub fn record_connection_closed(reason: &'static str) {
    ::metrics::counter!("engine_connections_closed_total", "reason" => reason).increment(1);
}

pub fn record_handshake(outcome: &'static str) {
    ::metrics::counter!("engine_mpx_handshakes_total", "outcome" => outcome).increment(1);
}

pub fn record_channel_event(event: &'static str) {
    ::metrics::counter!("engine_mpx_channel_events_total", "event" => event).increment(1);
}

pub fn record_pool_exhausted(pool: &'static str) {
    ::metrics::counter!("engine_pool_exhausted_total", "pool" => pool).increment(1);
}

pub fn set_handlers_in_use(pool: &'static str, in_use: usize) {
    ::metrics::gauge!("engine_handlers_in_use", "pool" => pool).set(in_use as f64);
}

pub fn set_buffer_outstanding(bytes: usize) {
    ::metrics::gauge!("engine_buffer_outstanding_bytes").set(bytes as f64);
}
