//! Metrics collection and exposition.
//!
//! # Metrics
//! - `parry_requests_total` (counter): finished requests by method, status, error kind
//! - `parry_request_duration_seconds` (histogram): first byte to final response
//! - `parry_open_connections` (gauge): currently admitted connections
//! - `parry_connections_rejected_total` (counter): connections refused by admission
//! - `parry_connections_closed_total` (counter): closed connections by reason
//!
//! # Design Decisions
//! - Recorded from the event dispatcher task, never on a connection task
//! - The Prometheus exporter is optional; without it the macros are no-ops

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::observability::events::{EventSink, ServerEvent};

/// Install the Prometheus exporter with an HTTP scrape listener.
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn on_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::ConnectionOpened { .. } => {
                gauge!("parry_open_connections").increment(1.0);
            }
            ServerEvent::ConnectionRejected { .. } => {
                counter!("parry_connections_rejected_total").increment(1);
            }
            ServerEvent::RequestCompleted(record) => {
                let status = record.status.map_or_else(|| "none".to_string(), |s| s.to_string());
                let error = record.error.map_or("none", |e| e.as_str());
                counter!(
                    "parry_requests_total",
                    "method" => record.method.clone(),
                    "status" => status,
                    "error" => error
                )
                .increment(1);
                histogram!("parry_request_duration_seconds", "method" => record.method.clone())
                    .record(record.duration.as_secs_f64());
            }
            ServerEvent::ConnectionClosed { reason, .. } => {
                gauge!("parry_open_connections").decrement(1.0);
                counter!("parry_connections_closed_total", "reason" => reason.as_str()).increment(1);
            }
        }
    }
}
