//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber from configuration
//! - Write one access-log line per finished request
//! - Log connection lifecycle when enabled
//!
//! # Design Decisions
//! - `RUST_LOG` overrides the configured level
//! - Access log lines go to the `access_log` target so they can be filtered separately

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ObservabilityConfig;
use crate::observability::events::{EventSink, ServerEvent};

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("parry_server={level},access_log=info", level = config.log_level).into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Access-log sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLogSink {
    connection_lifecycle: bool,
}

impl AccessLogSink {
    pub fn new(connection_lifecycle: bool) -> Self {
        Self { connection_lifecycle }
    }
}

impl EventSink for AccessLogSink {
    fn on_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::RequestCompleted(record) => {
                tracing::info!(
                    target: "access_log",
                    connection_id = %record.connection_id,
                    seq = record.seq,
                    method = %record.method,
                    path = %record.path,
                    status = record.status,
                    request_id = record.request_id.as_deref(),
                    user_id = record.user_id.as_deref(),
                    endpoint = record.endpoint.as_deref(),
                    error = record.error.map(|e| e.as_str()),
                    bytes_in = record.bytes_in,
                    bytes_out = record.bytes_out,
                    compressed = record.compressed,
                    duration_ms = record.duration.as_millis() as u64,
                    "request"
                );
            }
            ServerEvent::ConnectionRejected { peer_addr, open, limit } => {
                tracing::warn!(
                    target: "access_log",
                    peer_addr = %peer_addr,
                    open,
                    limit,
                    "connection rejected"
                );
            }
            ServerEvent::ConnectionOpened { connection_id, peer_addr } if self.connection_lifecycle => {
                tracing::info!(
                    target: "access_log",
                    connection_id = %connection_id,
                    peer_addr = %peer_addr,
                    "connection opened"
                );
            }
            ServerEvent::ConnectionClosed {
                connection_id,
                peer_addr,
                requests_served,
                lifetime,
                reason,
            } if self.connection_lifecycle => {
                tracing::info!(
                    target: "access_log",
                    connection_id = %connection_id,
                    peer_addr = %peer_addr,
                    requests_served,
                    lifetime_ms = lifetime.as_millis() as u64,
                    reason = reason.as_str(),
                    "connection closed"
                );
            }
            _ => {}
        }
    }
}
