//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Connection tasks emit ServerEvents:
//!     → events.rs (bounded queue, dropped when full)
//!     → logging.rs (AccessLogSink: one line per request)
//!     → metrics.rs (MetricsSink: counters, gauges, histograms)
//!
//! Spans (tracing.rs):
//!     connection span → request span → endpoint logs
//! ```
//!
//! # Design Decisions
//! - Request ID flows through spans, access log and the `x-request-id` response header
//! - Sinks run on one dispatcher task, never on connection tasks

pub mod events;
pub mod logging;
pub mod metrics;
pub mod tracing;

pub use events::{EventDispatcher, EventSink, RequestRecord, ServerEvent};
pub use logging::AccessLogSink;
pub use self::metrics::MetricsSink;
