//! Configuration schema definitions.
//!
//! This module defines the complete tuning contract for the server.
//! All types derive Serde traits for deserialization from config files.
//!
//! Timeouts and size limits are signed on purpose: a value `<= 0` disables the
//! corresponding feature, and `-1` disables the admission ceiling.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sentinel for [`ListenerConfig::max_open_incoming_connections`] meaning "no ceiling".
pub const UNLIMITED_CONNECTIONS: i64 = -1;

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (ports, TLS, admission ceiling).
    pub listener: ListenerConfig,

    /// Accept and worker thread settings.
    pub threads: ThreadConfig,

    /// The four timeout classes.
    pub timeouts: TimeoutConfig,

    /// Request size and pipelining limits.
    pub limits: LimitsConfig,

    /// HTTP decoder limits.
    pub decoder: DecoderConfig,

    /// Response handling.
    pub response: ResponseConfig,

    /// Startup/shutdown settings.
    pub lifecycle: LifecycleConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Distributed tracing header settings.
    pub tracing: TracingConfig,
}

impl ServerConfig {
    /// The port the server should listen on given the TLS toggle.
    pub fn effective_port(&self) -> u16 {
        if self.listener.use_tls {
            self.listener.ssl_port
        } else {
            self.listener.port
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host to bind (e.g., "0.0.0.0").
    pub bind_host: String,

    /// Plaintext port.
    pub port: u16,

    /// TLS port, used instead of `port` when `use_tls` is set.
    pub ssl_port: u16,

    /// Serve endpoints over TLS.
    pub use_tls: bool,

    /// Optional PEM certificate/key pair used when no TLS provider is supplied programmatically.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrently open inbound connections, `-1` for unlimited.
    pub max_open_incoming_connections: i64,
}

impl ListenerConfig {
    /// Admission ceiling, `None` when unlimited.
    pub fn connection_ceiling(&self) -> Option<usize> {
        if self.max_open_incoming_connections < 0 {
            None
        } else {
            Some(self.max_open_incoming_connections as usize)
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 8080,
            ssl_port: 8443,
            use_tls: false,
            tls: None,
            max_open_incoming_connections: 20_000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Thread configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// Number of accept tasks sharing the listening socket.
    pub boss_threads: usize,

    /// Number of runtime worker threads driving connection I/O. 0 = one per core.
    pub worker_threads: usize,

    /// Name given to runtime worker threads.
    pub worker_thread_name: String,

    /// Concurrency bound of the long-running task executor. 0 = unbounded.
    pub long_running_task_threads: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            boss_threads: 1,
            worker_threads: 0,
            worker_thread_name: "parry-worker".to_string(),
            long_running_task_threads: 0,
        }
    }
}

/// Timeout configuration, all values in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Idle time allowed between requests on a kept-alive connection.
    pub worker_channel_idle_timeout_millis: i64,

    /// Sliding deadline for receiving the next chunk of an in-progress request.
    pub incomplete_http_call_timeout_millis: i64,

    /// Default deadline for an endpoint to produce a result.
    pub processing_timeout_millis: i64,

    /// Deadline for a proxy endpoint to connect to its downstream.
    pub proxy_router_connect_timeout_millis: i64,

    /// Deadline for one response write when the idle timeout is disabled.
    pub write_timeout_millis: i64,
}

impl TimeoutConfig {
    pub fn idle(&self) -> Option<Duration> {
        enabled_millis(self.worker_channel_idle_timeout_millis)
    }

    pub fn incomplete_call(&self) -> Option<Duration> {
        enabled_millis(self.incomplete_http_call_timeout_millis)
    }

    pub fn processing(&self) -> Option<Duration> {
        enabled_millis(self.processing_timeout_millis)
    }

    pub fn downstream_connect(&self) -> Option<Duration> {
        enabled_millis(self.proxy_router_connect_timeout_millis)
    }

    /// How long a single write may block on a client that is not reading.
    /// The idle timeout applies when enabled, otherwise `write_timeout_millis`.
    pub fn write(&self) -> Option<Duration> {
        self.idle().or_else(|| enabled_millis(self.write_timeout_millis))
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            worker_channel_idle_timeout_millis: 5_000,
            incomplete_http_call_timeout_millis: 5_000,
            // Just under a minute, so callers behind a 60s load balancer still get a trackable error.
            processing_timeout_millis: 58_000,
            proxy_router_connect_timeout_millis: 10_000,
            write_timeout_millis: 30_000,
        }
    }
}

/// Convert a millisecond setting into a duration, treating `<= 0` as disabled.
pub fn enabled_millis(value: i64) -> Option<Duration> {
    if value > 0 {
        Some(Duration::from_millis(value as u64))
    } else {
        None
    }
}

/// Request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum request body size in bytes. `<= 0` disables the check.
    pub max_request_size_bytes: i64,

    /// Maximum requests executing concurrently on one pipelined connection.
    pub max_pipelined_requests: usize,
}

impl LimitsConfig {
    pub fn max_request_size(&self) -> Option<usize> {
        if self.max_request_size_bytes > 0 {
            Some(self.max_request_size_bytes as usize)
        } else {
            None
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_size_bytes: 0,
            max_pipelined_requests: 16,
        }
    }
}

/// HTTP/1.1 decoder limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Maximum length of the request line.
    pub max_initial_line_length: usize,

    /// Maximum size of the whole header block.
    pub max_header_size: usize,

    /// Body is handed to the session in slices no larger than this.
    pub max_chunk_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_initial_line_length: 4096,
            max_header_size: 8192,
            max_chunk_size: 8192,
        }
    }
}

/// Response configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResponseConfig {
    /// Bodies strictly larger than this are eligible for gzip/deflate.
    pub compression_threshold_bytes: usize,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            compression_threshold_bytes: 500,
        }
    }
}

/// Lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Time budget for each shutdown hook.
    pub shutdown_hook_timeout_millis: u64,

    /// Time to wait for open connections to drain on shutdown.
    pub shutdown_drain_timeout_millis: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_hook_timeout_millis: 5_000,
            shutdown_drain_timeout_millis: 10_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log every connection state transition at debug level.
    pub connection_lifecycle_logging: bool,

    /// Emit per-request access log lines.
    pub access_log_enabled: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Capacity of the event queue feeding metrics/access-log sinks.
    pub event_queue_capacity: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            connection_lifecycle_logging: false,
            access_log_enabled: true,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
            event_queue_capacity: 1024,
        }
    }
}

/// Distributed tracing header configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TracingConfig {
    /// Headers searched in order for the caller's user id; first match wins.
    pub user_id_header_keys: Vec<String>,
}
