//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thread counts, limits, ports)
//! - Detect settings that would make the server unusable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;

use crate::config::schema::{ServerConfig, UNLIMITED_CONNECTIONS};

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },

    #[error("listener.max_open_incoming_connections must be -1 (unlimited) or positive, got {0}")]
    InvalidConnectionCeiling(i64),

    #[error("listener.tls requires both cert_path and key_path")]
    IncompleteTls,

    #[error("{field} port must not be 0")]
    InvalidPort { field: &'static str },

    #[error("tracing.user_id_header_keys contains an empty header name")]
    EmptyUserIdHeader,
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.port == 0 {
        errors.push(ValidationError::InvalidPort { field: "listener.port" });
    }
    if config.listener.ssl_port == 0 {
        errors.push(ValidationError::InvalidPort { field: "listener.ssl_port" });
    }

    let ceiling = config.listener.max_open_incoming_connections;
    if ceiling == 0 || ceiling < UNLIMITED_CONNECTIONS {
        errors.push(ValidationError::InvalidConnectionCeiling(ceiling));
    }

    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.trim().is_empty() || tls.key_path.trim().is_empty() {
            errors.push(ValidationError::IncompleteTls);
        }
    }

    let positives = [
        ("threads.boss_threads", config.threads.boss_threads),
        ("limits.max_pipelined_requests", config.limits.max_pipelined_requests),
        ("decoder.max_initial_line_length", config.decoder.max_initial_line_length),
        ("decoder.max_header_size", config.decoder.max_header_size),
        ("decoder.max_chunk_size", config.decoder.max_chunk_size),
        ("observability.event_queue_capacity", config.observability.event_queue_capacity),
    ];
    for (field, value) in positives {
        if value == 0 {
            errors.push(ValidationError::MustBePositive { field });
        }
    }

    if config
        .tracing
        .user_id_header_keys
        .iter()
        .any(|key| key.trim().is_empty())
    {
        errors.push(ValidationError::EmptyUserIdHeader);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
