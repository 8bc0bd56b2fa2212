//! Request error taxonomy and the strategies that turn errors into responses.
//!
//! Every terminal failure of a request is classified as a [`RequestError`].
//! The configured [`ErrorMapper`] turns known classes into an [`ErrorResponse`];
//! anything it declines (and every [`RequestError::Unhandled`]) goes to the
//! [`UnhandledErrorHandler`]. The resulting [`ErrorContract`] is rendered to
//! bytes by an [`ErrorSerializer`].

use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::decoder::DecodeError;

/// Coarse classification of a [`RequestError`], stable for metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AdmissionRejected,
    RequestTooLarge,
    IncompleteCallTimeout,
    ProcessingTimeout,
    DownstreamConnectTimeout,
    DownstreamUnavailable,
    ProtocolDecodeError,
    SecurityDenied,
    EndpointNotFound,
    ApplicationError,
    UnhandledApplicationError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AdmissionRejected => "admission_rejected",
            ErrorKind::RequestTooLarge => "request_too_large",
            ErrorKind::IncompleteCallTimeout => "incomplete_call_timeout",
            ErrorKind::ProcessingTimeout => "processing_timeout",
            ErrorKind::DownstreamConnectTimeout => "downstream_connect_timeout",
            ErrorKind::DownstreamUnavailable => "downstream_unavailable",
            ErrorKind::ProtocolDecodeError => "protocol_decode_error",
            ErrorKind::SecurityDenied => "security_denied",
            ErrorKind::EndpointNotFound => "endpoint_not_found",
            ErrorKind::ApplicationError => "application_error",
            ErrorKind::UnhandledApplicationError => "unhandled_application_error",
        }
    }
}

/// An error an endpoint deliberately reports to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Why a request did not complete successfully.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("too many open connections ({open} open, limit {limit})")]
    AdmissionRejected { open: usize, limit: usize },

    #[error("request of at least {received} bytes exceeds limit of {limit} bytes")]
    RequestTooLarge { limit: usize, received: usize },

    #[error("no request data received for {timeout:?}")]
    IncompleteCallTimeout { timeout: Duration },

    #[error("endpoint did not complete within {timeout:?}")]
    ProcessingTimeout { timeout: Duration },

    #[error("connect to downstream {target} timed out after {timeout:?}")]
    DownstreamConnectTimeout { target: String, timeout: Duration },

    #[error("downstream {target} unavailable: {reason}")]
    DownstreamUnavailable { target: String, reason: String },

    #[error("malformed request: {0}")]
    ProtocolDecode(#[from] DecodeError),

    #[error("request denied: {reason}")]
    SecurityDenied { reason: String },

    #[error("no endpoint for {method} {path}")]
    EndpointNotFound { method: String, path: String },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("unhandled application error: {0}")]
    Unhandled(String),
}

impl RequestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RequestError::AdmissionRejected { .. } => ErrorKind::AdmissionRejected,
            RequestError::RequestTooLarge { .. } => ErrorKind::RequestTooLarge,
            RequestError::IncompleteCallTimeout { .. } => ErrorKind::IncompleteCallTimeout,
            RequestError::ProcessingTimeout { .. } => ErrorKind::ProcessingTimeout,
            RequestError::DownstreamConnectTimeout { .. } => ErrorKind::DownstreamConnectTimeout,
            RequestError::DownstreamUnavailable { .. } => ErrorKind::DownstreamUnavailable,
            RequestError::ProtocolDecode(_) => ErrorKind::ProtocolDecodeError,
            RequestError::SecurityDenied { .. } => ErrorKind::SecurityDenied,
            RequestError::EndpointNotFound { .. } => ErrorKind::EndpointNotFound,
            RequestError::Api(_) => ErrorKind::ApplicationError,
            RequestError::Unhandled(_) => ErrorKind::UnhandledApplicationError,
        }
    }

    /// Whether the connection can no longer be trusted after this error.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            RequestError::AdmissionRejected { .. }
                | RequestError::RequestTooLarge { .. }
                | RequestError::IncompleteCallTimeout { .. }
                | RequestError::ProtocolDecode(_)
        )
    }
}

/// One entry of an error contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorEntry {
    pub code: String,
    pub message: String,
}

/// Structured error body returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContract {
    pub error_id: String,
    pub errors: Vec<ApiErrorEntry>,
}

impl ErrorContract {
    pub fn single(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            errors: vec![ApiErrorEntry {
                code: code.into(),
                message: message.into(),
            }],
        }
    }
}

/// Status and body for a mapped error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub contract: ErrorContract,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            contract: ErrorContract::single(code, message),
        }
    }
}

/// Primary error mapping strategy. Returns `None` for errors it does not recognize.
pub trait ErrorMapper: Send + Sync + 'static {
    fn map(&self, error: &RequestError) -> Option<ErrorResponse>;
}

/// Fallback for errors the primary mapper declined.
pub trait UnhandledErrorHandler: Send + Sync + 'static {
    fn handle(&self, error: &RequestError) -> ErrorResponse;
}

/// Renders an error contract to wire bytes.
pub trait ErrorSerializer: Send + Sync + 'static {
    fn content_type(&self) -> &'static str {
        "application/json; charset=utf-8"
    }

    fn serialize(&self, contract: &ErrorContract) -> Result<Bytes, serde_json::Error>;
}

/// Maps every known class to a stable status and code.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorMapper;

impl ErrorMapper for DefaultErrorMapper {
    fn map(&self, error: &RequestError) -> Option<ErrorResponse> {
        let message = error.to_string();
        let mapped = match error {
            RequestError::AdmissionRejected { .. } => {
                ErrorResponse::new(StatusCode::SERVICE_UNAVAILABLE, "TOO_MANY_OPEN_CONNECTIONS", message)
            }
            RequestError::RequestTooLarge { .. } => {
                ErrorResponse::new(StatusCode::PAYLOAD_TOO_LARGE, "REQUEST_TOO_LARGE", message)
            }
            RequestError::IncompleteCallTimeout { .. } => {
                ErrorResponse::new(StatusCode::REQUEST_TIMEOUT, "INCOMPLETE_CALL_TIMEOUT", message)
            }
            RequestError::ProcessingTimeout { .. } => {
                ErrorResponse::new(StatusCode::GATEWAY_TIMEOUT, "PROCESSING_TIMEOUT", message)
            }
            RequestError::DownstreamConnectTimeout { .. } => {
                ErrorResponse::new(StatusCode::SERVICE_UNAVAILABLE, "DOWNSTREAM_UNAVAILABLE", message)
            }
            RequestError::DownstreamUnavailable { .. } => {
                ErrorResponse::new(StatusCode::BAD_GATEWAY, "DOWNSTREAM_ERROR", message)
            }
            RequestError::ProtocolDecode(decode) if decode.is_header_overflow() => ErrorResponse::new(
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                "HEADERS_TOO_LARGE",
                message,
            ),
            RequestError::ProtocolDecode(_) => {
                ErrorResponse::new(StatusCode::BAD_REQUEST, "MALFORMED_REQUEST", message)
            }
            RequestError::SecurityDenied { .. } => {
                ErrorResponse::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
            }
            RequestError::EndpointNotFound { .. } => {
                ErrorResponse::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
            }
            RequestError::Api(api) => ErrorResponse::new(api.status, &api.code, api.message.clone()),
            RequestError::Unhandled(_) => return None,
        };
        Some(mapped)
    }
}

/// Generic 500 without leaking internal details.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultUnhandledErrorHandler;

impl UnhandledErrorHandler for DefaultUnhandledErrorHandler {
    fn handle(&self, error: &RequestError) -> ErrorResponse {
        let response = ErrorResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "GENERIC_SERVICE_ERROR",
            "An unexpected error occurred",
        );
        tracing::error!(
            error_id = %response.contract.error_id,
            error = %error,
            "Unhandled application error"
        );
        response
    }
}

/// JSON error bodies via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonErrorSerializer;

impl ErrorSerializer for JsonErrorSerializer {
    fn serialize(&self, contract: &ErrorContract) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(contract).map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_class_has_a_stable_status() {
        let mapper = DefaultErrorMapper;
        let cases = [
            (RequestError::AdmissionRejected { open: 2, limit: 2 }, 503),
            (RequestError::RequestTooLarge { limit: 1, received: 2 }, 413),
            (RequestError::IncompleteCallTimeout { timeout: Duration::from_secs(1) }, 408),
            (RequestError::ProcessingTimeout { timeout: Duration::from_secs(1) }, 504),
            (
                RequestError::DownstreamConnectTimeout {
                    target: "x:1".into(),
                    timeout: Duration::from_secs(1),
                },
                503,
            ),
            (RequestError::ProtocolDecode(DecodeError::HeaderTooLarge { limit: 10 }), 431),
            (RequestError::ProtocolDecode(DecodeError::InvalidChunkSize), 400),
            (RequestError::SecurityDenied { reason: "nope".into() }, 403),
            (
                RequestError::EndpointNotFound {
                    method: "GET".into(),
                    path: "/x".into(),
                },
                404,
            ),
        ];
        for (error, status) in cases {
            let mapped = mapper.map(&error).unwrap();
            assert_eq!(mapped.status.as_u16(), status, "{error}");
            assert_eq!(mapped.contract.errors.len(), 1);
        }
    }

    #[test]
    fn unhandled_goes_to_fallback() {
        let error = RequestError::Unhandled("boom".into());
        assert!(DefaultErrorMapper.map(&error).is_none());
        let fallback = DefaultUnhandledErrorHandler.handle(&error);
        assert_eq!(fallback.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!fallback.contract.errors[0].message.contains("boom"));
    }

    #[test]
    fn api_errors_keep_their_status() {
        let error = RequestError::from(ApiError::new(StatusCode::CONFLICT, "DUPLICATE", "already exists"));
        assert_eq!(error.kind(), ErrorKind::ApplicationError);
        let mapped = DefaultErrorMapper.map(&error).unwrap();
        assert_eq!(mapped.status, StatusCode::CONFLICT);
        assert_eq!(mapped.contract.errors[0].code, "DUPLICATE");
    }

    #[test]
    fn json_serializer_round_trips() {
        let contract = ErrorContract::single("CODE", "message");
        let bytes = JsonErrorSerializer.serialize(&contract).unwrap();
        let parsed: ErrorContract = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, contract);
    }
}
