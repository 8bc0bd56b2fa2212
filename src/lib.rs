//! Embeddable non-blocking HTTP/1.1 server: connection and request lifecycle engine.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::schema::ServerConfig;
pub use endpoint::{endpoint_fn, Endpoint, EndpointDescriptor, EndpointError, ExecutionContext};
pub use error::{ApiError, ErrorResponse, RequestError};
pub use http::{HttpServer, RequestInfo, ResponseInfo};
pub use lifecycle::Shutdown;
