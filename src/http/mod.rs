//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (accept, admit, hand off to a ConnectionSession)
//!     → decoder.rs (incremental HTTP/1.1 parsing under decoder limits)
//!     → request.rs (RequestContext: state machine, request/user IDs)
//!     → [endpoint executes]
//!     → response.rs (ResponseFinalizer: status, headers, compression, ordering)
//!     → Send to client
//! ```

pub mod decoder;
pub mod request;
pub mod response;
pub mod server;

pub use request::{RequestContext, RequestInfo, RequestState, RequestSummary, X_REQUEST_ID};
pub use response::{ContentCoding, Outcome, ResponseFinalizer, ResponseInfo};
pub use server::{HttpServer, HttpServerBuilder, ServerError, ServerState};
