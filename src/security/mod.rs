//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → limits.rs (declared and accumulated body size)
//!     → [endpoint resolved]
//!     → validator.rs (SecurityValidator: Allow / Deny)
//!     → Endpoint execution
//! ```
//!
//! # Design Decisions
//! - Fail closed: a denial never reaches the endpoint
//! - Size limits are enforced while decoding, before the body is complete

pub mod limits;
pub mod validator;

pub use limits::RequestSizeLimit;
pub use validator::{HeaderTokenValidator, SecurityValidator, Verdict};
