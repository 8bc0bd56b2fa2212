//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop)
//!     → admission.rs (open-connection ceiling: admit or 503)
//!     → tls.rs (optional TLS handshake)
//!     → connection.rs (ConnectionSession: decode, dispatch, timers, ordered writes)
//!
//! Connection States:
//!     Idle → Decoding → AwaitingResponse → Idle ... → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - Admission is decided at accept time, never queued
//! - Each connection is one task and the only writer to its socket
//! - TLS is optional and handled transparently

pub mod admission;
pub mod connection;
pub mod listener;
pub mod tls;

pub use admission::{Admission, AdmissionGate, AdmissionPermit};
pub use connection::{CloseReason, ConnectionId, ConnectionInfo, ConnectionSession, SessionSummary};
pub use listener::{Accepted, Listener, ListenerError};
pub use tls::{PemFileTls, TlsError, TlsProvider};
