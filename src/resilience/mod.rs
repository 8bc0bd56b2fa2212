//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Session event loop:
//!     → timeouts.rs (arm idle / incomplete-call / processing deadlines)
//!     → deadline fires → session checks state → terminal outcome or no-op
//!
//! Downstream calls:
//!     → connect phase wrapped in tokio::time::timeout (endpoint::proxy)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every phase of a request has a deadline
//! - Timeout errors are distinct from other errors
//! - Timers are owned by the connection task that armed them

pub mod timeouts;

pub use timeouts::{Fired, TimeoutSupervisor, TimerHandle};
