//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs, hooks.rs):
//!     Load config → Validate → Build runtime → Pre-startup hooks → Bind → Post-startup hooks
//!
//! Per connection (hooks.rs):
//!     Accept → Connection-create hooks extend the pipeline
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     Signal received → Stop accepting → Drain connections → Shutdown hooks (reverse) → Exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: hooks first, listeners last (traffic only when ready)
//! - Shutdown has timeouts: drain and each shutdown hook are bounded

pub mod hooks;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use hooks::{
    ConnectionCreateHook, HookError, HookFuture, PipelineHookRunner, PostStartupHook, PreStartupHook,
    ShutdownHook, ShutdownReport,
};
pub use shutdown::Shutdown;
