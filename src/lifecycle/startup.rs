//! Runtime construction.
//!
//! # Responsibilities
//! - Build the multi-threaded runtime that drives connection I/O
//! - Size and name worker threads from configuration
//!
//! # Design Decisions
//! - Built explicitly instead of `#[tokio::main]` so thread settings come from config
//! - `worker_threads = 0` keeps tokio's default of one worker per core

use tokio::runtime::{Builder, Runtime};

use crate::config::ThreadConfig;

pub fn build_runtime(config: &ThreadConfig) -> std::io::Result<Runtime> {
    let mut builder = Builder::new_multi_thread();
    builder.enable_all().thread_name(config.worker_thread_name.clone());
    if config.worker_threads > 0 {
        builder.worker_threads(config.worker_threads);
    }
    let runtime = builder.build()?;
    tracing::debug!(
        worker_threads = config.worker_threads,
        thread_name = %config.worker_thread_name,
        "Runtime built"
    );
    Ok(runtime)
}
