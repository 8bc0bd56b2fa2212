//! Server lifecycle hooks.
//!
//! # Responsibilities
//! - Run pre-startup hooks before the listener binds; a failure aborts startup
//! - Run post-startup hooks once the server is accepting
//! - Let connection-create hooks extend each connection's pipeline
//! - Run shutdown hooks in reverse registration order, each with a time budget
//!
//! # Design Decisions
//! - Each shutdown hook runs as its own task so an overrun can be abandoned
//!   without stalling the hooks after it
//! - Hook failures after startup are logged, never propagated

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::config::ServerConfig;
use crate::endpoint::ConnectionPipeline;
use crate::net::connection::ConnectionInfo;

pub type HookFuture = BoxFuture<'static, Result<(), HookError>>;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook {hook} failed: {reason}")]
    Failed { hook: String, reason: String },

    #[error("hook {hook} exceeded its {budget:?} budget")]
    TimedOut { hook: String, budget: Duration },
}

impl HookError {
    pub fn failed(hook: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        HookError::Failed {
            hook: hook.into(),
            reason: reason.to_string(),
        }
    }
}

pub trait PreStartupHook: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn execute(&self, config: Arc<ServerConfig>) -> HookFuture;
}

pub trait PostStartupHook: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn execute(&self, config: Arc<ServerConfig>, local_addr: SocketAddr) -> HookFuture;
}

pub trait ConnectionCreateHook: Send + Sync + 'static {
    fn on_connection_created(&self, connection: &ConnectionInfo, pipeline: &mut ConnectionPipeline);
}

pub trait ShutdownHook: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn execute(&self) -> HookFuture;
}

/// What happened to the shutdown hooks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub timed_out: Vec<String>,
}

/// Registered hooks, run at the appropriate lifecycle points.
#[derive(Default)]
pub struct PipelineHookRunner {
    pre_startup: Vec<Arc<dyn PreStartupHook>>,
    post_startup: Vec<Arc<dyn PostStartupHook>>,
    connection_create: Vec<Arc<dyn ConnectionCreateHook>>,
    shutdown: Vec<Arc<dyn ShutdownHook>>,
}

impl PipelineHookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pre_startup(&mut self, hook: Arc<dyn PreStartupHook>) {
        self.pre_startup.push(hook);
    }

    pub fn add_post_startup(&mut self, hook: Arc<dyn PostStartupHook>) {
        self.post_startup.push(hook);
    }

    pub fn add_connection_create(&mut self, hook: Arc<dyn ConnectionCreateHook>) {
        self.connection_create.push(hook);
    }

    pub fn add_shutdown(&mut self, hook: Arc<dyn ShutdownHook>) {
        self.shutdown.push(hook);
    }

    /// Stops at the first failure.
    pub async fn run_pre_startup(&self, config: &Arc<ServerConfig>) -> Result<(), HookError> {
        for hook in &self.pre_startup {
            tracing::debug!(hook = hook.name(), "Running pre-startup hook");
            hook.execute(Arc::clone(config)).await?;
        }
        Ok(())
    }

    pub async fn run_post_startup(&self, config: &Arc<ServerConfig>, local_addr: SocketAddr) {
        for hook in &self.post_startup {
            if let Err(e) = hook.execute(Arc::clone(config), local_addr).await {
                tracing::error!(hook = hook.name(), error = %e, "Post-startup hook failed");
            }
        }
    }

    pub fn run_connection_create(&self, connection: &ConnectionInfo, pipeline: &mut ConnectionPipeline) {
        for hook in &self.connection_create {
            hook.on_connection_created(connection, pipeline);
        }
    }

    /// Reverse registration order; each hook gets at most `budget`.
    pub async fn run_shutdown(&self, budget: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        for hook in self.shutdown.iter().rev() {
            let name = hook.name().to_string();
            let mut task = tokio::spawn(hook.execute());
            match tokio::time::timeout(budget, &mut task).await {
                Ok(Ok(Ok(()))) => {
                    tracing::debug!(hook = %name, "Shutdown hook completed");
                    report.completed.push(name);
                }
                Ok(Ok(Err(e))) => {
                    tracing::error!(hook = %name, error = %e, "Shutdown hook failed");
                    report.failed.push(name);
                }
                Ok(Err(e)) => {
                    tracing::error!(hook = %name, error = %e, "Shutdown hook panicked");
                    report.failed.push(name);
                }
                Err(_) => {
                    task.abort();
                    tracing::warn!(hook = %name, budget = ?budget, "Shutdown hook exceeded budget; abandoned");
                    report.timed_out.push(name);
                }
            }
        }
        report
    }
}
