//! Endpoint execution subsystem.
//!
//! # Data Flow
//! ```text
//! Ready request
//!     → filter.rs (request filters, may short-circuit)
//!     → EndpointRegistry::find (first descriptor that matches)
//!     → security validator (Allow / Deny)
//!     → Endpoint::execute → spawned task → result back to the session
//!     → proxy.rs (DownstreamRouter, for proxy endpoints only)
//! ```
//!
//! # Design Decisions
//! - Endpoints return boxed futures; the session never blocks on them
//! - Cancellation is advisory: the endpoint task is dropped at its next await
//!   point and any result that still arrives is discarded by a state check
//! - Matching is deliberately minimal (exact path or prefix); this is not a router

pub mod executor;
pub mod filter;
pub mod proxy;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::Method;
use thiserror::Error;
use tokio::sync::watch;

use crate::error::{ApiError, RequestError};
use crate::http::{RequestInfo, ResponseInfo};

pub use executor::{ExecutorError, LongRunningExecutor};
pub use filter::{ConnectionPipeline, FilterAction, RequestFilter};
pub use proxy::{DownstreamRouter, ProxyEndpoint, ProxyError};

/// Deferred endpoint result.
pub type EndpointFuture = BoxFuture<'static, Result<ResponseInfo, EndpointError>>;

/// Errors an endpoint can complete with.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("connect to downstream {target} timed out after {timeout:?}")]
    DownstreamConnectTimeout { target: String, timeout: Duration },

    #[error("downstream {target} unavailable: {reason}")]
    DownstreamUnavailable { target: String, reason: String },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Close the connection without writing a response.
    #[error("endpoint requested connection close")]
    CloseConnection,

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl EndpointError {
    pub fn other(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        EndpointError::Other(error.into())
    }

    /// Classification used for error mapping. `None` means forced closure.
    pub fn into_request_error(self) -> Option<RequestError> {
        match self {
            EndpointError::Api(api) => Some(RequestError::Api(api)),
            EndpointError::DownstreamConnectTimeout { target, timeout } => {
                Some(RequestError::DownstreamConnectTimeout { target, timeout })
            }
            EndpointError::DownstreamUnavailable { target, reason } => {
                Some(RequestError::DownstreamUnavailable { target, reason })
            }
            EndpointError::Executor(e) => Some(RequestError::Unhandled(e.to_string())),
            EndpointError::CloseConnection => None,
            EndpointError::Other(e) => Some(RequestError::Unhandled(e.to_string())),
        }
    }
}

/// Path matching for an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatcher {
    Exact(String),
    Prefix(String),
}

impl PathMatcher {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Exact(expected) => path == expected,
            PathMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

/// Static description of an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    pub name: String,
    pub method: Option<Method>,
    pub path: PathMatcher,
    /// Overrides the server-wide processing timeout when set.
    pub processing_timeout: Option<Duration>,
}

impl EndpointDescriptor {
    pub fn exact(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(name, PathMatcher::Exact(path.into()))
    }

    pub fn prefix(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::new(name, PathMatcher::Prefix(prefix.into()))
    }

    fn new(name: impl Into<String>, path: PathMatcher) -> Self {
        Self {
            name: name.into(),
            method: None,
            path,
            processing_timeout: None,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = Some(timeout);
        self
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.method.as_ref().map_or(true, |m| m == method) && self.path.matches(path)
    }

    /// Per-endpoint override first, then the server default.
    pub fn resolve_timeout(&self, default: Option<Duration>) -> Option<Duration> {
        self.processing_timeout.or(default)
    }
}

/// Sender half of a request's cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiver half handed to endpoint code.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested or the owning request is gone.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Per-execution facilities offered to endpoint code.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub cancel: CancelSignal,
    pub executor: LongRunningExecutor,
    pub timeout: Option<Duration>,
}

/// User endpoint logic.
pub trait Endpoint: Send + Sync + 'static {
    fn descriptor(&self) -> &EndpointDescriptor;

    fn execute(&self, request: RequestInfo, ctx: ExecutionContext) -> EndpointFuture;
}

/// Endpoint backed by an async closure.
pub struct FnEndpoint<F> {
    descriptor: EndpointDescriptor,
    handler: F,
}

impl<F, Fut> Endpoint for FnEndpoint<F>
where
    F: Fn(RequestInfo, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResponseInfo, EndpointError>> + Send + 'static,
{
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn execute(&self, request: RequestInfo, ctx: ExecutionContext) -> EndpointFuture {
        (self.handler)(request, ctx).boxed()
    }
}

/// Build an endpoint from a descriptor and an async closure.
pub fn endpoint_fn<F, Fut>(descriptor: EndpointDescriptor, handler: F) -> Arc<dyn Endpoint>
where
    F: Fn(RequestInfo, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResponseInfo, EndpointError>> + Send + 'static,
{
    Arc::new(FnEndpoint { descriptor, handler })
}

/// Ordered endpoint list; the first matching descriptor wins.
#[derive(Clone, Default)]
pub struct EndpointRegistry {
    endpoints: Vec<Arc<dyn Endpoint>>,
}

impl EndpointRegistry {
    pub fn new(endpoints: Vec<Arc<dyn Endpoint>>) -> Self {
        Self { endpoints }
    }

    pub fn find(&self, method: &Method, path: &str) -> Option<Arc<dyn Endpoint>> {
        self.endpoints
            .iter()
            .find(|e| e.descriptor().matches(method, path))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(descriptor: EndpointDescriptor) -> Arc<dyn Endpoint> {
        endpoint_fn(descriptor, |_req, _ctx| async { Ok(ResponseInfo::ok("")) })
    }

    #[test]
    fn first_match_wins() {
        let registry = EndpointRegistry::new(vec![
            noop(EndpointDescriptor::exact("health", "/health").method(Method::GET)),
            noop(EndpointDescriptor::prefix("api", "/api/")),
            noop(EndpointDescriptor::prefix("catch-all", "/")),
        ]);

        let name = |m: Method, p: &str| registry.find(&m, p).map(|e| e.descriptor().name.clone());
        assert_eq!(name(Method::GET, "/health").as_deref(), Some("health"));
        assert_eq!(name(Method::POST, "/health").as_deref(), Some("catch-all"));
        assert_eq!(name(Method::PUT, "/api/items").as_deref(), Some("api"));
    }

    #[test]
    fn no_match_returns_none() {
        let registry = EndpointRegistry::new(vec![noop(EndpointDescriptor::exact("a", "/a"))]);
        assert!(registry.find(&Method::GET, "/b").is_none());
    }

    #[test]
    fn endpoint_timeout_overrides_default() {
        let default = Some(Duration::from_secs(58));
        let plain = EndpointDescriptor::exact("a", "/a");
        let fast = EndpointDescriptor::exact("b", "/b").processing_timeout(Duration::from_millis(10));
        assert_eq!(plain.resolve_timeout(default), default);
        assert_eq!(fast.resolve_timeout(default), Some(Duration::from_millis(10)));
        assert_eq!(plain.resolve_timeout(None), None);
    }

    #[tokio::test]
    async fn cancel_signal_resolves() {
        let (handle, mut signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_cancelled() {
        let (handle, mut signal) = cancel_pair();
        drop(handle);
        signal.cancelled().await;
    }

    #[test]
    fn close_connection_has_no_classification() {
        assert!(EndpointError::CloseConnection.into_request_error().is_none());
        let mapped = EndpointError::other("boom").into_request_error().unwrap();
        assert!(matches!(mapped, RequestError::Unhandled(ref m) if m == "boom"));
    }
}
