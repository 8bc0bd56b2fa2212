//! HTTP server setup and lifecycle.
//!
//! # Responsibilities
//! - Collect endpoints, filters, error strategies, hooks and sinks (builder)
//! - Run startup hooks, bind, and spawn the accept tasks
//! - Hand each admitted connection to a `ConnectionSession`
//! - Answer over-limit connections with a 503 and close them
//! - On shutdown: stop accepting, drain, run shutdown hooks
//!
//! # Design Decisions
//! - Everything a session needs is in one shared `ServerState`
//! - `boss_threads` accept tasks share one listening socket
//! - Sessions learn about shutdown through a watch channel, so a connection
//!   accepted during shutdown still sees the signal

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use crate::config::{validation::ValidationError, ServerConfig};
use crate::endpoint::{Endpoint, EndpointRegistry, LongRunningExecutor, RequestFilter};
use crate::error::{
    DefaultErrorMapper, DefaultUnhandledErrorHandler, ErrorMapper, ErrorResponse, ErrorSerializer,
    JsonErrorSerializer, RequestError, UnhandledErrorHandler,
};
use crate::http::response::encode_rejection;
use crate::lifecycle::hooks::{
    ConnectionCreateHook, HookError, PipelineHookRunner, PostStartupHook, PreStartupHook, ShutdownHook,
};
use crate::lifecycle::shutdown::drain_connections;
use crate::net::admission::{AdmissionGate, AdmissionPermit};
use crate::net::connection::{CloseReason, ConnectionId, ConnectionInfo, ConnectionSession, SessionSummary};
use crate::net::listener::{Accepted, Listener, ListenerError};
use crate::net::tls::{self, PemFileTls, TlsError, TlsProvider};
use crate::observability::events::{EventDispatcher, EventSink, ServerEvent};
use crate::observability::logging::AccessLogSink;
use crate::observability::metrics::MetricsSink;
use crate::observability::tracing::connection_span;
use crate::security::{RequestSizeLimit, SecurityValidator};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const REJECT_LINGER: Duration = Duration::from_millis(250);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);
const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0:?}")]
    InvalidConfig(Vec<ValidationError>),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Shared, read-only state for every connection.
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub endpoints: EndpointRegistry,
    pub filters: Vec<Arc<dyn RequestFilter>>,
    pub error_mapper: Arc<dyn ErrorMapper>,
    pub unhandled: Arc<dyn UnhandledErrorHandler>,
    pub serializer: Arc<dyn ErrorSerializer>,
    pub validator: Option<Arc<dyn SecurityValidator>>,
    pub executor: LongRunningExecutor,
    pub events: EventDispatcher,
    pub hooks: Arc<PipelineHookRunner>,
    pub size_limit: RequestSizeLimit,
}

impl ServerState {
    /// Primary mapper first, unhandled handler for anything it declines.
    pub fn map_error(&self, error: &RequestError) -> ErrorResponse {
        self.error_mapper
            .map(error)
            .unwrap_or_else(|| self.unhandled.handle(error))
    }
}

pub struct HttpServerBuilder {
    config: ServerConfig,
    endpoints: Vec<Arc<dyn Endpoint>>,
    filters: Vec<Arc<dyn RequestFilter>>,
    error_mapper: Arc<dyn ErrorMapper>,
    unhandled: Arc<dyn UnhandledErrorHandler>,
    serializer: Arc<dyn ErrorSerializer>,
    validator: Option<Arc<dyn SecurityValidator>>,
    tls: Option<Arc<dyn TlsProvider>>,
    hooks: PipelineHookRunner,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl HttpServerBuilder {
    /// Endpoints are matched in registration order.
    pub fn endpoint(mut self, endpoint: Arc<dyn Endpoint>) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn filter(mut self, filter: Arc<dyn RequestFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn error_mapper(mut self, mapper: Arc<dyn ErrorMapper>) -> Self {
        self.error_mapper = mapper;
        self
    }

    pub fn unhandled_error_handler(mut self, handler: Arc<dyn UnhandledErrorHandler>) -> Self {
        self.unhandled = handler;
        self
    }

    pub fn error_serializer(mut self, serializer: Arc<dyn ErrorSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn security_validator(mut self, validator: Arc<dyn SecurityValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn tls_provider(mut self, provider: Arc<dyn TlsProvider>) -> Self {
        self.tls = Some(provider);
        self
    }

    pub fn pre_startup_hook(mut self, hook: Arc<dyn PreStartupHook>) -> Self {
        self.hooks.add_pre_startup(hook);
        self
    }

    pub fn post_startup_hook(mut self, hook: Arc<dyn PostStartupHook>) -> Self {
        self.hooks.add_post_startup(hook);
        self
    }

    pub fn connection_create_hook(mut self, hook: Arc<dyn ConnectionCreateHook>) -> Self {
        self.hooks.add_connection_create(hook);
        self
    }

    pub fn shutdown_hook(mut self, hook: Arc<dyn ShutdownHook>) -> Self {
        self.hooks.add_shutdown(hook);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(mut self) -> Result<HttpServer, ServerError> {
        crate::config::validation::validate_config(&self.config).map_err(ServerError::InvalidConfig)?;

        let observability = &self.config.observability;
        if observability.access_log_enabled || observability.connection_lifecycle_logging {
            self.sinks
                .insert(0, Arc::new(AccessLogSink::new(observability.connection_lifecycle_logging)));
        }
        if observability.metrics_enabled {
            self.sinks.push(Arc::new(MetricsSink));
        }

        Ok(HttpServer {
            config: Arc::new(self.config),
            endpoints: self.endpoints,
            filters: self.filters,
            error_mapper: self.error_mapper,
            unhandled: self.unhandled,
            serializer: self.serializer,
            validator: self.validator,
            tls: self.tls,
            hooks: self.hooks,
            sinks: self.sinks,
        })
    }
}

/// Embeddable HTTP/1.1 server.
pub struct HttpServer {
    config: Arc<ServerConfig>,
    endpoints: Vec<Arc<dyn Endpoint>>,
    filters: Vec<Arc<dyn RequestFilter>>,
    error_mapper: Arc<dyn ErrorMapper>,
    unhandled: Arc<dyn UnhandledErrorHandler>,
    serializer: Arc<dyn ErrorSerializer>,
    validator: Option<Arc<dyn SecurityValidator>>,
    tls: Option<Arc<dyn TlsProvider>>,
    hooks: PipelineHookRunner,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl HttpServer {
    pub fn builder(config: ServerConfig) -> HttpServerBuilder {
        HttpServerBuilder {
            config,
            endpoints: Vec::new(),
            filters: Vec::new(),
            error_mapper: Arc::new(DefaultErrorMapper),
            unhandled: Arc::new(DefaultUnhandledErrorHandler),
            serializer: Arc::new(JsonErrorSerializer),
            validator: None,
            tls: None,
            hooks: PipelineHookRunner::new(),
            sinks: Vec::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured host and port, then serve until `shutdown` fires.
    pub async fn serve(self, shutdown: broadcast::Receiver<()>) -> Result<(), ServerError> {
        self.hooks.run_pre_startup(&self.config).await?;
        let listener = &self.config.listener;
        let bound = Listener::bind(&listener.bind_host, self.config.effective_port(), self.gate()).await?;
        self.run_bound(bound, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: broadcast::Receiver<()>) -> Result<(), ServerError> {
        self.hooks.run_pre_startup(&self.config).await?;
        let bound = Listener::from_tcp(listener, self.gate());
        self.run_bound(bound, shutdown).await
    }

    fn gate(&self) -> AdmissionGate {
        AdmissionGate::new(self.config.listener.connection_ceiling())
    }

    fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, TlsError> {
        if !self.config.listener.use_tls {
            return Ok(None);
        }
        let acceptor = match &self.tls {
            Some(provider) => tls::acceptor(provider.as_ref())?,
            None => {
                let files = self.config.listener.tls.as_ref().ok_or(TlsError::NotConfigured)?;
                tls::acceptor(&PemFileTls::from_config(files))?
            }
        };
        Ok(Some(acceptor))
    }

    async fn run_bound(
        mut self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        let tls = self.tls_acceptor()?;
        let gate = listener.gate().clone();

        let sinks = std::mem::take(&mut self.sinks);
        let (events, events_task) = EventDispatcher::spawn(sinks, self.config.observability.event_queue_capacity);
        let state = self.into_state(events);
        let config = Arc::clone(&state.config);

        tracing::info!(
            address = %local_addr,
            tls = tls.is_some(),
            boss_threads = config.threads.boss_threads,
            endpoints = state.endpoints.len(),
            "HTTP server starting"
        );
        state.hooks.run_post_startup(&config, local_addr).await;

        let listener = Arc::new(listener);
        let (stop_tx, stop_rx) = watch::channel(false);
        let accept_tasks: Vec<_> = (0..config.threads.boss_threads.max(1))
            .map(|_| {
                tokio::spawn(accept_loop(
                    Arc::clone(&listener),
                    Arc::clone(&state),
                    tls.clone(),
                    stop_rx.clone(),
                ))
            })
            .collect();

        let _ = shutdown.recv().await;
        tracing::info!("Shutdown requested; no longer accepting connections");
        stop_tx.send_replace(true);
        for task in accept_tasks {
            let _ = task.await;
        }
        drop(listener);

        let drain_timeout = Duration::from_millis(config.lifecycle.shutdown_drain_timeout_millis);
        let remaining = drain_connections(&gate, drain_timeout).await;
        if remaining > 0 {
            tracing::warn!(remaining, timeout = ?drain_timeout, "Drain timeout elapsed with connections still open");
        }

        let budget = Duration::from_millis(config.lifecycle.shutdown_hook_timeout_millis);
        let report = state.hooks.run_shutdown(budget).await;
        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            "Shutdown hooks finished"
        );

        let dropped_events = state.events.dropped();
        drop(state);
        let _ = tokio::time::timeout(EVENT_FLUSH_TIMEOUT, events_task).await;
        tracing::info!(dropped_events, "HTTP server stopped");
        Ok(())
    }

    pub(crate) fn into_state(self, events: EventDispatcher) -> Arc<ServerState> {
        Arc::new(ServerState {
            executor: LongRunningExecutor::from_config(&self.config.threads),
            size_limit: RequestSizeLimit::from_config(&self.config.limits),
            config: self.config,
            endpoints: EndpointRegistry::new(self.endpoints),
            filters: self.filters,
            error_mapper: self.error_mapper,
            unhandled: self.unhandled,
            serializer: self.serializer,
            validator: self.validator,
            events,
            hooks: Arc::new(self.hooks),
        })
    }
}

async fn accept_loop(
    listener: Arc<Listener>,
    state: Arc<ServerState>,
    tls: Option<TlsAcceptor>,
    mut stop: watch::Receiver<bool>,
) {
    // `wait_for` holds a borrow of `stop` for the whole select arm.
    let sessions_stop = stop.clone();
    loop {
        tokio::select! {
            _ = async { let _ = stop.wait_for(|stopping| *stopping).await; } => break,
            accepted = listener.accept() => match accepted {
                Ok(Accepted::Admitted { stream, peer_addr, permit }) => {
                    tokio::spawn(handle_connection(
                        stream,
                        peer_addr,
                        permit,
                        Arc::clone(&state),
                        tls.clone(),
                        sessions_stop.clone(),
                    ));
                }
                Ok(Accepted::Rejected { stream, peer_addr, open, limit }) => {
                    tokio::spawn(reject_connection(stream, peer_addr, open, limit, tls.is_some(), Arc::clone(&state)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    permit: AdmissionPermit,
    state: Arc<ServerState>,
    tls: Option<TlsAcceptor>,
    stop: watch::Receiver<bool>,
) {
    let info = ConnectionInfo {
        id: ConnectionId::new(),
        peer_addr,
        tls: tls.is_some(),
    };
    let span = connection_span(info.id, peer_addr);

    async move {
        let opened_at = Instant::now();
        let _ = stream.set_nodelay(true);
        state.events.emit(ServerEvent::ConnectionOpened {
            connection_id: info.id,
            peer_addr,
        });

        let summary = match tls {
            None => ConnectionSession::new(stream, info.clone(), Arc::clone(&state)).run(stop).await,
            Some(acceptor) => match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => {
                    ConnectionSession::new(tls_stream, info.clone(), Arc::clone(&state)).run(stop).await
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "TLS handshake failed");
                    handshake_failed()
                }
                Err(_) => {
                    tracing::debug!(timeout = ?TLS_HANDSHAKE_TIMEOUT, "TLS handshake timed out");
                    handshake_failed()
                }
            },
        };

        permit.release();
        state.events.emit(ServerEvent::ConnectionClosed {
            connection_id: info.id,
            peer_addr,
            requests_served: summary.requests_served,
            lifetime: opened_at.elapsed(),
            reason: summary.reason,
        });
    }
    .instrument(span)
    .await
}

fn handshake_failed() -> SessionSummary {
    SessionSummary {
        requests_served: 0,
        reason: CloseReason::TlsHandshakeFailed,
    }
}

/// Write a 503 and close. TLS listeners just close, since no handshake happened.
async fn reject_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    open: usize,
    limit: usize,
    tls: bool,
    state: Arc<ServerState>,
) {
    state.events.emit(ServerEvent::ConnectionRejected { peer_addr, open, limit });
    if tls {
        return;
    }

    let response = state.map_error(&RequestError::AdmissionRejected { open, limit });
    let bytes = match encode_rejection(&response, state.serializer.as_ref()) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize rejection; closing");
            return;
        }
    };

    let _ = tokio::time::timeout(REJECT_LINGER, async {
        stream.write_all(&bytes).await?;
        stream.shutdown().await?;
        // Drain what the client already sent so the close is not turned into a reset.
        let mut scratch = [0u8; 1024];
        while stream.read(&mut scratch).await? > 0 {}
        Ok::<_, std::io::Error>(())
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;

    #[test]
    fn build_rejects_invalid_config() {
        let config = ServerConfig {
            listener: ListenerConfig {
                max_open_incoming_connections: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            HttpServer::builder(config).build(),
            Err(ServerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn unhandled_errors_fall_through_to_handler() {
        let state = HttpServer::builder(ServerConfig::default())
            .build()
            .unwrap()
            .into_state(EventDispatcher::disabled());
        let response = state.map_error(&RequestError::Unhandled("db down".into()));
        assert_eq!(response.status, http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.contract.errors[0].code, "GENERIC_SERVICE_ERROR");

        let response = state.map_error(&RequestError::EndpointNotFound {
            method: "GET".into(),
            path: "/nope".into(),
        });
        assert_eq!(response.status, http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn default_sinks_follow_config() {
        let mut config = ServerConfig::default();
        config.observability.access_log_enabled = false;
        config.observability.metrics_enabled = true;
        let server = HttpServer::builder(config).build().unwrap();
        assert_eq!(server.sinks.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_accept_loop_with_open_session() {
        let server = HttpServer::builder(ServerConfig::default()).build().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = crate::lifecycle::Shutdown::new();
        let handle = tokio::spawn(server.run(listener, shutdown.subscribe()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 404"));

        shutdown.trigger();
        let result = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
