//! Connection session state machine.
//!
//! # Responsibilities
//! - Own one accepted connection from admission to close
//! - Decode requests, dispatch them to endpoints and write their responses
//! - Drive the idle, incomplete-call and processing timers
//! - Keep pipelined responses in request order
//!
//! # Design Decisions
//! - One task per connection is the only writer to its socket; endpoint results
//!   come back over a channel, so no response is ever written from two places
//! - Timer expiry, endpoint completion and socket reads are events on the same
//!   `select!` loop: a request cannot become Ready and time out concurrently
//! - Reading pauses while `max_pipelined_requests` responses are outstanding
//!
//! ```text
//! Idle ─bytes─► Decoding ─request complete─► AwaitingResponse ─written─► Idle
//!   │              │                               │
//!   └──idle timer──┴──────error / close / EOF──────┴──► Closing ─► Closed
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::endpoint::{cancel_pair, ConnectionPipeline, EndpointError, ExecutionContext};
use crate::error::RequestError;
use crate::http::decoder::{DecodeEvent, RequestDecoder, RequestHead};
use crate::http::request::{RequestContext, RequestState, RequestSummary, TimerEvent};
use crate::http::response::{EncodedResponse, Outcome, ResponseFinalizer, ResponseInfo, CONTINUE_RESPONSE};
use crate::http::server::ServerState;
use crate::observability::events::{RequestRecord, ServerEvent};
use crate::observability::tracing::request_span;
use crate::resilience::{Fired, TimeoutSupervisor, TimerHandle};
use crate::security::Verdict;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What hooks and logs know about a connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub tls: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Decoding,
    AwaitingResponse,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side.
    ClientClosed,
    IdleTimeout,
    /// Either side asked for `Connection: close`.
    ConnectionClose,
    /// A request error that leaves the stream unusable.
    RequestError,
    /// Closed without writing a response.
    ForcedClosure,
    Shutdown,
    IoError,
    TlsHandshakeFailed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::ConnectionClose => "connection_close",
            CloseReason::RequestError => "request_error",
            CloseReason::ForcedClosure => "forced_closure",
            CloseReason::Shutdown => "shutdown",
            CloseReason::IoError => "io_error",
            CloseReason::TlsHandshakeFailed => "tls_handshake_failed",
        }
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub requests_served: u64,
    pub reason: CloseReason,
}

/// Endpoint result routed back to the owning session.
struct Completion {
    seq: u64,
    result: Result<ResponseInfo, EndpointError>,
}

pub struct ConnectionSession<S> {
    info: ConnectionInfo,
    server: Arc<ServerState>,
    pipeline: ConnectionPipeline,
    state: SessionState,
    stream: S,
    read_buf: BytesMut,
    read_closed: bool,
    /// Whether new requests may still be started on this connection.
    accept_new: bool,
    draining: bool,
    send_continue: bool,
    decoder: RequestDecoder,
    decoding: Option<RequestContext>,
    in_flight: BTreeMap<u64, RequestContext>,
    finalizer: ResponseFinalizer,
    timers: TimeoutSupervisor<TimerEvent>,
    idle_timer: Option<TimerHandle>,
    next_seq: u64,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    requests_served: u64,
    close_reason: Option<CloseReason>,
}

impl<S> ConnectionSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, info: ConnectionInfo, server: Arc<ServerState>) -> Self {
        let mut pipeline = ConnectionPipeline::new(server.filters.clone());
        server.hooks.run_connection_create(&info, &mut pipeline);

        let finalizer = ResponseFinalizer::new(
            server.config.response.compression_threshold_bytes,
            Arc::clone(&server.serializer),
        );
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        Self {
            decoder: RequestDecoder::new(server.config.decoder.clone()),
            info,
            server,
            pipeline,
            state: SessionState::Idle,
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            read_closed: false,
            accept_new: true,
            draining: false,
            send_continue: false,
            decoding: None,
            in_flight: BTreeMap::new(),
            finalizer,
            timers: TimeoutSupervisor::new(),
            idle_timer: None,
            next_seq: 0,
            completions_tx,
            completions_rx,
            requests_served: 0,
            close_reason: None,
        }
    }

    /// Serve the connection until it closes. `stop` flips to `true` on server shutdown.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> SessionSummary {
        self.refresh_state();
        while self.state != SessionState::Closing {
            let can_read = self.can_read();
            tokio::select! {
                read = self.stream.read_buf(&mut self.read_buf), if can_read => match read {
                    Ok(0) => self.on_eof(),
                    Ok(_) => self.on_readable(),
                    Err(e) => self.on_io_error(&e),
                },
                Some(completion) = self.completions_rx.recv() => self.on_completion(completion),
                fired = self.timers.expired() => self.on_timer(fired),
                _ = stop.wait_for(|stopping| *stopping), if !self.draining => self.on_shutdown(),
            }
            self.settle().await;
            self.refresh_state();
        }
        self.close().await
    }

    /// Write what is ready, then start any requests that were held back in the buffer.
    async fn settle(&mut self) {
        loop {
            if let Err(e) = self.flush().await {
                self.on_io_error(&e);
                return;
            }
            let resumable = self.state != SessionState::Closing
                && self.decoding.is_none()
                && self.accept_new
                && !self.read_buf.is_empty()
                && self.in_flight.len() < self.config().limits.max_pipelined_requests;
            if !resumable {
                return;
            }
            self.decode_buffered();
        }
    }

    fn config(&self) -> &ServerConfig {
        &self.server.config
    }

    fn can_read(&self) -> bool {
        if self.read_closed || self.state == SessionState::Closing {
            return false;
        }
        self.decoding.is_some()
            || (self.accept_new && self.in_flight.len() < self.config().limits.max_pipelined_requests)
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if self.config().observability.connection_lifecycle_logging {
            tracing::debug!(from = ?self.state, to = ?next, "Connection state change");
        }
        self.state = next;
    }

    fn close_with(&mut self, reason: CloseReason) {
        self.close_reason.get_or_insert(reason);
        self.transition(SessionState::Closing);
    }

    fn refresh_state(&mut self) {
        if self.state == SessionState::Closing {
            return;
        }
        let quiet = self.decoding.is_none() && self.in_flight.is_empty();
        if quiet && self.read_closed {
            self.close_with(CloseReason::ClientClosed);
            return;
        }
        if quiet && !self.accept_new {
            let reason = if self.draining {
                CloseReason::Shutdown
            } else {
                CloseReason::ConnectionClose
            };
            self.close_with(reason);
            return;
        }

        let next = if self.decoding.is_some() {
            SessionState::Decoding
        } else if !self.in_flight.is_empty() {
            SessionState::AwaitingResponse
        } else {
            SessionState::Idle
        };
        self.transition(next);

        if next == SessionState::Idle {
            if self.idle_timer.is_none() {
                if let Some(timeout) = self.config().timeouts.idle() {
                    self.idle_timer = Some(self.timers.arm(timeout, TimerEvent::Idle));
                }
            }
        } else if let Some(handle) = self.idle_timer.take() {
            self.timers.cancel(handle);
        }
    }

    fn on_readable(&mut self) {
        self.decode_buffered();
        let timeout = self.config().timeouts.incomplete_call();
        if let Some(ctx) = self.decoding.as_mut() {
            ctx.touch(&mut self.timers, timeout);
        }
    }

    fn decode_buffered(&mut self) {
        let now = Instant::now();
        loop {
            if self.decoding.is_none() {
                if !self.accept_new {
                    return;
                }
                self.decoder.discard_separators(&mut self.read_buf);
                if self.read_buf.is_empty()
                    || self.in_flight.len() >= self.config().limits.max_pipelined_requests
                {
                    return;
                }
                let seq = self.next_seq;
                self.next_seq += 1;
                let mut ctx = RequestContext::new(self.info.id, seq, now);
                ctx.touch(&mut self.timers, self.server.config.timeouts.incomplete_call());
                self.decoding = Some(ctx);
            }

            match self.decoder.decode(&mut self.read_buf) {
                Ok(None) => return,
                Ok(Some(DecodeEvent::Head(head))) => self.on_head(head, now),
                Ok(Some(DecodeEvent::Body(chunk))) => self.on_body(chunk, now),
                Ok(Some(DecodeEvent::End)) => self.on_request_received(now),
                Err(e) => {
                    tracing::debug!(error = %e, "Malformed request");
                    self.fail_decoding(RequestError::ProtocolDecode(e), now);
                    return;
                }
            }
        }
    }

    fn on_head(&mut self, head: RequestHead, now: Instant) {
        let Some(ctx) = self.decoding.as_mut() else { return };
        let summary = RequestSummary::from_head(&head, &self.server.config.tracing.user_id_header_keys);
        let framing = head.framing;
        let expects_continue = head.expects_continue();
        if !summary.keep_alive {
            self.accept_new = false;
        }
        ctx.on_head(head, summary);

        if let Err(e) = self.server.size_limit.check_declared(framing) {
            self.fail_decoding(e, now);
            return;
        }
        if expects_continue && self.in_flight.is_empty() {
            self.send_continue = true;
        }
    }

    fn on_body(&mut self, chunk: Bytes, now: Instant) {
        let Some(ctx) = self.decoding.as_mut() else { return };
        if let Err(e) = ctx.on_body_chunk(&chunk, now, &self.server.size_limit) {
            self.fail_decoding(e, now);
        }
    }

    fn on_request_received(&mut self, now: Instant) {
        let Some(mut ctx) = self.decoding.take() else { return };
        ctx.mark_ready(&mut self.timers);
        self.dispatch(ctx, now);
    }

    fn fail_decoding(&mut self, error: RequestError, now: Instant) {
        self.accept_new = false;
        let Some(mut ctx) = self.decoding.take() else { return };
        self.fail_request(&mut ctx, error, now);
        self.in_flight.insert(ctx.seq(), ctx);
    }

    fn dispatch(&mut self, mut ctx: RequestContext, now: Instant) {
        let seq = ctx.seq();
        let Some(mut request) = ctx.take_request_info(self.info.peer_addr) else {
            self.fail_request(&mut ctx, RequestError::Unhandled("request head missing".into()), now);
            self.in_flight.insert(seq, ctx);
            return;
        };

        if let Some(response) = self.pipeline.apply_request(&mut request) {
            self.complete_request(&mut ctx, response, now);
            self.in_flight.insert(seq, ctx);
            return;
        }

        let Some(endpoint) = self.server.endpoints.find(&request.method, request.path()) else {
            let error = RequestError::EndpointNotFound {
                method: request.method.to_string(),
                path: request.path().to_string(),
            };
            self.fail_request(&mut ctx, error, now);
            self.in_flight.insert(seq, ctx);
            return;
        };
        let descriptor = endpoint.descriptor();

        if let Some(validator) = &self.server.validator {
            if let Verdict::Deny(reason) = validator.validate(&request, descriptor) {
                self.fail_request(&mut ctx, RequestError::SecurityDenied { reason }, now);
                self.in_flight.insert(seq, ctx);
                return;
            }
        }

        let timeout = descriptor.resolve_timeout(self.server.config.timeouts.processing());
        let (cancel_handle, cancel_signal) = cancel_pair();
        ctx.begin_execution(&mut self.timers, now, &descriptor.name, timeout, cancel_handle);

        let span = request_span(seq, &request.request_id, &descriptor.name);
        let exec_ctx = ExecutionContext {
            cancel: cancel_signal.clone(),
            executor: self.server.executor.clone(),
            timeout,
        };
        let future = endpoint.execute(request, exec_ctx);
        let completions = self.completions_tx.clone();
        let mut abandoned = cancel_signal;

        tokio::spawn(
            async move {
                let result = tokio::select! {
                    result = AssertUnwindSafe(future).catch_unwind() => {
                        result.unwrap_or_else(|_| Err(EndpointError::other("endpoint panicked")))
                    }
                    _ = abandoned.cancelled() => {
                        tracing::debug!("Endpoint abandoned");
                        return;
                    }
                };
                let _ = completions.send(Completion { seq, result });
            }
            .instrument(span),
        );

        self.in_flight.insert(seq, ctx);
    }

    fn complete_request(&mut self, ctx: &mut RequestContext, mut response: ResponseInfo, now: Instant) {
        if !ctx.complete(&mut self.timers, now) {
            return;
        }
        if let Some(summary) = ctx.summary() {
            self.pipeline.apply_response(summary, &mut response);
        }
        self.finalize(ctx, Outcome::Success(response), false);
    }

    /// Hand the outcome to the finalizer. A second outcome for one request is
    /// dropped and reported; `false` means nothing was queued.
    fn finalize(&mut self, ctx: &mut RequestContext, outcome: Outcome, close: bool) -> bool {
        match self.finalizer.finalize(ctx, outcome, close) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    connection_id = %self.info.id,
                    error = %e,
                    state = ?ctx.state(),
                    "Dropping duplicate response"
                );
                false
            }
        }
    }

    fn fail_request(&mut self, ctx: &mut RequestContext, error: RequestError, now: Instant) {
        let kind = error.kind();
        let changed = match error {
            RequestError::ProcessingTimeout { .. } => ctx.time_out(kind, &mut self.timers, now),
            _ => ctx.fail(kind, &mut self.timers, now),
        };
        if !changed {
            return;
        }
        let close = error.closes_connection();
        if close {
            self.accept_new = false;
        }
        let response = self.server.map_error(&error);
        self.finalize(ctx, Outcome::MappedError(response), close);
    }

    fn on_completion(&mut self, completion: Completion) {
        let Completion { seq, result } = completion;
        let Some(mut ctx) = self.in_flight.remove(&seq) else {
            tracing::debug!(seq, "Discarding result for a request that is no longer tracked");
            return;
        };
        if ctx.state() != RequestState::Executing {
            tracing::debug!(seq, state = ?ctx.state(), "Discarding late endpoint result");
            self.in_flight.insert(seq, ctx);
            return;
        }

        let now = Instant::now();
        match result {
            Ok(response) => self.complete_request(&mut ctx, response, now),
            Err(e) => match e.into_request_error() {
                Some(error) => self.fail_request(&mut ctx, error, now),
                None => {
                    if ctx.complete(&mut self.timers, now) {
                        self.accept_new = false;
                        self.finalize(&mut ctx, Outcome::ForcedClosure, true);
                    }
                }
            },
        }
        self.in_flight.insert(seq, ctx);
    }

    fn on_timer(&mut self, fired: Fired<TimerEvent>) {
        let now = Instant::now();
        match fired.event {
            TimerEvent::Idle => {
                if self.idle_timer != Some(fired.handle) {
                    return;
                }
                self.idle_timer = None;
                if self.decoding.is_none() && self.in_flight.is_empty() {
                    tracing::debug!("Idle timeout");
                    self.close_with(CloseReason::IdleTimeout);
                }
            }
            TimerEvent::IncompleteCall { seq } => {
                let owned = self
                    .decoding
                    .as_ref()
                    .is_some_and(|ctx| ctx.seq() == seq && ctx.owns_incomplete_call_timer(fired.handle));
                if !owned {
                    tracing::trace!(seq, "Stale incomplete-call timer");
                    return;
                }
                let timeout = self.config().timeouts.incomplete_call().unwrap_or_default();
                tracing::debug!(seq, timeout = ?timeout, "Incomplete call timed out");
                self.fail_decoding(RequestError::IncompleteCallTimeout { timeout }, now);
            }
            TimerEvent::Processing { seq } => {
                let Some(mut ctx) = self.in_flight.remove(&seq) else { return };
                if ctx.owns_processing_timer(fired.handle) {
                    let timeout = ctx.processing_timeout().unwrap_or_default();
                    tracing::warn!(seq, endpoint = ctx.endpoint(), timeout = ?timeout, "Endpoint timed out");
                    self.fail_request(&mut ctx, RequestError::ProcessingTimeout { timeout }, now);
                }
                self.in_flight.insert(seq, ctx);
            }
        }
    }

    fn on_eof(&mut self) {
        self.read_closed = true;
        if let Some(mut ctx) = self.decoding.take() {
            tracing::debug!(seq = ctx.seq(), "Client closed mid-request");
            ctx.abandon(&mut self.timers);
        }
    }

    fn on_io_error(&mut self, error: &std::io::Error) {
        tracing::debug!(error = %error, "Connection I/O error");
        self.close_with(CloseReason::IoError);
    }

    fn on_shutdown(&mut self) {
        self.draining = true;
        self.accept_new = false;
    }

    /// Write every response that is ready in order. Each write is bounded by
    /// the write deadline so a peer that stops reading cannot pin the session.
    async fn flush(&mut self) -> std::io::Result<()> {
        if self.state == SessionState::Closing {
            return Ok(());
        }
        let deadline = self.config().timeouts.write();
        let mut wrote = false;
        if std::mem::take(&mut self.send_continue) {
            write_within(&mut self.stream, CONTINUE_RESPONSE, deadline).await?;
            wrote = true;
        }
        for response in self.finalizer.drain_ready() {
            if !response.bytes.is_empty() {
                write_within(&mut self.stream, &response.bytes, deadline).await?;
                wrote = true;
            }
            let ctx = self.in_flight.remove(&response.seq);
            self.requests_served += 1;
            self.record(ctx.as_ref(), &response);
            if response.close_after {
                let reason = match (response.status, ctx.as_ref().and_then(|c| c.error_kind())) {
                    (None, _) => CloseReason::ForcedClosure,
                    (Some(_), Some(_)) => CloseReason::RequestError,
                    (Some(_), None) => CloseReason::ConnectionClose,
                };
                if wrote {
                    flush_within(&mut self.stream, deadline).await?;
                }
                self.close_with(reason);
                return Ok(());
            }
        }
        if wrote {
            flush_within(&mut self.stream, deadline).await?;
        }
        Ok(())
    }

    fn record(&self, ctx: Option<&RequestContext>, response: &EncodedResponse) {
        let Some(ctx) = ctx else { return };
        let summary = ctx.summary();
        let record = RequestRecord {
            connection_id: self.info.id,
            seq: ctx.seq(),
            method: summary.map_or_else(|| "-".to_string(), |s| s.method.to_string()),
            path: summary.map_or_else(|| "-".to_string(), |s| s.path().to_string()),
            status: response.status.map(|s| s.as_u16()),
            request_id: summary.map(|s| s.request_id.clone()),
            user_id: summary.and_then(|s| s.user_id.clone()),
            endpoint: ctx.endpoint().map(str::to_owned),
            error: ctx.error_kind(),
            bytes_in: ctx.body_len(),
            bytes_out: response.body_len,
            compressed: response.coding.is_some(),
            duration: ctx.elapsed(Instant::now()),
        };
        self.server.events.emit(ServerEvent::RequestCompleted(record));
    }

    async fn close(mut self) -> SessionSummary {
        for (_, mut ctx) in std::mem::take(&mut self.in_flight) {
            ctx.abandon(&mut self.timers);
        }
        if let Some(mut ctx) = self.decoding.take() {
            ctx.abandon(&mut self.timers);
        }
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.stream.shutdown()).await;

        let reason = self.close_reason.unwrap_or(CloseReason::ConnectionClose);
        self.transition(SessionState::Closed);
        tracing::debug!(reason = reason.as_str(), requests = self.requests_served, "Connection closed");
        SessionSummary {
            requests_served: self.requests_served,
            reason,
        }
    }
}

async fn write_within<S>(stream: &mut S, bytes: &[u8], deadline: Option<Duration>) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, stream.write_all(bytes))
            .await
            .unwrap_or_else(|_| Err(write_timed_out())),
        None => stream.write_all(bytes).await,
    }
}

async fn flush_within<S>(stream: &mut S, deadline: Option<Duration>) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, stream.flush())
            .await
            .unwrap_or_else(|_| Err(write_timed_out())),
        None => stream.flush().await,
    }
}

fn write_timed_out() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, "peer stopped reading")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{endpoint_fn, Endpoint, EndpointDescriptor};
    use crate::http::server::HttpServer;
    use crate::observability::EventDispatcher;
    use http::StatusCode;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.timeouts.worker_channel_idle_timeout_millis = 0;
        config.timeouts.incomplete_http_call_timeout_millis = 0;
        config.timeouts.processing_timeout_millis = 0;
        config.observability.access_log_enabled = false;
        config
    }

    /// `/sleep/<ms>` sleeps then echoes the path, `/big/<n>` answers `n` bytes,
    /// `/close` forces closure and `/boom` panics.
    fn test_endpoint() -> Arc<dyn Endpoint> {
        endpoint_fn(EndpointDescriptor::prefix("test", "/"), |req, _ctx| async move {
            let path = req.path().to_string();
            if let Some(ms) = path.strip_prefix("/sleep/") {
                let ms: u64 = ms.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if let Some(n) = path.strip_prefix("/big/") {
                return Ok(ResponseInfo::ok("x".repeat(n.parse().unwrap_or(0))));
            }
            match path.as_str() {
                "/close" => Err(EndpointError::CloseConnection),
                "/boom" => panic!("boom"),
                _ => Ok(ResponseInfo::ok(format!("{}|{}", path, req.body.len()))),
            }
        })
    }

    struct Client {
        io: DuplexStream,
        buf: Vec<u8>,
    }

    struct Reply {
        status: u16,
        head: String,
        body: String,
    }

    impl Client {
        async fn send(&mut self, bytes: &[u8]) {
            self.io.write_all(bytes).await.unwrap();
        }

        async fn fill(&mut self) -> bool {
            let mut chunk = [0u8; 4096];
            let n = self.io.read(&mut chunk).await.unwrap_or(0);
            self.buf.extend_from_slice(&chunk[..n]);
            n > 0
        }

        /// Next response, or `None` once the server closed without one.
        async fn reply(&mut self) -> Option<Reply> {
            loop {
                if let Some(end) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&self.buf[..end]).into_owned();
                    let status: u16 = head[9..12].parse().unwrap();
                    let length = head
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length: ").map(str::to_owned))
                        .map_or(0, |v| v.trim().parse::<usize>().unwrap());
                    let total = end + 4 + length;
                    while self.buf.len() < total {
                        if !self.fill().await {
                            return None;
                        }
                    }
                    let body = String::from_utf8_lossy(&self.buf[end + 4..total]).into_owned();
                    self.buf.drain(..total);
                    return Some(Reply { status, head, body });
                }
                if !self.fill().await {
                    return None;
                }
            }
        }
    }

    fn start(config: ServerConfig) -> (Client, JoinHandle<SessionSummary>, watch::Sender<bool>) {
        start_with_buffer(config, 64 * 1024)
    }

    fn start_with_buffer(
        config: ServerConfig,
        buffer: usize,
    ) -> (Client, JoinHandle<SessionSummary>, watch::Sender<bool>) {
        let server = HttpServer::builder(config)
            .endpoint(test_endpoint())
            .build()
            .unwrap()
            .into_state(EventDispatcher::disabled());
        let (client, server_io) = tokio::io::duplex(buffer);
        let info = ConnectionInfo {
            id: ConnectionId::new(),
            peer_addr: "127.0.0.1:50000".parse().unwrap(),
            tls: false,
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let session = tokio::spawn(ConnectionSession::new(server_io, info, server).run(stop_rx));
        (Client { io: client, buf: Vec::new() }, session, stop_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn pipelined_responses_keep_request_order() {
        let (mut client, _session, _stop) = start(test_config());
        client
            .send(b"GET /sleep/300 HTTP/1.1\r\n\r\nGET /sleep/10 HTTP/1.1\r\n\r\nGET /sleep/100 HTTP/1.1\r\n\r\n")
            .await;

        let bodies: Vec<String> = [
            client.reply().await.unwrap().body,
            client.reply().await.unwrap().body,
            client.reply().await.unwrap().body,
        ]
        .into();
        assert_eq!(bodies, vec!["/sleep/300|0", "/sleep/10|0", "/sleep/100|0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn processing_timeout_writes_exactly_one_response() {
        let mut config = test_config();
        config.timeouts.processing_timeout_millis = 1000;
        let (mut client, _session, _stop) = start(config);

        let started = Instant::now();
        client.send(b"GET /sleep/60000 HTTP/1.1\r\n\r\n").await;
        let reply = client.reply().await.unwrap();
        assert_eq!(reply.status, 504);
        assert!(reply.body.contains("PROCESSING_TIMEOUT"));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1000) && elapsed < Duration::from_millis(1100));

        // The connection stays usable and the abandoned result never shows up.
        client.send(b"GET /ok HTTP/1.1\r\n\r\n").await;
        let next = client.reply().await.unwrap();
        assert_eq!(next.status, 200);
        assert_eq!(next.body, "/ok|0");
        let late = tokio::time::timeout(Duration::from_secs(120), client.fill()).await;
        assert!(late.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_chunks_within_timeout_complete() {
        let mut config = test_config();
        config.timeouts.incomplete_http_call_timeout_millis = 500;
        let (mut client, _session, _stop) = start(config);

        client.send(b"POST /upload HTTP/1.1\r\ncontent-length: 10\r\n\r\nhello").await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        client.send(b"world").await;

        let reply = client.reply().await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, "/upload|10");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_body_times_out_and_closes() {
        let mut config = test_config();
        config.timeouts.incomplete_http_call_timeout_millis = 500;
        let (mut client, session, _stop) = start(config);

        client.send(b"POST /upload HTTP/1.1\r\ncontent-length: 10\r\n\r\nhello").await;
        let reply = client.reply().await.unwrap();
        assert_eq!(reply.status, 408);
        assert!(reply.head.to_ascii_lowercase().contains("connection: close"));
        assert!(client.reply().await.is_none());
        assert_eq!(session.await.unwrap().reason, CloseReason::RequestError);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_closed_without_response() {
        let mut config = test_config();
        config.timeouts.worker_channel_idle_timeout_millis = 1000;
        let (mut client, session, _stop) = start(config);

        let started = Instant::now();
        assert!(client.reply().await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(session.await.unwrap().reason, CloseReason::IdleTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_idle_timeout_never_closes() {
        let (mut client, session, _stop) = start(test_config());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!session.is_finished());

        client.send(b"GET /still-here HTTP/1.1\r\n\r\n").await;
        assert_eq!(client.reply().await.unwrap().status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_declared_body_is_rejected() {
        let mut config = test_config();
        config.limits.max_request_size_bytes = 8;
        let (mut client, session, _stop) = start(config);

        client.send(b"POST /upload HTTP/1.1\r\ncontent-length: 9\r\n\r\n").await;
        let reply = client.reply().await.unwrap();
        assert_eq!(reply.status, 413);
        assert!(client.reply().await.is_none());
        assert_eq!(session.await.unwrap().requests_served, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_request_gets_400_and_close() {
        let (mut client, _session, _stop) = start(test_config());
        client.send(b"NOT A REQUEST\r\n\r\n").await;
        assert_eq!(client.reply().await.unwrap().status, 400);
        assert!(client.reply().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expect_continue_gets_interim_response() {
        let (mut client, _session, _stop) = start(test_config());
        client
            .send(b"POST /upload HTTP/1.1\r\ncontent-length: 3\r\nexpect: 100-continue\r\n\r\n")
            .await;
        assert_eq!(client.reply().await.unwrap().status, 100);
        client.send(b"abc").await;
        let reply = client.reply().await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, "/upload|3");
    }

    #[tokio::test(start_paused = true)]
    async fn connection_close_request_ends_session() {
        let (mut client, session, _stop) = start(test_config());
        client.send(b"GET /bye HTTP/1.1\r\nconnection: close\r\n\r\n").await;
        let reply = client.reply().await.unwrap();
        assert!(reply.head.to_ascii_lowercase().contains("connection: close"));
        assert!(client.reply().await.is_none());
        assert_eq!(session.await.unwrap().reason, CloseReason::ConnectionClose);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_closure_writes_nothing() {
        let (mut client, session, _stop) = start(test_config());
        client.send(b"GET /close HTTP/1.1\r\n\r\n").await;
        assert!(client.reply().await.is_none());
        assert!(client.buf.is_empty());
        assert_eq!(session.await.unwrap().reason, CloseReason::ForcedClosure);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_endpoint_maps_to_500() {
        let (mut client, _session, _stop) = start(test_config());
        client.send(b"GET /boom HTTP/1.1\r\n\r\n").await;
        let reply = client.reply().await.unwrap();
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR.as_u16());
        assert!(reply.body.contains("GENERIC_SERVICE_ERROR"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_in_flight_request_finish() {
        let (mut client, session, stop) = start(test_config());
        client.send(b"GET /sleep/500 HTTP/1.1\r\n\r\n").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.send_replace(true);

        assert_eq!(client.reply().await.unwrap().status, 200);
        let summary = session.await.unwrap();
        assert_eq!(summary.reason, CloseReason::Shutdown);
        assert_eq!(summary.requests_served, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pipelining_limit_pauses_reading() {
        let mut config = test_config();
        config.limits.max_pipelined_requests = 1;
        let (mut client, _session, _stop) = start(config);
        client
            .send(b"GET /sleep/200 HTTP/1.1\r\n\r\nGET /sleep/1 HTTP/1.1\r\n\r\n")
            .await;
        assert_eq!(client.reply().await.unwrap().body, "/sleep/200|0");
        assert_eq!(client.reply().await.unwrap().body, "/sleep/1|0");
    }

    #[tokio::test(start_paused = true)]
    async fn peer_that_stops_reading_is_closed_after_idle_timeout() {
        let mut config = test_config();
        config.timeouts.worker_channel_idle_timeout_millis = 1000;
        let (mut client, session, _stop) = start_with_buffer(config, 1024);

        let started = Instant::now();
        client.send(b"GET /big/262144 HTTP/1.1\r\n\r\n").await;
        let summary = tokio::time::timeout(Duration::from_secs(30), session)
            .await
            .expect("session stuck writing to a peer that never reads")
            .unwrap();
        assert_eq!(summary.reason, CloseReason::IoError);
        assert_eq!(summary.requests_served, 0);
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn write_timeout_applies_when_idle_timeout_is_disabled() {
        let mut config = test_config();
        config.timeouts.write_timeout_millis = 2000;
        let (mut client, session, _stop) = start_with_buffer(config, 1024);

        let started = Instant::now();
        client.send(b"GET /big/262144 HTTP/1.1\r\n\r\n").await;
        let summary = tokio::time::timeout(Duration::from_secs(30), session)
            .await
            .expect("session stuck writing to a peer that never reads")
            .unwrap();
        assert_eq!(summary.reason, CloseReason::IoError);
        assert!(started.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn second_outcome_for_a_request_is_dropped() {
        let server = HttpServer::builder(test_config())
            .build()
            .unwrap()
            .into_state(EventDispatcher::disabled());
        let (_client, server_io) = tokio::io::duplex(1024);
        let info = ConnectionInfo {
            id: ConnectionId::new(),
            peer_addr: "127.0.0.1:50000".parse().unwrap(),
            tls: false,
        };
        let mut ctx = RequestContext::new(info.id, 0, Instant::now());
        let mut session = ConnectionSession::new(server_io, info, server);

        assert!(session.finalize(&mut ctx, Outcome::Success(ResponseInfo::ok("first")), false));
        assert!(!session.finalize(&mut ctx, Outcome::ForcedClosure, true));

        let ready = session.finalizer.drain_ready();
        assert_eq!(ready.len(), 1);
        assert!(!ready[0].close_after);
        assert!(String::from_utf8_lossy(&ready[0].bytes).ends_with("first"));
    }
}
