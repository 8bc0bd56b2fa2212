//! Per-request state.
//!
//! # Responsibilities
//! - Track one request from its first bytes to a terminal state
//! - Own the request's timers and cancellation handle
//! - Resolve request ID and user ID for tracing
//!
//! # Design Decisions
//! - Only the owning session mutates a context, so no locking is needed
//! - Terminal transitions cancel every timer the context owns; a timer that
//!   still fires afterwards is recognized as stale by its handle
//! - Terminal states are final: later transitions are refused, not applied
//!
//! ```text
//! HeaderReceived ─► BodyAccumulating ─► Ready ─► Executing ─► Completed
//!        │                 │              │           └──────► TimedOut
//!        └─────────────────┴──────────────┴──────────────────► Failed
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::ACCEPT_ENCODING;
use http::{HeaderMap, HeaderValue, Method, Uri, Version};
use tokio::time::Instant;
use uuid::Uuid;

use crate::endpoint::CancelHandle;
use crate::error::{ErrorKind, RequestError};
use crate::http::decoder::RequestHead;
use crate::net::connection::ConnectionId;
use crate::resilience::{TimeoutSupervisor, TimerHandle};
use crate::security::limits::RequestSizeLimit;

/// Header used for request ID propagation.
pub const X_REQUEST_ID: &str = "x-request-id";

const MAX_REQUEST_ID_LEN: usize = 200;

/// Events scheduled on a session's timeout supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Idle,
    IncompleteCall { seq: u64 },
    Processing { seq: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    HeaderReceived,
    BodyAccumulating,
    Ready,
    Executing,
    Completed,
    TimedOut,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::TimedOut | RequestState::Failed
        )
    }

    pub fn is_decoding(self) -> bool {
        matches!(self, RequestState::HeaderReceived | RequestState::BodyAccumulating)
    }
}

/// The parts of a request that stay with the session after the body is handed off.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub request_id: String,
    pub user_id: Option<String>,
    pub keep_alive: bool,
    pub accept_encoding: Option<HeaderValue>,
}

impl RequestSummary {
    pub fn from_head(head: &RequestHead, user_id_keys: &[String]) -> Self {
        Self {
            method: head.method.clone(),
            uri: head.uri.clone(),
            version: head.version,
            request_id: extract_request_id(&head.headers),
            user_id: extract_user_id(&head.headers, user_id_keys),
            keep_alive: head.keep_alive(),
            accept_encoding: head.headers.get(ACCEPT_ENCODING).cloned(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }
}

/// Caller-supplied request ID, or a fresh UUID when absent or unusable.
pub fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// First configured header that carries a non-empty value.
pub fn extract_user_id(headers: &HeaderMap, keys: &[String]) -> Option<String> {
    keys.iter().find_map(|key| {
        headers
            .get(key.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    })
}

/// A fully received request as seen by filters and endpoints.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub connection_id: ConnectionId,
    pub seq: u64,
    pub peer_addr: SocketAddr,
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub request_id: String,
    pub user_id: Option<String>,
}

impl RequestInfo {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Lifecycle record of one request on a connection.
#[derive(Debug)]
pub struct RequestContext {
    connection_id: ConnectionId,
    seq: u64,
    state: RequestState,
    created_at: Instant,
    head: Option<RequestHead>,
    summary: Option<RequestSummary>,
    body: BytesMut,
    body_len: usize,
    first_chunk_at: Option<Instant>,
    last_chunk_at: Option<Instant>,
    execution_started_at: Option<Instant>,
    finished_at: Option<Instant>,
    incomplete_call_timer: Option<TimerHandle>,
    processing_timer: Option<TimerHandle>,
    processing_timeout: Option<Duration>,
    cancel: Option<CancelHandle>,
    endpoint: Option<String>,
    error: Option<ErrorKind>,
    finalized: bool,
}

impl RequestContext {
    pub fn new(connection_id: ConnectionId, seq: u64, now: Instant) -> Self {
        Self {
            connection_id,
            seq,
            state: RequestState::HeaderReceived,
            created_at: now,
            head: None,
            summary: None,
            body: BytesMut::new(),
            body_len: 0,
            first_chunk_at: None,
            last_chunk_at: None,
            execution_started_at: None,
            finished_at: None,
            incomplete_call_timer: None,
            processing_timer: None,
            processing_timeout: None,
            cancel: None,
            endpoint: None,
            error: None,
            finalized: false,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn summary(&self) -> Option<&RequestSummary> {
        self.summary.as_ref()
    }

    pub fn body_len(&self) -> usize {
        self.body_len
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error
    }

    pub fn processing_timeout(&self) -> Option<Duration> {
        self.processing_timeout
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn first_chunk_at(&self) -> Option<Instant> {
        self.first_chunk_at
    }

    pub fn last_chunk_at(&self) -> Option<Instant> {
        self.last_chunk_at
    }

    pub fn execution_started_at(&self) -> Option<Instant> {
        self.execution_started_at
    }

    /// Time from first bytes to the terminal transition (or `now` if still open).
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.finished_at.unwrap_or(now).saturating_duration_since(self.created_at)
    }

    pub fn owns_incomplete_call_timer(&self, handle: TimerHandle) -> bool {
        self.state.is_decoding() && self.incomplete_call_timer == Some(handle)
    }

    pub fn owns_processing_timer(&self, handle: TimerHandle) -> bool {
        self.state == RequestState::Executing && self.processing_timer == Some(handle)
    }

    /// Arm or slide the incomplete-call timer. No-op once decoding is over or when disabled.
    pub fn touch(&mut self, timers: &mut TimeoutSupervisor<TimerEvent>, timeout: Option<Duration>) {
        let Some(timeout) = timeout else { return };
        if !self.state.is_decoding() {
            return;
        }
        let event = TimerEvent::IncompleteCall { seq: self.seq };
        self.incomplete_call_timer = Some(timers.rearm(self.incomplete_call_timer.take(), timeout, event));
    }

    pub fn on_head(&mut self, head: RequestHead, summary: RequestSummary) {
        self.summary = Some(summary);
        self.head = Some(head);
    }

    pub fn on_body_chunk(
        &mut self,
        chunk: &Bytes,
        now: Instant,
        limit: &RequestSizeLimit,
    ) -> Result<(), RequestError> {
        self.state = RequestState::BodyAccumulating;
        self.first_chunk_at.get_or_insert(now);
        self.last_chunk_at = Some(now);
        self.body_len += chunk.len();
        limit.check_received(self.body_len)?;
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    /// Request fully received.
    pub fn mark_ready(&mut self, timers: &mut TimeoutSupervisor<TimerEvent>) -> bool {
        if !self.state.is_decoding() {
            return false;
        }
        if let Some(handle) = self.incomplete_call_timer.take() {
            timers.cancel(handle);
        }
        self.state = RequestState::Ready;
        true
    }

    /// Hand the head and body to the endpoint side. Only available once.
    pub fn take_request_info(&mut self, peer_addr: SocketAddr) -> Option<RequestInfo> {
        let head = self.head.take()?;
        let summary = self.summary.as_ref()?;
        Some(RequestInfo {
            connection_id: self.connection_id,
            seq: self.seq,
            peer_addr,
            method: head.method,
            uri: head.uri,
            version: head.version,
            headers: head.headers,
            body: std::mem::take(&mut self.body).freeze(),
            request_id: summary.request_id.clone(),
            user_id: summary.user_id.clone(),
        })
    }

    pub fn begin_execution(
        &mut self,
        timers: &mut TimeoutSupervisor<TimerEvent>,
        now: Instant,
        endpoint: &str,
        timeout: Option<Duration>,
        cancel: CancelHandle,
    ) -> bool {
        if self.state != RequestState::Ready {
            return false;
        }
        self.state = RequestState::Executing;
        self.execution_started_at = Some(now);
        self.endpoint = Some(endpoint.to_owned());
        self.processing_timeout = timeout;
        self.cancel = Some(cancel);
        if let Some(timeout) = timeout {
            self.processing_timer = Some(timers.arm(timeout, TimerEvent::Processing { seq: self.seq }));
        }
        true
    }

    pub fn complete(&mut self, timers: &mut TimeoutSupervisor<TimerEvent>, now: Instant) -> bool {
        self.terminate(RequestState::Completed, None, timers, now)
    }

    pub fn time_out(
        &mut self,
        kind: ErrorKind,
        timers: &mut TimeoutSupervisor<TimerEvent>,
        now: Instant,
    ) -> bool {
        self.terminate(RequestState::TimedOut, Some(kind), timers, now)
    }

    pub fn fail(&mut self, kind: ErrorKind, timers: &mut TimeoutSupervisor<TimerEvent>, now: Instant) -> bool {
        self.terminate(RequestState::Failed, Some(kind), timers, now)
    }

    /// Drop all pending work when the connection goes away.
    pub fn abandon(&mut self, timers: &mut TimeoutSupervisor<TimerEvent>) {
        self.release_timers(timers);
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }

    /// Returns `false` if a response was already produced for this request.
    pub fn mark_finalized(&mut self) -> bool {
        !std::mem::replace(&mut self.finalized, true)
    }

    fn terminate(
        &mut self,
        state: RequestState,
        error: Option<ErrorKind>,
        timers: &mut TimeoutSupervisor<TimerEvent>,
        now: Instant,
    ) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = state;
        self.error = error;
        self.finished_at = Some(now);
        self.release_timers(timers);
        if let Some(cancel) = self.cancel.take() {
            if state != RequestState::Completed {
                cancel.cancel();
            }
        }
        true
    }

    fn release_timers(&mut self, timers: &mut TimeoutSupervisor<TimerEvent>) {
        for handle in [self.incomplete_call_timer.take(), self.processing_timer.take()]
            .into_iter()
            .flatten()
        {
            timers.cancel(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::cancel_pair;
    use crate::http::decoder::BodyFraming;
    use std::net::{IpAddr, Ipv4Addr};

    fn head(headers: &[(&str, &str)]) -> RequestHead {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.insert(
                http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        RequestHead {
            method: Method::POST,
            uri: "/orders?id=1".parse().unwrap(),
            version: Version::HTTP_11,
            headers: map,
            framing: BodyFraming::Length(4),
        }
    }

    fn context() -> (RequestContext, TimeoutSupervisor<TimerEvent>) {
        (RequestContext::new(ConnectionId::new(), 0, Instant::now()), TimeoutSupervisor::new())
    }

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000)
    }

    #[test]
    fn request_id_is_echoed_or_generated() {
        let h = head(&[("x-request-id", "abc-123")]);
        assert_eq!(extract_request_id(&h.headers), "abc-123");

        let generated = extract_request_id(&HeaderMap::new());
        assert!(Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn user_id_uses_first_configured_key_present() {
        let h = head(&[("x-user", "u-2"), ("x-account", "a-9")]);
        let keys = vec!["x-missing".to_string(), "x-account".to_string(), "x-user".to_string()];
        assert_eq!(extract_user_id(&h.headers, &keys).as_deref(), Some("a-9"));
        assert_eq!(extract_user_id(&h.headers, &[]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_call_timer_slides_then_cancels_on_ready() {
        let (mut ctx, mut timers) = context();
        let timeout = Some(Duration::from_millis(100));

        ctx.touch(&mut timers, timeout);
        let first = timers.next_deadline().unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        ctx.touch(&mut timers, timeout);
        assert_eq!(timers.len(), 1);
        assert!(timers.next_deadline().unwrap() > first);

        assert!(ctx.mark_ready(&mut timers));
        assert!(timers.is_empty());
        ctx.touch(&mut timers, timeout);
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_state_is_final() {
        let (mut ctx, mut timers) = context();
        ctx.on_head(head(&[]), RequestSummary::from_head(&head(&[]), &[]));
        ctx.mark_ready(&mut timers);
        let (handle, signal) = cancel_pair();
        assert!(ctx.begin_execution(&mut timers, Instant::now(), "orders", Some(Duration::from_secs(1)), handle));
        assert_eq!(timers.len(), 1);

        assert!(ctx.time_out(ErrorKind::ProcessingTimeout, &mut timers, Instant::now()));
        assert!(signal.is_cancelled());
        assert!(timers.is_empty());

        assert!(!ctx.complete(&mut timers, Instant::now()));
        assert_eq!(ctx.state(), RequestState::TimedOut);
        assert_eq!(ctx.error_kind(), Some(ErrorKind::ProcessingTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn completion_does_not_signal_cancel() {
        let (mut ctx, mut timers) = context();
        ctx.mark_ready(&mut timers);
        let (handle, signal) = cancel_pair();
        ctx.begin_execution(&mut timers, Instant::now(), "x", None, handle);
        assert!(timers.is_empty());
        assert!(ctx.complete(&mut timers, Instant::now()));
        assert!(!signal.is_cancelled());
    }

    #[test]
    fn finalized_only_once() {
        let (mut ctx, _) = context();
        assert!(ctx.mark_finalized());
        assert!(!ctx.mark_finalized());
    }

    #[test]
    fn body_over_limit_fails() {
        let (mut ctx, _) = context();
        let limit = RequestSizeLimit::new(Some(4));
        let now = Instant::now();
        assert!(ctx.on_body_chunk(&Bytes::from_static(b"abc"), now, &limit).is_ok());
        assert_eq!(ctx.state(), RequestState::BodyAccumulating);
        let err = ctx.on_body_chunk(&Bytes::from_static(b"de"), now, &limit).unwrap_err();
        assert!(matches!(err, RequestError::RequestTooLarge { limit: 4, received: 5 }));
    }

    #[test]
    fn request_info_carries_body_and_ids() {
        let (mut ctx, mut timers) = context();
        let h = head(&[("x-request-id", "rid"), ("x-user", "u1")]);
        let summary = RequestSummary::from_head(&h, &["x-user".to_string()]);
        ctx.on_head(h, summary);
        ctx.on_body_chunk(&Bytes::from_static(b"data"), Instant::now(), &RequestSizeLimit::default())
            .unwrap();
        ctx.mark_ready(&mut timers);

        let info = ctx.take_request_info(peer()).unwrap();
        assert_eq!(info.path(), "/orders");
        assert_eq!(info.query(), Some("id=1"));
        assert_eq!(&info.body[..], b"data");
        assert_eq!(info.request_id, "rid");
        assert_eq!(info.user_id.as_deref(), Some("u1"));
        assert!(ctx.take_request_info(peer()).is_none());
    }
}
