//! Response finalization.
//!
//! # Responsibilities
//! - Produce exactly one wire response per request (or a forced closure)
//! - Serialize mapped errors through the configured error serializer
//! - Apply gzip/deflate when the body is over the compression threshold
//! - Release responses in request order for pipelined connections
//!
//! # Design Decisions
//! - Responses are fully buffered; every response carries `Content-Length`
//! - A second finalize for the same request is an error and has no wire effect
//! - Serializer failure degrades to closing the connection without a response

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use http::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
    TRANSFER_ENCODING, VARY,
};
use http::{HeaderMap, StatusCode, Version};
use serde::Serialize;
use thiserror::Error;

use crate::error::{ErrorResponse, ErrorSerializer};
use crate::http::request::{RequestContext, RequestSummary, X_REQUEST_ID};

/// Interim response for `Expect: 100-continue`.
pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// What an endpoint returns on success.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Never compress this response.
    pub compression_disabled: bool,
    /// Close the connection after writing this response.
    pub close_connection: bool,
}

impl ResponseInfo {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            compression_disabled: false,
            close_connection: false,
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(status, body).with_content_type("application/json"))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_content_type(self, content_type: &'static str) -> Self {
        self.with_header(CONTENT_TYPE, HeaderValue::from_static(content_type))
    }

    pub fn without_compression(mut self) -> Self {
        self.compression_disabled = true;
        self
    }

    pub fn closing(mut self) -> Self {
        self.close_connection = true;
        self
    }
}

/// Terminal result handed to the finalizer.
#[derive(Debug)]
pub enum Outcome {
    Success(ResponseInfo),
    MappedError(ErrorResponse),
    /// Close the connection without a response.
    ForcedClosure,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FinalizeError {
    #[error("request {seq} already has a response")]
    AlreadyFinalized { seq: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    Deflate,
}

impl ContentCoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCoding::Gzip => "gzip",
            ContentCoding::Deflate => "deflate",
        }
    }

    /// Pick a coding from an `Accept-Encoding` value. Highest q wins, gzip breaks ties.
    pub fn negotiate(accept_encoding: &str) -> Option<Self> {
        let mut best: Option<(ContentCoding, f32)> = None;
        for entry in accept_encoding.split(',') {
            let mut params = entry.split(';');
            let name = params.next().unwrap_or("").trim().to_ascii_lowercase();
            let q = params
                .find_map(|p| p.trim().strip_prefix("q="))
                .and_then(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            if q <= 0.0 {
                continue;
            }
            let coding = match name.as_str() {
                "gzip" | "x-gzip" | "*" => ContentCoding::Gzip,
                "deflate" => ContentCoding::Deflate,
                _ => continue,
            };
            let better = match best {
                None => true,
                Some((current, best_q)) => {
                    q > best_q || (q == best_q && coding == ContentCoding::Gzip && current != coding)
                }
            };
            if better {
                best = Some((coding, q));
            }
        }
        best.map(|(coding, _)| coding)
    }

    fn encode(&self, body: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            ContentCoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body)?;
                encoder.finish()
            }
            ContentCoding::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body)?;
                encoder.finish()
            }
        }
    }
}

/// A response ready for the wire.
#[derive(Debug)]
pub struct EncodedResponse {
    pub seq: u64,
    /// `None` for a forced closure.
    pub status: Option<StatusCode>,
    pub bytes: Bytes,
    pub body_len: usize,
    pub coding: Option<ContentCoding>,
    pub close_after: bool,
}

/// Per-connection response writer state.
pub struct ResponseFinalizer {
    compression_threshold: usize,
    serializer: Arc<dyn ErrorSerializer>,
    next_to_write: u64,
    ready: BTreeMap<u64, EncodedResponse>,
}

impl ResponseFinalizer {
    pub fn new(compression_threshold: usize, serializer: Arc<dyn ErrorSerializer>) -> Self {
        Self {
            compression_threshold,
            serializer,
            next_to_write: 0,
            ready: BTreeMap::new(),
        }
    }

    /// Encode the single response for `ctx`. `close` forces `Connection: close`.
    pub fn finalize(
        &mut self,
        ctx: &mut RequestContext,
        outcome: Outcome,
        close: bool,
    ) -> Result<(), FinalizeError> {
        if !ctx.mark_finalized() {
            return Err(FinalizeError::AlreadyFinalized { seq: ctx.seq() });
        }
        let encoded = self.encode(ctx.seq(), ctx.summary(), outcome, close);
        self.ready.insert(ctx.seq(), encoded);
        Ok(())
    }

    /// Responses whose predecessors have all been released, in order.
    pub fn drain_ready(&mut self) -> Vec<EncodedResponse> {
        let mut out = Vec::new();
        while let Some(response) = self.ready.remove(&self.next_to_write) {
            self.next_to_write += 1;
            out.push(response);
        }
        out
    }

    /// Finalized responses held back behind an earlier request.
    pub fn buffered(&self) -> usize {
        self.ready.len()
    }

    fn encode(
        &self,
        seq: u64,
        summary: Option<&RequestSummary>,
        outcome: Outcome,
        close: bool,
    ) -> EncodedResponse {
        let keep_alive = summary.map_or(false, |s| s.keep_alive);
        match outcome {
            Outcome::Success(response) => {
                let close = close || response.close_connection || !keep_alive;
                let disabled = response.compression_disabled;
                self.encode_parts(seq, summary, response.status, response.headers, response.body, disabled, close)
            }
            Outcome::MappedError(error) => match self.serializer.serialize(&error.contract) {
                Ok(body) => {
                    let mut headers = HeaderMap::new();
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static(self.serializer.content_type()));
                    let close = close || !keep_alive;
                    self.encode_parts(seq, summary, error.status, headers, body, false, close)
                }
                Err(e) => {
                    tracing::error!(
                        seq,
                        error_id = %error.contract.error_id,
                        error = %e,
                        "Failed to serialize error response; closing connection"
                    );
                    forced_closure(seq)
                }
            },
            Outcome::ForcedClosure => forced_closure(seq),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_parts(
        &self,
        seq: u64,
        summary: Option<&RequestSummary>,
        status: StatusCode,
        mut headers: HeaderMap,
        mut body: Bytes,
        compression_disabled: bool,
        close: bool,
    ) -> EncodedResponse {
        let version = summary.map_or(Version::HTTP_11, |s| s.version);
        let is_head = summary.map_or(false, |s| s.is_head());

        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);
        headers.remove(CONNECTION);

        let mut coding = None;
        if !compression_disabled
            && body.len() > self.compression_threshold
            && !headers.contains_key(CONTENT_ENCODING)
        {
            let negotiated = summary
                .and_then(|s| s.accept_encoding.as_ref())
                .and_then(|v| v.to_str().ok())
                .and_then(ContentCoding::negotiate);
            if let Some(candidate) = negotiated {
                match candidate.encode(&body) {
                    Ok(compressed) => {
                        body = Bytes::from(compressed);
                        headers.insert(CONTENT_ENCODING, HeaderValue::from_static(candidate.as_str()));
                        headers.append(VARY, HeaderValue::from_static("accept-encoding"));
                        coding = Some(candidate);
                    }
                    Err(e) => tracing::warn!(seq, error = %e, "Compression failed; sending identity body"),
                }
            }
        }

        let has_body = !(status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED);
        if has_body {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        if let Some(summary) = summary {
            if !headers.contains_key(X_REQUEST_ID) {
                if let Ok(value) = HeaderValue::from_str(&summary.request_id) {
                    headers.insert(X_REQUEST_ID, value);
                }
            }
        }
        if close {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        } else if version == Version::HTTP_10 {
            headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }

        let mut buf = BytesMut::with_capacity(128 + body.len());
        write_head(&mut buf, version, status, &headers);
        if has_body && !is_head {
            buf.put_slice(&body);
        }

        EncodedResponse {
            seq,
            status: Some(status),
            bytes: buf.freeze(),
            body_len: body.len(),
            coding,
            close_after: close,
        }
    }
}

fn forced_closure(seq: u64) -> EncodedResponse {
    EncodedResponse {
        seq,
        status: None,
        bytes: Bytes::new(),
        body_len: 0,
        coding: None,
        close_after: true,
    }
}

fn write_head(buf: &mut BytesMut, version: Version, status: StatusCode, headers: &HeaderMap) {
    let version = if version == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" };
    buf.put_slice(version.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buf.put_slice(b"\r\n");
    for (name, value) in headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

/// Response for a connection refused before any request was read.
pub fn encode_rejection(
    error: &ErrorResponse,
    serializer: &dyn ErrorSerializer,
) -> Result<Bytes, serde_json::Error> {
    let body = serializer.serialize(&error.contract)?;
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(serializer.content_type()));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    let mut buf = BytesMut::with_capacity(128 + body.len());
    write_head(&mut buf, Version::HTTP_11, error.status, &headers);
    buf.put_slice(&body);
    Ok(buf.freeze())
}
