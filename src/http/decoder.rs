//! Incremental HTTP/1.1 request decoder.
//!
//! Bytes are appended to a `BytesMut` by the session; [`RequestDecoder::decode`]
//! consumes as much as it can and yields one [`DecodeEvent`] at a time:
//!
//! ```text
//! Head ──▶ Body* ──▶ End ──▶ Head ...
//! ```
//!
//! Head parsing is delegated to `httparse`; body framing (content-length and
//! chunked) and the configured limits are enforced here.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use thiserror::Error;

use crate::config::DecoderConfig;

/// Upper bound on header count handed to `httparse`.
const MAX_HEADERS: usize = 100;

/// Protocol-level decode failure. Always terminates the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("request line exceeds {limit} bytes")]
    InitialLineTooLong { limit: usize },

    #[error("header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("too many headers")]
    TooManyHeaders,

    #[error("unsupported HTTP version")]
    UnsupportedVersion,

    #[error("invalid content-length")]
    InvalidContentLength,

    #[error("invalid chunk framing")]
    InvalidChunkSize,

    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,

    #[error("malformed request head: {0}")]
    Malformed(String),
}

impl DecodeError {
    /// Errors that map to 431 rather than 400.
    pub fn is_header_overflow(&self) -> bool {
        matches!(self, DecodeError::HeaderTooLarge { .. } | DecodeError::TooManyHeaders)
    }
}

/// How the body of a request is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
}

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub framing: BodyFraming,
}

impl RequestHead {
    /// Whether the caller wants the connection kept open after this exchange.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::HTTP_11 => !has_token(&self.headers, &CONNECTION, "close"),
            Version::HTTP_10 => has_token(&self.headers, &CONNECTION, "keep-alive"),
            _ => false,
        }
    }

    /// Whether the caller is waiting for `100 Continue` before sending the body.
    pub fn expects_continue(&self) -> bool {
        self.version == Version::HTTP_11
            && self.framing != BodyFraming::Empty
            && has_token(&self.headers, &EXPECT, "100-continue")
    }
}

fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// One step of decoder output.
#[derive(Debug, Clone)]
pub enum DecodeEvent {
    Head(RequestHead),
    Body(Bytes),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Length { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers { consumed: usize },
    Finish,
}

/// Incremental decoder for a sequence of requests on one connection.
#[derive(Debug)]
pub struct RequestDecoder {
    limits: DecoderConfig,
    state: State,
}

impl RequestDecoder {
    pub fn new(limits: DecoderConfig) -> Self {
        Self {
            limits,
            state: State::Head,
        }
    }

    /// True between requests (nothing of the next request consumed yet).
    pub fn at_request_boundary(&self) -> bool {
        self.state == State::Head
    }

    /// Drop blank lines preceding a request line.
    pub fn discard_separators(&self, buf: &mut BytesMut) {
        if self.state != State::Head {
            return;
        }
        let skip = buf.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
        buf.advance(skip);
    }

    /// Decode the next event from `buf`, or `None` if more bytes are needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<DecodeEvent>, DecodeError> {
        loop {
            match self.state {
                State::Finish => {
                    self.state = State::Head;
                    return Ok(Some(DecodeEvent::End));
                }
                State::Head => {
                    self.discard_separators(buf);
                    return match self.decode_head(buf)? {
                        Some(head) => {
                            self.state = match head.framing {
                                BodyFraming::Empty | BodyFraming::Length(0) => State::Finish,
                                BodyFraming::Length(n) => State::Length { remaining: n },
                                BodyFraming::Chunked => State::ChunkSize,
                            };
                            Ok(Some(DecodeEvent::Head(head)))
                        }
                        None => Ok(None),
                    };
                }
                State::Length { remaining } => {
                    let Some(chunk) = self.take_body(buf, remaining) else {
                        return Ok(None);
                    };
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        State::Finish
                    } else {
                        State::Length { remaining: left }
                    };
                    return Ok(Some(DecodeEvent::Body(chunk)));
                }
                State::ChunkSize => {
                    let Some(line_end) = find_crlf(buf) else {
                        if buf.len() > self.limits.max_initial_line_length {
                            return Err(DecodeError::InvalidChunkSize);
                        }
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&buf[..line_end])?;
                    buf.advance(line_end + 2);
                    self.state = if size == 0 {
                        State::Trailers { consumed: 0 }
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }
                State::ChunkData { remaining } => {
                    let Some(chunk) = self.take_body(buf, remaining) else {
                        return Ok(None);
                    };
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining: left }
                    };
                    return Ok(Some(DecodeEvent::Body(chunk)));
                }
                State::ChunkDataEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(DecodeError::InvalidChunkSize);
                    }
                    buf.advance(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers { consumed } => {
                    let Some(line_end) = find_crlf(buf) else {
                        if consumed + buf.len() > self.limits.max_header_size {
                            return Err(DecodeError::HeaderTooLarge {
                                limit: self.limits.max_header_size,
                            });
                        }
                        return Ok(None);
                    };
                    buf.advance(line_end + 2);
                    self.state = if line_end == 0 {
                        State::Finish
                    } else {
                        State::Trailers {
                            consumed: consumed + line_end + 2,
                        }
                    };
                }
            }
        }
    }

    fn take_body(&self, buf: &mut BytesMut, remaining: u64) -> Option<Bytes> {
        if buf.is_empty() {
            return None;
        }
        let len = (buf.len() as u64)
            .min(remaining)
            .min(self.limits.max_chunk_size as u64) as usize;
        Some(buf.split_to(len).freeze())
    }

    fn decode_head(&self, buf: &mut BytesMut) -> Result<Option<RequestHead>, DecodeError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let line_limit = self.limits.max_initial_line_length;
        let line_len = match buf.iter().position(|b| *b == b'\n') {
            Some(pos) => pos,
            None if buf.len() > line_limit => {
                return Err(DecodeError::InitialLineTooLong { limit: line_limit })
            }
            None => return Ok(None),
        };
        if line_len > line_limit {
            return Err(DecodeError::InitialLineTooLong { limit: line_limit });
        }

        let header_limit = self.limits.max_header_size;
        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut storage);
        let status = request.parse(&buf[..]).map_err(|err| match err {
            httparse::Error::TooManyHeaders => DecodeError::TooManyHeaders,
            httparse::Error::Version => DecodeError::UnsupportedVersion,
            other => DecodeError::Malformed(other.to_string()),
        })?;
        let head_len = match status {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if buf.len() > line_len + header_limit {
                    return Err(DecodeError::HeaderTooLarge { limit: header_limit });
                }
                return Ok(None);
            }
        };
        if head_len - line_len > header_limit + 1 {
            return Err(DecodeError::HeaderTooLarge { limit: header_limit });
        }

        let method = request
            .method
            .ok_or_else(|| DecodeError::Malformed("missing method".into()))
            .and_then(|m| {
                Method::from_bytes(m.as_bytes()).map_err(|_| DecodeError::Malformed(format!("invalid method {m}")))
            })?;
        let uri: Uri = request
            .path
            .ok_or_else(|| DecodeError::Malformed("missing request target".into()))?
            .parse()
            .map_err(|_| DecodeError::Malformed("invalid request target".into()))?;
        let version = match request.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            _ => return Err(DecodeError::UnsupportedVersion),
        };

        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for header in request.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| DecodeError::Malformed(format!("invalid header name {}", header.name)))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|_| DecodeError::Malformed(format!("invalid value for header {}", header.name)))?;
            headers.append(name, value);
        }

        let framing = body_framing(&headers)?;
        buf.advance(head_len);

        Ok(Some(RequestHead {
            method,
            uri,
            version,
            headers,
            framing,
        }))
    }
}

fn body_framing(headers: &HeaderMap) -> Result<BodyFraming, DecodeError> {
    let has_transfer_encoding = headers.contains_key(TRANSFER_ENCODING);
    if has_transfer_encoding {
        if headers.contains_key(CONTENT_LENGTH) {
            return Err(DecodeError::InvalidContentLength);
        }
        let last = headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .last()
            .unwrap_or_default();
        return if last.eq_ignore_ascii_case("chunked") {
            Ok(BodyFraming::Chunked)
        } else {
            Err(DecodeError::UnsupportedTransferEncoding)
        };
    }

    let mut length: Option<u64> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(DecodeError::InvalidContentLength)?;
        match length {
            Some(existing) if existing != parsed => return Err(DecodeError::InvalidContentLength),
            _ => length = Some(parsed),
        }
    }
    Ok(match length {
        Some(n) => BodyFraming::Length(n),
        None => BodyFraming::Empty,
    })
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, DecodeError> {
    let text = std::str::from_utf8(line).map_err(|_| DecodeError::InvalidChunkSize)?;
    let size = text.split(';').next().unwrap_or_default().trim();
    if size.is_empty() {
        return Err(DecodeError::InvalidChunkSize);
    }
    u64::from_str_radix(size, 16).map_err(|_| DecodeError::InvalidChunkSize)
}
