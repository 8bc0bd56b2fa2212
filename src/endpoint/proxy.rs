//! Downstream forwarding.
//!
//! # Responsibilities
//! - Open a connection to a downstream HTTP/1.1 service under the connect timeout
//! - Send one request and buffer the full response
//! - Forward matching requests to a fixed base URL (`ProxyEndpoint`)
//!
//! # Design Decisions
//! - The connect timeout covers the TCP connect only; the rest of the call is
//!   bounded by the request's processing timeout
//! - One connection per call; no pooling
//! - Hop-by-hop headers are dropped in both directions
//! - Plain `http` downstreams only; other schemes are refused up front

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use http::{Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use url::Url;

use crate::config::TimeoutConfig;
use crate::endpoint::{Endpoint, EndpointDescriptor, EndpointError, EndpointFuture, ExecutionContext};
use crate::http::{RequestInfo, ResponseInfo, X_REQUEST_ID};

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unsupported downstream scheme {scheme:?} in {base}; only http is supported")]
    UnsupportedScheme { scheme: String, base: Url },
}

/// Sends requests to downstream services.
#[derive(Debug, Clone)]
pub struct DownstreamRouter {
    connect_timeout: Option<Duration>,
}

impl DownstreamRouter {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }

    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self::new(config.downstream_connect())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Send `request` to the authority in its URI and collect the response.
    pub async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, EndpointError> {
        let uri = request.uri().clone();
        if let Some(scheme) = uri.scheme_str().filter(|scheme| *scheme != "http") {
            return Err(EndpointError::other(format!("unsupported downstream scheme {scheme:?}: {uri}")));
        }
        let host = uri
            .host()
            .ok_or_else(|| EndpointError::other(format!("downstream URI has no host: {uri}")))?
            .to_string();
        let port = uri.port_u16().unwrap_or(80);
        let target = format!("{host}:{port}");

        let stream = self.connect(&host, port, &target).await?;
        let unavailable = |reason: String| EndpointError::DownstreamUnavailable {
            target: target.clone(),
            reason,
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let conn_target = target.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(target_addr = %conn_target, error = %e, "Downstream connection error");
            }
        });

        let (mut parts, body) = request.into_parts();
        let authority = uri.authority().map(|a| a.as_str().to_string()).unwrap_or(target.clone());
        if !parts.headers.contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(&authority) {
                parts.headers.insert(HOST, value);
            }
        }
        // Origin-form on the wire.
        parts.uri = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse::<Uri>()
            .map_err(|e| unavailable(e.to_string()))?;

        let response = sender
            .send_request(Request::from_parts(parts, Full::new(body)))
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| unavailable(e.to_string()))?
            .to_bytes();

        tracing::debug!(target_addr = %target, status = %parts.status, bytes = body.len(), "Downstream call finished");
        Ok(Response::from_parts(parts, body))
    }

    async fn connect(&self, host: &str, port: u16, target: &str) -> Result<TcpStream, EndpointError> {
        connect_within(TcpStream::connect((host, port)), self.connect_timeout, target).await
    }
}

/// Await `connect` under `timeout`, keeping a timeout apart from other failures.
async fn connect_within<F, T>(connect: F, timeout: Option<Duration>, target: &str) -> Result<T, EndpointError>
where
    F: Future<Output = std::io::Result<T>>,
{
    let result = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(target_addr = %target, timeout = ?timeout, "Downstream connect timed out");
                return Err(EndpointError::DownstreamConnectTimeout {
                    target: target.to_string(),
                    timeout,
                });
            }
        },
        None => connect.await,
    };
    result.map_err(|e| {
        tracing::warn!(target_addr = %target, error = %e, "Downstream connect failed");
        EndpointError::DownstreamUnavailable {
            target: target.to_string(),
            reason: e.to_string(),
        }
    })
}

/// Forwards every matching request to one downstream base URL.
pub struct ProxyEndpoint {
    descriptor: EndpointDescriptor,
    base: Url,
    router: DownstreamRouter,
}

impl ProxyEndpoint {
    /// Fails unless `base` is an `http` URL.
    pub fn new(descriptor: EndpointDescriptor, base: Url, router: DownstreamRouter) -> Result<Self, ProxyError> {
        if base.scheme() != "http" {
            return Err(ProxyError::UnsupportedScheme {
                scheme: base.scheme().to_string(),
                base,
            });
        }
        Ok(Self {
            descriptor,
            base,
            router,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Base path joined with the incoming path and query.
    fn target_uri(&self, request: &RequestInfo) -> Result<Uri, EndpointError> {
        let mut target = self.base.clone();
        let joined = format!("{}{}", self.base.path().trim_end_matches('/'), request.path());
        target.set_path(&joined);
        target.set_query(request.query());
        target
            .as_str()
            .parse::<Uri>()
            .map_err(|e| EndpointError::other(format!("invalid downstream URI {target}: {e}")))
    }
}

impl Endpoint for ProxyEndpoint {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn execute(&self, request: RequestInfo, _ctx: ExecutionContext) -> EndpointFuture {
        let router = self.router.clone();
        let target = self.target_uri(&request);

        Box::pin(async move {
            let target = target?;
            let mut headers = request.headers;
            strip_hop_by_hop(&mut headers);
            headers.remove(HOST);
            if let Ok(value) = HeaderValue::from_str(&request.request_id) {
                headers.insert(X_REQUEST_ID, value);
            }

            let mut downstream = Request::new(request.body);
            *downstream.method_mut() = request.method;
            *downstream.uri_mut() = target;
            *downstream.headers_mut() = headers;

            let response = router.send(downstream).await?;
            let (parts, body) = response.into_parts();
            let mut forwarded = ResponseInfo::new(parts.status, body);
            forwarded.headers = parts.headers;
            strip_hop_by_hop(&mut forwarded.headers);
            Ok(forwarded)
        })
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
