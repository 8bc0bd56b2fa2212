//! Span construction for connections and requests.
//!
//! Every connection task runs inside a `connection` span and every dispatched
//! request inside a `request` span, so log lines carry the connection ID,
//! peer address and request ID without repeating them at each call site.

use std::net::SocketAddr;

use tracing::Span;

use crate::net::connection::ConnectionId;

pub fn connection_span(connection_id: ConnectionId, peer_addr: SocketAddr) -> Span {
    tracing::info_span!("connection", connection_id = %connection_id, peer_addr = %peer_addr)
}

pub fn request_span(seq: u64, request_id: &str, endpoint: &str) -> Span {
    tracing::info_span!("request", seq, request_id = %request_id, endpoint = %endpoint)
}
