//! TCP listener with admission control.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections
//! - Admit or reject each one against the open-connection ceiling
//!
//! # Design Decisions
//! - Accept first, then admit: an over-limit client gets an explicit 503
//!   instead of waiting in the kernel backlog
//! - Several accept tasks may share one listener

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::net::admission::{Admission, AdmissionGate, AdmissionPermit};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),

    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// An accepted socket and the admission decision for it.
#[derive(Debug)]
pub enum Accepted {
    Admitted {
        stream: TcpStream,
        peer_addr: SocketAddr,
        permit: AdmissionPermit,
    },
    Rejected {
        stream: TcpStream,
        peer_addr: SocketAddr,
        open: usize,
        limit: usize,
    },
}

pub struct Listener {
    inner: TcpListener,
    gate: AdmissionGate,
}

impl Listener {
    pub async fn bind(host: &str, port: u16, gate: AdmissionGate) -> Result<Self, ListenerError> {
        let inner = TcpListener::bind((host, port))
            .await
            .map_err(|source| ListenerError::Bind {
                addr: format!("{host}:{port}"),
                source,
            })?;
        Ok(Self::from_tcp(inner, gate))
    }

    /// Wrap an already bound socket.
    pub fn from_tcp(inner: TcpListener, gate: AdmissionGate) -> Self {
        if let Ok(addr) = inner.local_addr() {
            tracing::info!(
                address = %addr,
                max_connections = ?gate.limit(),
                "Listener bound"
            );
        }
        Self { inner, gate }
    }

    pub async fn accept(&self) -> Result<Accepted, ListenerError> {
        let (stream, peer_addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        match self.gate.try_admit() {
            Admission::Admitted(permit) => {
                tracing::trace!(
                    peer_addr = %peer_addr,
                    open = self.gate.open_count(),
                    "Connection admitted"
                );
                Ok(Accepted::Admitted {
                    stream,
                    peer_addr,
                    permit,
                })
            }
            Admission::Rejected { open, limit } => {
                tracing::warn!(peer_addr = %peer_addr, open, limit, "Connection rejected: too many open connections");
                Ok(Accepted::Rejected {
                    stream,
                    peer_addr,
                    open,
                    limit,
                })
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ListenerError> {
        self.inner.local_addr().map_err(ListenerError::LocalAddr)
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn over_limit_connection_is_rejected() {
        let listener = Listener::bind("127.0.0.1", 0, AdmissionGate::new(Some(1))).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let admitted = listener.accept().await.unwrap();
        assert!(matches!(admitted, Accepted::Admitted { .. }));

        let _second = TcpStream::connect(addr).await.unwrap();
        let rejected = listener.accept().await.unwrap();
        assert!(matches!(rejected, Accepted::Rejected { open: 1, limit: 1, .. }));

        drop(admitted);
        assert_eq!(listener.gate().open_count(), 0);
    }

    #[tokio::test]
    async fn bind_failure_names_address() {
        let first = Listener::bind("127.0.0.1", 0, AdmissionGate::new(None)).await.unwrap();
        let port = first.local_addr().unwrap().port();
        let err = Listener::bind("127.0.0.1", port, AdmissionGate::new(None))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains(&format!("127.0.0.1:{port}")));
    }
}
