//! Server events and their delivery to sinks.
//!
//! # Responsibilities
//! - Describe what happened to connections and requests as plain values
//! - Deliver events to access-log and metrics sinks off the connection tasks
//!
//! # Design Decisions
//! - Bounded queue with `try_send`: a full queue drops the event and bumps a
//!   counter; connection tasks never wait on observability
//! - One dispatcher task fans each event out to every sink in registration order

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ErrorKind;
use crate::net::connection::{CloseReason, ConnectionId};

/// One finished request, as written to the access log.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub connection_id: ConnectionId,
    pub seq: u64,
    pub method: String,
    pub path: String,
    /// `None` when the connection was closed without a response.
    pub status: Option<u16>,
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub endpoint: Option<String>,
    pub error: Option<ErrorKind>,
    pub bytes_in: usize,
    pub bytes_out: usize,
    pub compressed: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ConnectionOpened {
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
    },
    ConnectionRejected {
        peer_addr: SocketAddr,
        open: usize,
        limit: usize,
    },
    RequestCompleted(RequestRecord),
    ConnectionClosed {
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
        requests_served: u64,
        lifetime: Duration,
        reason: CloseReason,
    },
}

pub trait EventSink: Send + Sync + 'static {
    fn on_event(&self, event: &ServerEvent);
}

/// Cheap, cloneable handle for emitting events.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: Option<mpsc::Sender<ServerEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventDispatcher {
    /// Start the delivery task. It ends once every dispatcher clone is dropped.
    pub fn spawn(sinks: Vec<Arc<dyn EventSink>>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ServerEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for sink in &sinks {
                    sink.on_event(&event);
                }
            }
        });
        let dispatcher = Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (dispatcher, handle)
    }

    /// Dispatcher that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: ServerEvent) {
        let Some(tx) = &self.tx else { return };
        if tx.try_send(event).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::trace!(dropped, "Event queue full; event dropped");
        }
    }

    /// Events lost to a full or closed queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ServerEvent>>);

    impl EventSink for Collect {
        fn on_event(&self, event: &ServerEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn opened() -> ServerEvent {
        ServerEvent::ConnectionOpened {
            connection_id: ConnectionId::new(),
            peer_addr: "127.0.0.1:9".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn events_reach_every_sink() {
        let a = Arc::new(Collect::default());
        let b = Arc::new(Collect::default());
        let (dispatcher, handle) = EventDispatcher::spawn(vec![a.clone(), b.clone()], 16);
        dispatcher.emit(opened());
        dispatcher.emit(opened());
        drop(dispatcher);
        handle.await.unwrap();

        assert_eq!(a.0.lock().unwrap().len(), 2);
        assert_eq!(b.0.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_drops_instead_of_blocking() {
        let sink = Arc::new(Collect::default());
        let (dispatcher, handle) = EventDispatcher::spawn(vec![sink.clone()], 1);
        // The delivery task cannot run until we yield, so the second emit overflows.
        dispatcher.emit(opened());
        dispatcher.emit(opened());
        assert_eq!(dispatcher.dropped(), 1);
        drop(dispatcher);
        handle.await.unwrap();
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn disabled_dispatcher_is_silent() {
        let dispatcher = EventDispatcher::disabled();
        dispatcher.emit(opened());
        assert_eq!(dispatcher.dropped(), 0);
    }
}
