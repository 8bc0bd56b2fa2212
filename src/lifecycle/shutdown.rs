//! Shutdown coordination for the server.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::net::admission::AdmissionGate;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that accept loops and connection tasks subscribe to.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until every admitted connection has closed, or `timeout` elapses.
/// Returns the number of connections still open.
pub async fn drain_connections(gate: &AdmissionGate, timeout: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + timeout;
    while gate.open_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    gate.open_count()
}
