//! Connection admission control.
//!
//! # Responsibilities
//! - Enforce `max_open_incoming_connections` across all accept tasks
//! - Hand out a permit per admitted connection
//! - Release each slot exactly once, however the connection ends
//!
//! # Design Decisions
//! - Lock-free compare-and-swap on a shared counter; admission never blocks
//! - Over-limit connections are rejected immediately, not queued
//! - The permit releases on drop, so a panicking connection task still frees its slot

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared open-connection counter with an optional ceiling.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    open: Arc<AtomicUsize>,
    limit: Option<usize>,
}

/// Result of an admission attempt.
#[derive(Debug)]
pub enum Admission {
    Admitted(AdmissionPermit),
    Rejected { open: usize, limit: usize },
}

impl AdmissionGate {
    /// `None` means unlimited.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            open: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub fn try_admit(&self) -> Admission {
        let mut prev = self.open.load(Ordering::Relaxed);
        loop {
            if let Some(limit) = self.limit {
                if prev >= limit {
                    return Admission::Rejected { open: prev, limit };
                }
            }
            match self
                .open
                .compare_exchange_weak(prev, prev + 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
        Admission::Admitted(AdmissionPermit {
            open: Arc::clone(&self.open),
            released: false,
        })
    }
}

/// One occupied connection slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    open: Arc<AtomicUsize>,
    released: bool,
}

impl AdmissionPermit {
    /// Release the slot now. Dropping the permit afterwards is a no-op.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !std::mem::replace(&mut self.released, true) {
            self.open.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admit(gate: &AdmissionGate) -> AdmissionPermit {
        match gate.try_admit() {
            Admission::Admitted(permit) => permit,
            Admission::Rejected { .. } => panic!("expected admission"),
        }
    }

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let gate = AdmissionGate::new(Some(2));
        let a = admit(&gate);
        let _b = admit(&gate);
        assert_eq!(gate.open_count(), 2);
        assert!(matches!(gate.try_admit(), Admission::Rejected { open: 2, limit: 2 }));

        a.release();
        assert_eq!(gate.open_count(), 1);
        let _c = admit(&gate);
        assert_eq!(gate.open_count(), 2);
    }

    #[test]
    fn release_then_drop_counts_once() {
        let gate = AdmissionGate::new(Some(1));
        let permit = admit(&gate);
        permit.release();
        assert_eq!(gate.open_count(), 0);

        {
            let _dropped = admit(&gate);
        }
        assert_eq!(gate.open_count(), 0);
    }

    #[test]
    fn unlimited_gate_never_rejects() {
        let gate = AdmissionGate::new(None);
        let permits: Vec<_> = (0..1000).map(|_| admit(&gate)).collect();
        assert_eq!(gate.open_count(), 1000);
        drop(permits);
        assert_eq!(gate.open_count(), 0);
    }

    #[test]
    fn concurrent_admission_never_exceeds_limit() {
        let gate = AdmissionGate::new(Some(8));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..100 {
                        if let Admission::Admitted(p) = gate.try_admit() {
                            assert!(gate.open_count() <= 8);
                            held.push(p);
                        }
                        if held.len() > 2 {
                            held.remove(0);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(gate.open_count(), 0);
    }
}
