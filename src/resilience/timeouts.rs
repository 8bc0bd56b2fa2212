//! Timeout enforcement.
//!
//! # Responsibilities
//! - Arm and cancel deadlines owned by one connection task
//! - Deliver each surviving deadline exactly once, in deadline order
//! - Make cancellation after fire a harmless no-op
//!
//! # Design Decisions
//! - Uses Tokio's timer facilities (`sleep_until`)
//! - Timers carry a payload describing what armed them; the owner dispatches
//!   on it and re-checks its own state before acting (stale-timer guard)
//! - One supervisor per connection, so arm/cancel/fire never race across threads

use std::collections::{BTreeMap, HashMap};
use std::future;
use std::time::Duration;

use tokio::time::{self, Instant};

/// Handle to one armed deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// A deadline that reached expiry without being cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired<T> {
    pub handle: TimerHandle,
    pub deadline: Instant,
    pub event: T,
}

/// Deadline scheduler for a single connection.
///
/// `arm` returns a [`TimerHandle`]; [`expired`](Self::expired) resolves with the
/// earliest surviving deadline. A handle is removed the moment it fires, so a
/// later `cancel` for it returns `false` and does nothing.
#[derive(Debug)]
pub struct TimeoutSupervisor<T> {
    next_id: u64,
    by_deadline: BTreeMap<(Instant, u64), T>,
    deadlines: HashMap<u64, Instant>,
}

impl<T> TimeoutSupervisor<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            by_deadline: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Arm a deadline `after` from now.
    pub fn arm(&mut self, after: Duration, event: T) -> TimerHandle {
        self.arm_at(Instant::now() + after, event)
    }

    /// Arm an absolute deadline.
    pub fn arm_at(&mut self, deadline: Instant, event: T) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.by_deadline.insert((deadline, id), event);
        self.deadlines.insert(id, deadline);
        TimerHandle(id)
    }

    /// Cancel a deadline. Returns `true` if it was still pending.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.deadlines.remove(&handle.0) {
            Some(deadline) => self.by_deadline.remove(&(deadline, handle.0)).is_some(),
            None => false,
        }
    }

    /// Cancel-then-arm, for sliding deadlines.
    pub fn rearm(&mut self, previous: Option<TimerHandle>, after: Duration, event: T) -> TimerHandle {
        if let Some(handle) = previous {
            self.cancel(handle);
        }
        self.arm(after, event)
    }

    /// Whether the handle is still armed.
    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.deadlines.contains_key(&handle.0)
    }

    /// Deadline of an armed handle.
    pub fn deadline(&self, handle: TimerHandle) -> Option<Instant> {
        self.deadlines.get(&handle.0).copied()
    }

    /// Number of armed deadlines.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest deadline if it is at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<Fired<T>> {
        let (deadline, id) = *self.by_deadline.keys().next()?;
        if deadline > now {
            return None;
        }
        let event = self.by_deadline.remove(&(deadline, id))?;
        self.deadlines.remove(&id);
        Some(Fired {
            handle: TimerHandle(id),
            deadline,
            event,
        })
    }

    /// Wait for the next deadline to fire.
    ///
    /// Pending forever while nothing is armed. Cancel safe: dropping the future
    /// before it resolves leaves every timer armed.
    pub async fn expired(&mut self) -> Fired<T> {
        loop {
            let Some(deadline) = self.next_deadline() else {
                return future::pending().await;
            };
            time::sleep_until(deadline).await;
            if let Some(fired) = self.pop_expired(Instant::now()) {
                return fired;
            }
        }
    }
}

impl<T> Default for TimeoutSupervisor<T> {
    fn default() -> Self {
        Self::new()
    }
}
