use std::sync::{Mutex, MutexGuard, PoisonError};

/// Largest timestamp accepted from the wire. Matches the SQLite INTEGER range
/// so every merged value can still be persisted.
pub const MAX_LOGICAL_TIMESTAMP: u64 = i64::MAX as u64;

/// Lamport clock owned by a single actor.
///
/// Every operation runs inside one critical section so a delivery context and a
/// timer context can share the clock without interleaving partial updates.
#[derive(Debug, Default)]
pub struct LogicalClock {
    counter: Mutex<u64>,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(value: u64) -> Self {
        Self {
            counter: Mutex::new(value),
        }
    }

    /// Advances the clock for a local state change that is not published.
    pub fn tick(&self) -> u64 {
        let mut counter = self.lock();
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Advances the clock for an outgoing message; the result is the message timestamp.
    pub fn send_event(&self) -> u64 {
        let mut counter = self.lock();
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Merges a timestamp observed on an inbound message.
    pub fn receive_event(&self, remote_timestamp: u64) -> u64 {
        let mut counter = self.lock();
        *counter = merge(*counter, remote_timestamp);
        *counter
    }

    pub fn current(&self) -> u64 {
        *self.lock()
    }

    // The counter is a plain integer, so a panic while holding the lock cannot
    // leave it half-written.
    fn lock(&self) -> MutexGuard<'_, u64> {
        self.counter.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn merge(local: u64, remote: u64) -> u64 {
    local.max(remote).saturating_add(1)
}
