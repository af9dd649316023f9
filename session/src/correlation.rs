//! Correlation table mapping in-flight request ids to their waiting callers.

use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::{sync::oneshot, time::Instant};

use crate::{error::SessionError, Frame};

/// Outcome delivered to a waiting caller.
pub type Completion = Result<Frame, SessionError>;

/// One in-flight correlated call. Completing it consumes the slot, so a
/// request can only ever be resolved once.
#[derive(Debug)]
pub struct PendingRequest {
    slot: oneshot::Sender<Completion>,
    created: Instant,
}

impl PendingRequest {
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn complete(self, outcome: Completion) {
        // The receiver is gone when the caller gave up waiting (e.g. its own
        // timeout fired). The outcome is dropped in that case.
        let _ = self.slot.send(outcome);
    }
}

/// Thread-safe map from correlation id to [`PendingRequest`].
///
/// Sharded locking keeps unrelated registrations and resolutions from
/// contending with each other, and no lock is ever held across socket I/O.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    slots: DashMap<String, PendingRequest>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`. Fails if another request with the same id
    /// is still outstanding.
    pub fn register(&self, id: &str) -> Result<oneshot::Receiver<Completion>, SessionError> {
        let rx = match self.slots.entry(id.to_string()) {
            Entry::Occupied(_) => return Err(SessionError::DuplicateId(id.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingRequest {
                    slot: tx,
                    created: Instant::now(),
                });
                rx
            }
        };
        xchg_core::metrics::set_pending(self.slots.len());
        Ok(rx)
    }

    /// Deregister `id` and hand back its waiter.
    pub fn take(&self, id: &str) -> Option<PendingRequest> {
        let taken = self.slots.remove(id).map(|(_, pending)| pending);
        if taken.is_some() {
            xchg_core::metrics::set_pending(self.slots.len());
        }
        taken
    }

    /// Deliver `outcome` to the waiter for `id` and deregister it. Returns
    /// `false` when nothing is registered, which covers responses arriving
    /// after the request was already failed.
    pub fn resolve(&self, id: &str, outcome: Completion) -> bool {
        match self.take(id) {
            Some(pending) => {
                pending.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop the registration for `id` without signaling it. Used when the
    /// request could not be written.
    pub fn discard(&self, id: &str) -> bool {
        self.slots.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    /// Fail every outstanding request with `err` and clear the table.
    /// Returns the number of requests failed.
    pub fn fail_all(&self, err: &SessionError) -> usize {
        let ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.slots.remove(&id) {
                pending.complete(Err(err.clone()));
                failed += 1;
            }
        }
        xchg_core::metrics::set_pending(self.slots.len());
        failed
    }

    /// Fail requests that have waited longer than `ttl` with
    /// [`SessionError::Timeout`]. Returns the number expired.
    pub fn expire_older_than(&self, ttl: Duration) -> usize {
        let stale: Vec<String> = self
            .slots
            .iter()
            .filter(|e| e.value().age() >= ttl)
            .map(|e| e.key().clone())
            .collect();
        let mut expired = 0;
        for id in stale {
            if let Some((_, pending)) = self.slots.remove(&id) {
                pending.complete(Err(SessionError::Timeout(ttl)));
                expired += 1;
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
