//! Restores global commit order between the apply and lock-notify stages.

use std::collections::BTreeMap;

use crate::core::GlobalTransactionId;

/// Holds committed items until every lower [`GlobalTransactionId`] has been
/// released.
#[derive(Debug)]
pub struct GidSequencer<T> {
    next: u64,
    parked: BTreeMap<u64, T>,
}

impl<T> GidSequencer<T> {
    /// `first` is the gid the commit counter hands out first.
    pub fn new(first: GlobalTransactionId) -> Self {
        Self {
            next: first.get(),
            parked: BTreeMap::new(),
        }
    }

    pub fn next_expected(&self) -> GlobalTransactionId {
        GlobalTransactionId::new(self.next)
    }

    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    /// Returns the run of items that is now in order, lowest gid first.
    /// Gids below the cursor are stale and dropped.
    pub fn push(&mut self, gid: GlobalTransactionId, item: T) -> Vec<(GlobalTransactionId, T)> {
        if gid.get() < self.next {
            tracing::warn!(%gid, next = self.next, "dropping stale gid");
            return Vec::new();
        }
        self.parked.insert(gid.get(), item);
        let mut ready = Vec::new();
        while let Some(item) = self.parked.remove(&self.next) {
            ready.push((GlobalTransactionId::new(self.next), item));
            self.next += 1;
        }
        ready
    }
}
