//! Optional per-lock statistics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::core::LockId;
use crate::daemon::metrics;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatsMode {
    #[default]
    Disabled,
    Enabled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockCounts {
    pub grants: u64,
    pub contended: u64,
    pub notified: u64,
}

#[derive(Clone, Debug, Default)]
pub enum LockStats {
    #[default]
    Disabled,
    Enabled(Arc<Mutex<HashMap<LockId, LockCounts>>>),
}

impl LockStats {
    pub fn new(mode: LockStatsMode) -> Self {
        match mode {
            LockStatsMode::Disabled => LockStats::Disabled,
            LockStatsMode::Enabled => LockStats::Enabled(Arc::default()),
        }
    }

    fn bump(&self, lock: &LockId, f: impl FnOnce(&mut LockCounts)) {
        if let LockStats::Enabled(table) = self {
            let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
            f(table.entry(lock.clone()).or_default());
        }
    }

    pub fn record_grant(&self, lock: &LockId) {
        self.bump(lock, |c| c.grants += 1);
        if self.is_enabled() {
            metrics::lock_granted(lock);
        }
    }

    pub fn record_contended(&self, lock: &LockId) {
        self.bump(lock, |c| c.contended += 1);
        if self.is_enabled() {
            metrics::lock_contended(lock);
        }
    }

    pub fn record_notify(&self, lock: &LockId, waiters: usize) {
        self.bump(lock, |c| c.notified += waiters as u64);
        if self.is_enabled() {
            metrics::lock_notified(lock, waiters);
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, LockStats::Enabled(_))
    }

    /// `None` when statistics are disabled.
    pub fn counts(&self, lock: &LockId) -> Option<LockCounts> {
        match self {
            LockStats::Disabled => None,
            LockStats::Enabled(table) => Some(
                table
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(lock)
                    .copied()
                    .unwrap_or_default(),
            ),
        }
    }
}
