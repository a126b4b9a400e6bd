//! Object store whose commits can be made to fail on demand.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dso_l2::core::ServerTransaction;
use dso_l2::daemon::{InMemoryObjectStore, ObjectStore, PersistenceTransaction, StoreError};

#[derive(Clone, Default)]
pub struct FailingStore {
    pub inner: InMemoryObjectStore,
    fail_commits: Arc<AtomicBool>,
}

impl FailingStore {
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

impl ObjectStore for FailingStore {
    fn begin(&self) -> Result<Box<dyn PersistenceTransaction>, StoreError> {
        Ok(Box::new(FailingTxn {
            inner: self.inner.begin()?,
            fail: self.fail_commits.load(Ordering::SeqCst),
        }))
    }
}

struct FailingTxn {
    inner: Box<dyn PersistenceTransaction>,
    fail: bool,
}

impl PersistenceTransaction for FailingTxn {
    fn apply_deltas(&mut self, txn: &ServerTransaction) -> Result<(), StoreError> {
        self.inner.apply_deltas(txn)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.fail {
            self.inner.abort();
            return Err(StoreError::Backend("injected commit failure".to_string()));
        }
        self.inner.commit()
    }

    fn abort(self: Box<Self>) {
        self.inner.abort();
    }
}
