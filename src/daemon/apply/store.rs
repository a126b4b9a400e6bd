//! Object store seam used by the apply stage.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use thiserror::Error;

use crate::core::{ObjectId, ServerTransaction};
use crate::error::{Effect, Transience};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    #[error("object {0} already exists")]
    ObjectExists(ObjectId),
    #[error("object {0} does not exist")]
    ObjectMissing(ObjectId),
    #[error("persistence transaction already finished")]
    Finished,
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Backend(_) => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

pub trait ObjectStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn PersistenceTransaction>, StoreError>;
}

/// One atomic unit of object mutation.
///
/// Dropping a transaction without calling [`commit`] discards it.
///
/// [`commit`]: PersistenceTransaction::commit
pub trait PersistenceTransaction: Send {
    fn apply_deltas(&mut self, txn: &ServerTransaction) -> Result<(), StoreError>;
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
    fn abort(self: Box<Self>);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub version: u64,
    pub state: Bytes,
}

/// In-memory store backing tests and the default server.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<RwLock<HashMap<ObjectId, StoredObject>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ObjectId) -> Option<StoredObject> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn begin(&self) -> Result<Box<dyn PersistenceTransaction>, StoreError> {
        Ok(Box::new(InMemoryTxn {
            objects: Arc::clone(&self.objects),
            staged: BTreeMap::new(),
            finished: false,
        }))
    }
}

#[derive(Clone, Debug)]
struct StagedWrite {
    new_object: bool,
    state: Bytes,
}

struct InMemoryTxn {
    objects: Arc<RwLock<HashMap<ObjectId, StoredObject>>>,
    staged: BTreeMap<ObjectId, StagedWrite>,
    finished: bool,
}

impl InMemoryTxn {
    fn check(
        objects: &HashMap<ObjectId, StoredObject>,
        staged: &BTreeMap<ObjectId, StagedWrite>,
        id: ObjectId,
        new_object: bool,
    ) -> Result<(), StoreError> {
        let exists = objects.contains_key(&id) || staged.contains_key(&id);
        match (new_object, exists) {
            (true, true) => Err(StoreError::ObjectExists(id)),
            (false, false) => Err(StoreError::ObjectMissing(id)),
            _ => Ok(()),
        }
    }
}

impl PersistenceTransaction for InMemoryTxn {
    fn apply_deltas(&mut self, txn: &ServerTransaction) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::Finished);
        }
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        for delta in &txn.deltas {
            Self::check(&objects, &self.staged, delta.object_id, delta.new_object)?;
            let new_object = delta.new_object
                || self
                    .staged
                    .get(&delta.object_id)
                    .is_some_and(|w| w.new_object);
            self.staged.insert(
                delta.object_id,
                StagedWrite {
                    new_object,
                    state: delta.payload.clone(),
                },
            );
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::Finished);
        }
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        // Another worker may have committed since the deltas were staged.
        for (id, write) in &self.staged {
            let exists = objects.contains_key(id);
            if write.new_object && exists {
                return Err(StoreError::ObjectExists(*id));
            }
            if !write.new_object && !exists {
                return Err(StoreError::ObjectMissing(*id));
            }
        }
        for (id, write) in std::mem::take(&mut self.staged) {
            let version = objects.get(&id).map_or(1, |o| o.version + 1);
            objects.insert(
                id,
                StoredObject {
                    version,
                    state: write.state,
                },
            );
        }
        self.finished = true;
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        self.staged.clear();
        self.finished = true;
    }
}

impl Drop for InMemoryTxn {
    fn drop(&mut self) {
        if !self.finished && !self.staged.is_empty() {
            tracing::debug!(staged = self.staged.len(), "discarding uncommitted store transaction");
        }
    }
}
