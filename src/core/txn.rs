//! Transactions as submitted by clients and as carried through the apply
//! pipeline.

use std::collections::BTreeSet;

use bytes::Bytes;

use super::identity::{ClientId, ObjectId, SequenceId, ThreadId, TransactionId, TxnBatchId};
use super::lock::{LockId, NotifyKind};

/// A single object mutation. The payload is opaque to the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectDelta {
    pub object_id: ObjectId,
    pub new_object: bool,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotifyRequest {
    pub lock: LockId,
    pub thread: ThreadId,
    pub kind: NotifyKind,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TxnType {
    #[default]
    Normal,
    /// Resubmitted by a client while recovering after a reconnect.
    Recovery,
    /// Replicated state from an active peer; applied and logged only.
    PassiveSync,
}

impl TxnType {
    pub fn as_str(self) -> &'static str {
        match self {
            TxnType::Normal => "normal",
            TxnType::Recovery => "recovery",
            TxnType::PassiveSync => "passive_sync",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "normal" => Some(TxnType::Normal),
            "recovery" => Some(TxnType::Recovery),
            "passive_sync" => Some(TxnType::PassiveSync),
            _ => None,
        }
    }
}

/// A transaction exactly as a client submits it inside a commit batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnRecord {
    pub txn_id: TransactionId,
    pub sequence_id: SequenceId,
    pub lock_ids: Vec<LockId>,
    pub deltas: Vec<ObjectDelta>,
    pub notifies: Vec<NotifyRequest>,
    pub txn_type: TxnType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionBatch {
    pub batch_id: TxnBatchId,
    pub transactions: Vec<TxnRecord>,
}

/// Immutable server-side view of one client transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerTransaction {
    pub origin: ClientId,
    pub batch_id: TxnBatchId,
    pub txn_id: TransactionId,
    pub sequence_id: SequenceId,
    pub lock_ids: Vec<LockId>,
    pub deltas: Vec<ObjectDelta>,
    pub notifies: Vec<NotifyRequest>,
    pub txn_type: TxnType,
}

impl ServerTransaction {
    pub fn new(origin: ClientId, batch_id: TxnBatchId, record: TxnRecord) -> Self {
        Self {
            origin,
            batch_id,
            txn_id: record.txn_id,
            sequence_id: record.sequence_id,
            lock_ids: record.lock_ids,
            deltas: record.deltas,
            notifies: record.notifies,
            txn_type: record.txn_type,
        }
    }

    /// No deltas and no notifies. Still a valid pipeline input.
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.notifies.is_empty()
    }

    pub fn object_ids(&self) -> BTreeSet<ObjectId> {
        self.deltas.iter().map(|delta| delta.object_id).collect()
    }

    pub fn holds_lock(&self, lock: &LockId) -> bool {
        self.lock_ids.iter().any(|held| held == lock)
    }
}
