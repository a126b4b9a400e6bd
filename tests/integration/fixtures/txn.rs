//! Builders for client transactions and handshakes.

use bytes::Bytes;

use dso_l2::core::{
    LockContext, NotifyRequest, ObjectDelta, TransactionBatch, TxnBatchId, TxnRecord, TxnType,
};
use dso_l2::daemon::proto::ClientHandshake;
use dso_l2::{ClientId, LockId, ObjectId, SequenceId, TransactionId};

pub fn record(n: u64) -> TxnRecord {
    TxnRecord {
        txn_id: TransactionId::new(n),
        sequence_id: SequenceId::new(n),
        lock_ids: Vec::new(),
        deltas: Vec::new(),
        notifies: Vec::new(),
        txn_type: TxnType::Normal,
    }
}

pub fn create(n: u64, object: u64, body: &'static [u8]) -> TxnRecord {
    with_delta(record(n), object, true, body)
}

pub fn update(n: u64, object: u64, body: &'static [u8]) -> TxnRecord {
    with_delta(record(n), object, false, body)
}

fn with_delta(mut record: TxnRecord, object: u64, new_object: bool, body: &'static [u8]) -> TxnRecord {
    record.deltas.push(ObjectDelta {
        object_id: ObjectId::new(object),
        new_object,
        payload: Bytes::from_static(body),
    });
    record
}

pub fn notifying(mut record: TxnRecord, held: LockId, notify: NotifyRequest) -> TxnRecord {
    record.lock_ids.push(held);
    record.notifies.push(notify);
    record
}

pub fn batch(records: Vec<TxnRecord>) -> TransactionBatch {
    let id = records.first().map_or(0, |r| r.sequence_id.get());
    TransactionBatch {
        batch_id: TxnBatchId::new(id),
        transactions: records,
    }
}

pub fn handshake(client: u64, version: &str) -> ClientHandshake {
    ClientHandshake {
        client_id: ClientId::new(client),
        client_version: version.to_string(),
        object_ids: Vec::new(),
        lock_contexts: Vec::new(),
        wait_contexts: Vec::new(),
        pending_lock_contexts: Vec::new(),
        pending_try_lock_contexts: Vec::new(),
        resent_sequence_ids: Vec::new(),
        resent_txn_ids: Vec::new(),
        request_object_ids: false,
    }
}

pub fn interested_in(mut handshake: ClientHandshake, objects: &[u64]) -> ClientHandshake {
    handshake.object_ids = objects.iter().copied().map(ObjectId::new).collect();
    handshake
}

pub fn holding(mut handshake: ClientHandshake, locks: Vec<LockContext>) -> ClientHandshake {
    handshake.lock_contexts = locks;
    handshake
}

pub fn resending(mut handshake: ClientHandshake, seqs: &[u64]) -> ClientHandshake {
    handshake.resent_sequence_ids = seqs.iter().copied().map(SequenceId::new).collect();
    handshake.resent_txn_ids = seqs.iter().copied().map(TransactionId::new).collect();
    handshake
}
