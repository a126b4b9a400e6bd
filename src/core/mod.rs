//! Core domain types.
//!
//! - identity: id newtypes (clients, transactions, objects, sessions)
//! - lock: lock names, levels, owners, notify bookkeeping
//! - txn: transactions and object deltas
//! - version: product version compatibility
//! - error: error payloads sent to peers
//! - limits: protocol limits and timers

pub mod error;
pub mod identity;
pub mod limits;
pub mod lock;
pub mod txn;
pub mod version;

pub use error::{ErrorPayload, ProtocolErrorCode};
pub use identity::{
    ChannelSessionId, ClientId, ConnectionId, GlobalTransactionId, ObjectId, ObjectIdRange,
    SequenceId, ThreadId, TransactionId, TxnBatchId,
};
pub use limits::Limits;
pub use lock::{
    LockContext, LockId, LockLevel, LockOutcome, LockOwner, LockResponse, NotifiedWaiter,
    NotifiedWaiters, NotifyKind,
};
pub use txn::{
    NotifyRequest, ObjectDelta, ServerTransaction, TransactionBatch, TxnRecord, TxnType,
};
pub use version::{ProductVersion, UNKNOWN_VERSION};
