//! Per-client record of applied transactions.
//!
//! Each client's transactions are applied strictly in order, so the log only
//! needs the first and highest applied [`SequenceId`] to answer whether a
//! resent transaction was already applied. Records outlive connections: a
//! client that reconnects under the same identity is diffed against them.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

use crate::core::error::details::SequenceViolationDetails;
use crate::core::{ClientId, ErrorPayload, ProtocolErrorCode, SequenceId, TransactionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceStatus {
    Applied,
    Pending,
    Invalid,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientLog {
    pub first: Option<SequenceId>,
    pub highest: Option<SequenceId>,
    pub last_txn_id: Option<TransactionId>,
    pub applied: u64,
}

impl ClientLog {
    fn classify(&self, seq: SequenceId) -> SequenceStatus {
        if seq.get() == 0 {
            return SequenceStatus::Invalid;
        }
        match (self.first, self.highest) {
            (Some(first), _) if seq < first => SequenceStatus::Invalid,
            (_, Some(highest)) if seq <= highest => SequenceStatus::Applied,
            _ => SequenceStatus::Pending,
        }
    }
}

/// Result of comparing a client's resent sequence ids with the log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResendDiff {
    pub acknowledged: Vec<SequenceId>,
    pub pending: Vec<SequenceId>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResendViolation {
    #[error("sequence id 0 is never valid")]
    Zero,
    #[error("resent sequence ids are not increasing: {got} after {prev}")]
    NotIncreasing { prev: SequenceId, got: SequenceId },
    #[error("{got} predates the first logged sequence id {first}")]
    BeforeLog { first: SequenceId, got: SequenceId },
    #[error("gap in resent sequence ids: expected {expected}, got {got}")]
    Gap { expected: SequenceId, got: SequenceId },
}

impl ResendViolation {
    pub fn as_error_payload(&self) -> ErrorPayload {
        let (expected_at_least, got) = match self {
            ResendViolation::Zero => (1, 0),
            ResendViolation::NotIncreasing { prev, got } => (prev.get() + 1, got.get()),
            ResendViolation::BeforeLog { first, got } => (first.get(), got.get()),
            ResendViolation::Gap { expected, got } => (expected.get(), got.get()),
        };
        ErrorPayload::new(ProtocolErrorCode::SequenceViolation, self.to_string(), false)
            .with_details(SequenceViolationDetails {
                expected_at_least,
                got,
            })
    }
}

#[derive(Default)]
pub struct TransactionLog {
    clients: RwLock<HashMap<ClientId, ClientLog>>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_applied(&self, client: ClientId, seq: SequenceId, txn_id: TransactionId) {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let log = clients.entry(client).or_default();
        log.first.get_or_insert(seq);
        log.highest = Some(log.highest.map_or(seq, |h| h.max(seq)));
        log.last_txn_id = Some(log.last_txn_id.map_or(txn_id, |t| t.max(txn_id)));
        log.applied += 1;
    }

    pub fn classify(&self, client: ClientId, seq: SequenceId) -> SequenceStatus {
        self.snapshot(client).unwrap_or_default().classify(seq)
    }

    pub fn is_applied(&self, client: ClientId, seq: SequenceId) -> bool {
        self.classify(client, seq) == SequenceStatus::Applied
    }

    pub fn last_txn_id(&self, client: ClientId) -> Option<TransactionId> {
        self.snapshot(client).and_then(|log| log.last_txn_id)
    }

    pub fn snapshot(&self, client: ClientId) -> Option<ClientLog> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client)
            .copied()
    }

    /// Splits resent sequence ids into already applied and still pending.
    ///
    /// The list must be strictly increasing, and its pending tail must be
    /// contiguous and start right after the highest applied id.
    pub fn diff(
        &self,
        client: ClientId,
        resent: &[SequenceId],
    ) -> Result<ResendDiff, ResendViolation> {
        let log = self.snapshot(client).unwrap_or_default();
        let mut diff = ResendDiff::default();
        let mut prev: Option<SequenceId> = None;
        for &seq in resent {
            if let Some(prev) = prev
                && seq <= prev
            {
                return Err(ResendViolation::NotIncreasing { prev, got: seq });
            }
            match log.classify(seq) {
                SequenceStatus::Invalid => {
                    return Err(match log.first {
                        Some(first) if seq.get() != 0 => {
                            ResendViolation::BeforeLog { first, got: seq }
                        }
                        _ => ResendViolation::Zero,
                    });
                }
                SequenceStatus::Applied => diff.acknowledged.push(seq),
                SequenceStatus::Pending => {
                    let expected = match diff.pending.last() {
                        Some(last) => Some(last.next()),
                        None => log.highest.map(SequenceId::next),
                    };
                    if let Some(expected) = expected
                        && seq != expected
                    {
                        return Err(ResendViolation::Gap { expected, got: seq });
                    }
                    diff.pending.push(seq);
                }
            }
            prev = Some(seq);
        }
        Ok(diff)
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
