//! Fresh object id ranges for clients.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ClientId, ErrorPayload, ObjectId, ObjectIdRange, ProtocolErrorCode};
use crate::error::{Effect, Transience};

/// The id space cannot hold another range of the requested size.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("object id space exhausted: {requested} ids requested at {next}")]
pub struct ObjectIdsExhausted {
    pub next: u64,
    pub requested: u64,
}

impl ObjectIdsExhausted {
    pub fn code(&self) -> ProtocolErrorCode {
        ProtocolErrorCode::Internal
    }

    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }

    pub fn as_error_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string(), false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectIdConfig {
    /// Ids handed out per request when the client does not ask for a count.
    pub batch_size: u64,
    /// Largest range a single request may receive.
    pub max_batch_size: u64,
    pub first_id: u64,
}

impl Default for ObjectIdConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            max_batch_size: 100_000,
            first_id: 1,
        }
    }
}

pub struct ObjectIdAllocator {
    next: Mutex<u64>,
    batch_size: u64,
    max_batch_size: u64,
}

impl ObjectIdAllocator {
    pub fn new(config: &ObjectIdConfig) -> Self {
        let batch_size = config.batch_size.max(1);
        Self {
            next: Mutex::new(config.first_id.max(1)),
            batch_size,
            max_batch_size: config.max_batch_size.max(batch_size),
        }
    }

    pub fn issue(&self, client: ClientId) -> Result<ObjectIdRange, ObjectIdsExhausted> {
        self.issue_count(client, self.batch_size)
    }

    /// Issues `count` ids, clamped to the configured maximum. Zero means the
    /// default batch size. Nothing is consumed when the range would run past
    /// the end of the id space.
    pub fn issue_count(
        &self,
        client: ClientId,
        count: u64,
    ) -> Result<ObjectIdRange, ObjectIdsExhausted> {
        let count = match count {
            0 => self.batch_size,
            n => n.min(self.max_batch_size),
        };
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let start = *next;
        let end = start.checked_add(count).ok_or(ObjectIdsExhausted {
            next: start,
            requested: count,
        })?;
        *next = end;
        tracing::debug!(%client, start, end, "issued object ids");
        Ok(ObjectIdRange {
            start: ObjectId::new(start),
            end: ObjectId::new(end),
        })
    }

    /// First id that has not been handed out yet.
    pub fn peek_next(&self) -> ObjectId {
        ObjectId::new(*self.next.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
