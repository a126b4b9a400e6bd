//! Identity atoms.
//!
//! Every id on the wire is a plain `u64` wrapped in a newtype so that a
//! `TransactionId` can never be passed where a `SequenceId` is expected.
//! Channel sessions are the exception: they are random UUIDs minted by the
//! connecting endpoint so a resuming transport can find its session again.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! u64_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

u64_id!(
    /// Identity of a connected client node. Stable across reconnects.
    ClientId,
    "client-"
);
u64_id!(
    /// A thread within a client; lock ownership is per (client, thread).
    ThreadId,
    "thread-"
);
u64_id!(
    /// Per-client monotonic transaction number; defines apply order.
    TransactionId,
    "txn-"
);
u64_id!(
    /// Per-client monotonic counter used to diff resent transactions after a
    /// reconnect. Zero is never a valid sequence id.
    SequenceId,
    "seq-"
);
u64_id!(
    /// Server-assigned commit order across all clients.
    GlobalTransactionId,
    "gid-"
);
u64_id!(ObjectId, "obj-");
u64_id!(
    /// Server-side handle for one logical connection (a channel session,
    /// possibly spanning several transports).
    ConnectionId,
    "conn-"
);
u64_id!(TxnBatchId, "batch-");

impl SequenceId {
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl TransactionId {
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Identity of one sequenced channel session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelSessionId(Uuid);

impl ChannelSessionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for ChannelSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelSessionId({})", self.0)
    }
}

impl fmt::Display for ChannelSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open range `[start, end)` of fresh object ids handed to one client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIdRange {
    pub start: ObjectId,
    pub end: ObjectId,
}

impl ObjectIdRange {
    pub fn len(&self) -> u64 {
        self.end.get().saturating_sub(self.start.get())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        id >= self.start && id < self.end
    }
}
