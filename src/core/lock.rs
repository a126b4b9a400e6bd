//! Distributed lock vocabulary shared by the wire protocol, the handshake and
//! the lock coordinator.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::identity::{ClientId, ObjectId, ThreadId};

/// Name of a distributed lock.
///
/// Applications lock either a string name or the monitor of a shared object.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockId {
    Named(String),
    Object(ObjectId),
}

impl LockId {
    pub fn named(name: impl Into<String>) -> Self {
        LockId::Named(name.into())
    }
}

impl fmt::Debug for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockId::Named(name) => write!(f, "LockId({name:?})"),
            LockId::Object(id) => write!(f, "LockId({id})"),
        }
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockId::Named(name) => write!(f, "{name}"),
            LockId::Object(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockLevel {
    Read,
    Write,
}

impl LockLevel {
    /// Read/read is the only compatible pair.
    pub fn compatible_with(self, other: LockLevel) -> bool {
        matches!((self, other), (LockLevel::Read, LockLevel::Read))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LockLevel::Read => "read",
            LockLevel::Write => "write",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "read" => Some(LockLevel::Read),
            "write" => Some(LockLevel::Write),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    One,
    All,
}

impl NotifyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyKind::One => "one",
            NotifyKind::All => "all",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "one" => Some(NotifyKind::One),
            "all" => Some(NotifyKind::All),
            _ => None,
        }
    }
}

/// A (client, thread) pair: the unit of lock ownership.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    pub client: ClientId,
    pub thread: ThreadId,
}

impl LockOwner {
    pub fn new(client: ClientId, thread: ThreadId) -> Self {
        Self { client, thread }
    }
}

impl fmt::Debug for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client, self.thread)
    }
}

/// One lock context as reported by a client during handshake.
///
/// `timeout_ms` is only meaningful for wait contexts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockContext {
    pub lock: LockId,
    pub thread: ThreadId,
    pub level: LockLevel,
    pub timeout_ms: Option<u64>,
}

impl LockContext {
    pub fn new(lock: LockId, thread: ThreadId, level: LockLevel) -> Self {
        Self {
            lock,
            thread,
            level,
            timeout_ms: None,
        }
    }
}

/// A waiter moved to the re-acquire queue by a notify.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotifiedWaiter {
    pub lock: LockId,
    pub thread: ThreadId,
    pub level: LockLevel,
}

/// Accumulates the waiters released by the notifies of one transaction,
/// keyed by the client that owns them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotifiedWaiters {
    by_client: BTreeMap<ClientId, Vec<NotifiedWaiter>>,
}

impl NotifiedWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, client: ClientId, waiter: NotifiedWaiter) {
        self.by_client.entry(client).or_default().push(waiter);
    }

    pub fn for_client(&self, client: ClientId) -> &[NotifiedWaiter] {
        self.by_client
            .get(&client)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.by_client.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &NotifiedWaiter)> + '_ {
        self.by_client
            .iter()
            .flat_map(|(client, waiters)| waiters.iter().map(move |w| (*client, w)))
    }

    pub fn len(&self) -> usize {
        self.by_client.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Awarded,
    Refused,
    Cancelled,
}

impl LockOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            LockOutcome::Awarded => "awarded",
            LockOutcome::Refused => "refused",
            LockOutcome::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "awarded" => Some(LockOutcome::Awarded),
            "refused" => Some(LockOutcome::Refused),
            "cancelled" => Some(LockOutcome::Cancelled),
            _ => None,
        }
    }
}

/// Server to client answer for a lock request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockResponse {
    pub lock: LockId,
    pub thread: ThreadId,
    pub level: LockLevel,
    pub outcome: LockOutcome,
}
