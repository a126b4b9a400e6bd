//! Distributed lock coordinator.
//!
//! One table of [`ServerLock`]s behind a mutex. Every operation computes the
//! resulting [`LockResponse`]s under the lock and hands them to the
//! [`LockResponseSink`] only after the table lock is dropped, so a sink that
//! blocks on a slow connection never stalls other lock traffic.

mod server_lock;
pub mod stats;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::core::{
    ClientId, ErrorPayload, LockContext, LockId, LockLevel, LockOutcome, LockOwner, LockResponse,
    NotifiedWaiters, NotifyKind, ProtocolErrorCode, ThreadId,
};
use crate::daemon::events::{CoordinatorEvent, EventHandler};
use crate::error::{Effect, Transience};

use server_lock::{AcquireOutcome, Grant, ServerLock};
pub use stats::{LockCounts, LockStats, LockStatsMode};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("{owner:?} does not hold {lock}")]
    NotHeld { lock: LockId, owner: LockOwner },
    #[error("{owner:?} holds {lock} for read and may not upgrade to write")]
    UpgradeRefused { lock: LockId, owner: LockOwner },
    #[error("{owner:?} is waiting on {lock}")]
    AlreadyWaiting { lock: LockId, owner: LockOwner },
    #[error("notify on {lock} from {owner:?} which did not hold it")]
    NotifyWithoutHold { lock: LockId, owner: LockOwner },
}

impl LockError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }

    pub fn as_error_payload(&self) -> ErrorPayload {
        ErrorPayload::new(ProtocolErrorCode::LockProtocol, self.to_string(), false)
    }
}

/// Delivers lock responses to clients.
pub trait LockResponseSink: Send + Sync {
    fn deliver(&self, client: ClientId, response: LockResponse);
}

/// Result of a blocking acquire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    /// Awarded immediately.
    Now,
    /// Queued; an award follows through the response sink.
    Later,
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<LockId, ServerLock>,
    by_client: HashMap<ClientId, BTreeSet<LockId>>,
}

impl LockTable {
    fn entry(&mut self, lock: &LockId, client: ClientId) -> &mut ServerLock {
        self.by_client
            .entry(client)
            .or_default()
            .insert(lock.clone());
        self.locks
            .entry(lock.clone())
            .or_insert_with(|| ServerLock::new(lock.clone()))
    }

    /// Drops `lock` if idle, and every client index entry for it that no
    /// longer matches the lock's state.
    fn tidy(&mut self, lock: &LockId) {
        if self.locks.get(lock).is_some_and(ServerLock::is_idle) {
            self.locks.remove(lock);
        }
        let locks = &self.locks;
        self.by_client.retain(|client, held| {
            if held.contains(lock) {
                let still = locks.get(lock).is_some_and(|s| s.involves_client(*client));
                if !still {
                    held.remove(lock);
                }
            }
            !held.is_empty()
        });
    }
}

pub struct LockCoordinator {
    table: Mutex<LockTable>,
    sink: Arc<dyn LockResponseSink>,
    stats: LockStats,
}

struct Outbox {
    responses: Vec<(ClientId, LockResponse)>,
}

impl Outbox {
    fn new() -> Self {
        Self {
            responses: Vec::new(),
        }
    }

    fn push(&mut self, lock: &LockId, owner: LockOwner, level: LockLevel, outcome: LockOutcome) {
        self.responses.push((
            owner.client,
            LockResponse {
                lock: lock.clone(),
                thread: owner.thread,
                level,
                outcome,
            },
        ));
    }

    fn grants(&mut self, lock: &LockId, grants: Vec<Grant>, stats: &LockStats) {
        for grant in grants {
            stats.record_grant(lock);
            self.push(lock, grant.owner, grant.level, LockOutcome::Awarded);
        }
    }
}

impl LockCoordinator {
    pub fn new(sink: Arc<dyn LockResponseSink>, stats: LockStats) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            sink,
            stats,
        }
    }

    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    fn lock_table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self, outbox: Outbox) {
        for (client, response) in outbox.responses {
            tracing::trace!(
                %client,
                lock = %response.lock,
                thread = %response.thread,
                outcome = response.outcome.as_str(),
                "lock response"
            );
            self.sink.deliver(client, response);
        }
    }

    pub fn acquire(
        &self,
        lock: &LockId,
        client: ClientId,
        thread: ThreadId,
        level: LockLevel,
    ) -> Result<Acquired, LockError> {
        let owner = LockOwner::new(client, thread);
        let mut outbox = Outbox::new();
        let result = {
            let mut table = self.lock_table();
            let outcome = table.entry(lock, client).acquire(owner, level);
            table.tidy(lock);
            match outcome? {
                AcquireOutcome::Granted => {
                    outbox.grants(lock, vec![Grant { owner, level }], &self.stats);
                    Acquired::Now
                }
                AcquireOutcome::Queued => {
                    self.stats.record_contended(lock);
                    Acquired::Later
                }
                AcquireOutcome::AlreadyQueued => Acquired::Later,
            }
        };
        self.flush(outbox);
        Ok(result)
    }

    /// Never queues. The outcome is also sent through the sink.
    pub fn try_acquire(
        &self,
        lock: &LockId,
        client: ClientId,
        thread: ThreadId,
        level: LockLevel,
    ) -> Result<bool, LockError> {
        let owner = LockOwner::new(client, thread);
        let mut outbox = Outbox::new();
        let granted = {
            let mut table = self.lock_table();
            let granted = table.entry(lock, client).try_acquire(owner, level);
            table.tidy(lock);
            granted?
        };
        if granted {
            outbox.grants(lock, vec![Grant { owner, level }], &self.stats);
        } else {
            self.stats.record_contended(lock);
            outbox.push(lock, owner, level, LockOutcome::Refused);
        }
        self.flush(outbox);
        Ok(granted)
    }

    pub fn release(&self, lock: &LockId, client: ClientId, thread: ThreadId) -> Result<(), LockError> {
        let owner = LockOwner::new(client, thread);
        let mut outbox = Outbox::new();
        {
            let mut table = self.lock_table();
            let Some(state) = table.locks.get_mut(lock) else {
                return Err(LockError::NotHeld {
                    lock: lock.clone(),
                    owner,
                });
            };
            let grants = state.release(owner)?;
            outbox.grants(lock, grants, &self.stats);
            table.tidy(lock);
        }
        self.flush(outbox);
        Ok(())
    }

    /// Releases the hold and parks the thread until notified or until
    /// `deadline_ms` passes.
    pub fn wait(
        &self,
        lock: &LockId,
        client: ClientId,
        thread: ThreadId,
        deadline_ms: Option<u64>,
    ) -> Result<(), LockError> {
        let owner = LockOwner::new(client, thread);
        let mut outbox = Outbox::new();
        {
            let mut table = self.lock_table();
            let Some(state) = table.locks.get_mut(lock) else {
                return Err(LockError::NotHeld {
                    lock: lock.clone(),
                    owner,
                });
            };
            let grants = state.wait(owner, deadline_ms)?;
            outbox.grants(lock, grants, &self.stats);
        }
        self.flush(outbox);
        Ok(())
    }

    /// Moves waiters into the re-acquire queue and records them in `acc`.
    ///
    /// The moved waiters stay blocked until [`arm_notified`] is called with
    /// the same accumulator. Whether the notifier held the lock is checked by
    /// the caller against the transaction's lock set.
    ///
    /// [`arm_notified`]: LockCoordinator::arm_notified
    pub fn notify(
        &self,
        lock: &LockId,
        from_client: ClientId,
        from_thread: ThreadId,
        kind: NotifyKind,
        acc: &mut NotifiedWaiters,
    ) -> usize {
        let moved = {
            let mut table = self.lock_table();
            match table.locks.get_mut(lock) {
                Some(state) => state.notify(kind, acc),
                None => 0,
            }
        };
        tracing::debug!(
            %lock,
            client = %from_client,
            thread = %from_thread,
            kind = kind.as_str(),
            moved,
            "notify"
        );
        if moved > 0 {
            self.stats.record_notify(lock, moved);
        }
        moved
    }

    /// Lets notified waiters compete for their locks again.
    pub fn arm_notified(&self, notified: &NotifiedWaiters) {
        if notified.is_empty() {
            return;
        }
        let mut outbox = Outbox::new();
        {
            let mut table = self.lock_table();
            for (client, waiter) in notified.iter() {
                let owner = LockOwner::new(client, waiter.thread);
                if let Some(state) = table.locks.get_mut(&waiter.lock) {
                    let grants = state.arm(owner);
                    outbox.grants(&waiter.lock, grants, &self.stats);
                }
            }
        }
        self.flush(outbox);
    }

    /// Cancels a pending acquire. Returns whether one was pending.
    pub fn cancel(&self, lock: &LockId, client: ClientId, thread: ThreadId) -> bool {
        let owner = LockOwner::new(client, thread);
        let mut outbox = Outbox::new();
        let cancelled = {
            let mut table = self.lock_table();
            let Some(state) = table.locks.get_mut(lock) else {
                return false;
            };
            let (cancelled, grants) = state.cancel(owner);
            if let Some(level) = cancelled {
                outbox.push(lock, owner, level, LockOutcome::Cancelled);
            }
            outbox.grants(lock, grants, &self.stats);
            table.tidy(lock);
            cancelled.is_some()
        };
        self.flush(outbox);
        cancelled
    }

    pub fn expire_waits(&self, now_ms: u64) {
        let mut outbox = Outbox::new();
        {
            let mut table = self.lock_table();
            for (id, state) in table.locks.iter_mut() {
                let grants = state.expire_waits(now_ms);
                outbox.grants(id, grants, &self.stats);
            }
        }
        self.flush(outbox);
    }

    /// Drops every hold, queued request and wait of `client`.
    pub fn client_disconnected(&self, client: ClientId) {
        let mut outbox = Outbox::new();
        {
            let mut table = self.lock_table();
            let locks = table.by_client.remove(&client).unwrap_or_default();
            for lock in &locks {
                if let Some(state) = table.locks.get_mut(lock) {
                    let grants = state.remove_client(client);
                    outbox.grants(lock, grants, &self.stats);
                }
                table.tidy(lock);
            }
            if !locks.is_empty() {
                tracing::debug!(%client, locks = locks.len(), "released locks of departed client");
            }
        }
        self.flush(outbox);
    }

    /// Rebuilds `client`'s lock state from its handshake and drops anything
    /// the server remembers that the client no longer reports.
    pub fn reestablish(&self, client: ClientId, contexts: ReportedLocks<'_>, now_ms: u64) {
        let mut outbox = Outbox::new();
        {
            let mut table = self.lock_table();
            let reported: BTreeSet<(LockId, ThreadId)> = contexts
                .all()
                .map(|ctx| (ctx.lock.clone(), ctx.thread))
                .collect();

            let known = table.by_client.get(&client).cloned().unwrap_or_default();
            for lock in &known {
                if let Some(state) = table.locks.get_mut(lock) {
                    let stale: Vec<LockOwner> = state
                        .client_owners(client)
                        .filter(|owner| !reported.contains(&(lock.clone(), owner.thread)))
                        .collect();
                    for owner in stale {
                        let grants = state.remove_owner(owner);
                        outbox.grants(lock, grants, &self.stats);
                    }
                }
                table.tidy(lock);
            }

            for ctx in contexts.held {
                let owner = LockOwner::new(client, ctx.thread);
                // No award is sent: the client already believes it holds these.
                let grants = table.entry(&ctx.lock, client).reestablish_held(owner, ctx.level);
                for _ in grants {
                    self.stats.record_grant(&ctx.lock);
                }
            }
            for ctx in contexts.waiting {
                let owner = LockOwner::new(client, ctx.thread);
                let deadline = ctx.timeout_ms.map(|t| now_ms.saturating_add(t));
                table
                    .entry(&ctx.lock, client)
                    .reestablish_wait(owner, ctx.level, deadline);
            }
            for ctx in contexts.pending {
                let owner = LockOwner::new(client, ctx.thread);
                let grants = table
                    .entry(&ctx.lock, client)
                    .reestablish_pending(owner, ctx.level);
                outbox.grants(&ctx.lock, grants, &self.stats);
            }
            for ctx in contexts.pending_try {
                let owner = LockOwner::new(client, ctx.thread);
                match table.entry(&ctx.lock, client).try_acquire(owner, ctx.level) {
                    Ok(true) => {
                        let grant = Grant {
                            owner,
                            level: ctx.level,
                        };
                        outbox.grants(&ctx.lock, vec![grant], &self.stats);
                    }
                    Ok(false) => outbox.push(&ctx.lock, owner, ctx.level, LockOutcome::Refused),
                    Err(err) => {
                        tracing::warn!(
                            %client,
                            lock = %ctx.lock,
                            thread = %ctx.thread,
                            error = %err,
                            code = err.as_error_payload().code.as_str(),
                            "pending try-lock refused during handshake"
                        );
                        outbox.push(&ctx.lock, owner, ctx.level, LockOutcome::Refused);
                    }
                }
                table.tidy(&ctx.lock);
            }
        }
        self.flush(outbox);
    }

    pub fn holders(&self, lock: &LockId) -> Vec<(LockOwner, LockLevel)> {
        self.lock_table()
            .locks
            .get(lock)
            .map(ServerLock::holders)
            .unwrap_or_default()
    }

    pub fn hold_count(&self, lock: &LockId, client: ClientId, thread: ThreadId) -> u32 {
        self.lock_table()
            .locks
            .get(lock)
            .map_or(0, |s| s.hold_count(LockOwner::new(client, thread)))
    }

    pub fn queue_len(&self, lock: &LockId) -> usize {
        self.lock_table().locks.get(lock).map_or(0, ServerLock::queue_len)
    }

    pub fn waiter_count(&self, lock: &LockId) -> usize {
        self.lock_table()
            .locks
            .get(lock)
            .map_or(0, ServerLock::waiter_count)
    }

    /// Number of locks with any state at all.
    pub fn lock_count(&self) -> usize {
        self.lock_table().locks.len()
    }
}

impl EventHandler for LockCoordinator {
    fn handle(&self, event: &CoordinatorEvent) {
        if let CoordinatorEvent::ClientDisconnected { client } = event {
            self.client_disconnected(*client);
        }
    }
}

/// Lock contexts a client reports during handshake.
#[derive(Clone, Copy, Debug)]
pub struct ReportedLocks<'a> {
    pub held: &'a [LockContext],
    pub waiting: &'a [LockContext],
    pub pending: &'a [LockContext],
    pub pending_try: &'a [LockContext],
}

impl<'a> ReportedLocks<'a> {
    fn all(self) -> impl Iterator<Item = &'a LockContext> {
        self.held
            .iter()
            .chain(self.waiting)
            .chain(self.pending)
            .chain(self.pending_try)
    }
}
