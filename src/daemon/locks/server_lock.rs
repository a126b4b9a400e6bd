//! State of a single distributed lock: holders, the FIFO acquire queue and
//! the condition-wait set.

use std::collections::VecDeque;

use crate::core::{
    ClientId, LockId, LockLevel, LockOwner, NotifiedWaiter, NotifiedWaiters, NotifyKind,
};

use super::LockError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Grant {
    pub owner: LockOwner,
    pub level: LockLevel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AcquireOutcome {
    Granted,
    Queued,
    AlreadyQueued,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PendingKind {
    Fresh,
    /// A released waiter taking the lock back at its saved hold count.
    /// Unarmed entries block the queue until the notifying transaction has
    /// been broadcast.
    Reacquire { armed: bool, count: u32 },
}

#[derive(Clone, Copy, Debug)]
struct Pending {
    owner: LockOwner,
    level: LockLevel,
    kind: PendingKind,
}

#[derive(Clone, Copy, Debug)]
struct Holder {
    owner: LockOwner,
    level: LockLevel,
    count: u32,
}

#[derive(Clone, Copy, Debug)]
struct Waiter {
    owner: LockOwner,
    level: LockLevel,
    count: u32,
    deadline_ms: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct ServerLock {
    id: LockId,
    holders: Vec<Holder>,
    queue: VecDeque<Pending>,
    waiters: VecDeque<Waiter>,
}

impl ServerLock {
    pub fn new(id: LockId) -> Self {
        Self {
            id,
            holders: Vec::new(),
            queue: VecDeque::new(),
            waiters: VecDeque::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty() && self.waiters.is_empty()
    }

    pub fn holders(&self) -> Vec<(LockOwner, LockLevel)> {
        self.holders.iter().map(|h| (h.owner, h.level)).collect()
    }

    pub fn hold_count(&self, owner: LockOwner) -> u32 {
        self.holder(owner).map_or(0, |h| h.count)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Every (client, thread) of `client` with any state on this lock.
    pub fn client_owners(&self, client: ClientId) -> impl Iterator<Item = LockOwner> + '_ {
        let mut owners: Vec<LockOwner> = self
            .holders
            .iter()
            .map(|h| h.owner)
            .chain(self.queue.iter().map(|p| p.owner))
            .chain(self.waiters.iter().map(|w| w.owner))
            .filter(|owner| owner.client == client)
            .collect();
        owners.sort();
        owners.dedup();
        owners.into_iter()
    }

    pub fn involves_client(&self, client: ClientId) -> bool {
        self.holders.iter().any(|h| h.owner.client == client)
            || self.queue.iter().any(|p| p.owner.client == client)
            || self.waiters.iter().any(|w| w.owner.client == client)
    }

    fn holder(&self, owner: LockOwner) -> Option<&Holder> {
        self.holders.iter().find(|h| h.owner == owner)
    }

    fn holder_mut(&mut self, owner: LockOwner) -> Option<&mut Holder> {
        self.holders.iter_mut().find(|h| h.owner == owner)
    }

    fn is_queued(&self, owner: LockOwner) -> bool {
        self.queue.iter().any(|p| p.owner == owner)
    }

    fn is_waiting(&self, owner: LockOwner) -> bool {
        self.waiters.iter().any(|w| w.owner == owner)
    }

    fn compatible(&self, level: LockLevel) -> bool {
        self.holders.iter().all(|h| h.level.compatible_with(level))
    }

    /// Reentrant hold: a second acquire by a holder bumps its count.
    /// Read holders asking for write are refused, write holders may take a
    /// nested read.
    fn reenter(&mut self, owner: LockOwner, level: LockLevel) -> Result<bool, LockError> {
        let id = self.id.clone();
        match self.holder_mut(owner) {
            Some(held) if held.level == LockLevel::Read && level == LockLevel::Write => {
                Err(LockError::UpgradeRefused { lock: id, owner })
            }
            Some(held) => {
                held.count = held.count.saturating_add(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn acquire(&mut self, owner: LockOwner, level: LockLevel) -> Result<AcquireOutcome, LockError> {
        if self.reenter(owner, level)? {
            return Ok(AcquireOutcome::Granted);
        }
        if self.is_waiting(owner) {
            return Err(LockError::AlreadyWaiting {
                lock: self.id.clone(),
                owner,
            });
        }
        if self.is_queued(owner) {
            return Ok(AcquireOutcome::AlreadyQueued);
        }
        if self.queue.is_empty() && self.compatible(level) {
            self.holders.push(Holder {
                owner,
                level,
                count: 1,
            });
            return Ok(AcquireOutcome::Granted);
        }
        self.queue.push_back(Pending {
            owner,
            level,
            kind: PendingKind::Fresh,
        });
        Ok(AcquireOutcome::Queued)
    }

    pub fn try_acquire(&mut self, owner: LockOwner, level: LockLevel) -> Result<bool, LockError> {
        if self.reenter(owner, level)? {
            return Ok(true);
        }
        if self.is_waiting(owner) {
            return Err(LockError::AlreadyWaiting {
                lock: self.id.clone(),
                owner,
            });
        }
        if self.queue.is_empty() && self.compatible(level) {
            self.holders.push(Holder {
                owner,
                level,
                count: 1,
            });
            return Ok(true);
        }
        Ok(false)
    }

    pub fn release(&mut self, owner: LockOwner) -> Result<Vec<Grant>, LockError> {
        let Some(idx) = self.holders.iter().position(|h| h.owner == owner) else {
            return Err(LockError::NotHeld {
                lock: self.id.clone(),
                owner,
            });
        };
        let held = &mut self.holders[idx];
        held.count -= 1;
        if held.count > 0 {
            return Ok(Vec::new());
        }
        self.holders.remove(idx);
        Ok(self.grant_ready())
    }

    /// Gives up the hold entirely and joins the wait set.
    pub fn wait(&mut self, owner: LockOwner, deadline_ms: Option<u64>) -> Result<Vec<Grant>, LockError> {
        let Some(idx) = self.holders.iter().position(|h| h.owner == owner) else {
            return Err(LockError::NotHeld {
                lock: self.id.clone(),
                owner,
            });
        };
        let held = self.holders.remove(idx);
        self.waiters.push_back(Waiter {
            owner,
            level: held.level,
            count: held.count,
            deadline_ms,
        });
        Ok(self.grant_ready())
    }

    /// Moves waiters to the re-acquire queue and records them. Returns how
    /// many moved.
    pub fn notify(&mut self, kind: NotifyKind, acc: &mut NotifiedWaiters) -> usize {
        let moved: Vec<Waiter> = match kind {
            NotifyKind::One => self.waiters.pop_front().into_iter().collect(),
            NotifyKind::All => self.waiters.drain(..).collect(),
        };
        for waiter in &moved {
            self.queue.push_back(Pending {
                owner: waiter.owner,
                level: waiter.level,
                kind: PendingKind::Reacquire {
                    armed: false,
                    count: waiter.count,
                },
            });
            acc.record(
                waiter.owner.client,
                NotifiedWaiter {
                    lock: self.id.clone(),
                    thread: waiter.owner.thread,
                    level: waiter.level,
                },
            );
        }
        moved.len()
    }

    pub fn arm(&mut self, owner: LockOwner) -> Vec<Grant> {
        for pending in self.queue.iter_mut().filter(|p| p.owner == owner) {
            if let PendingKind::Reacquire { armed, .. } = &mut pending.kind {
                *armed = true;
            }
        }
        self.grant_ready()
    }

    /// Drops a fresh pending acquire, returning its level if there was one.
    pub fn cancel(&mut self, owner: LockOwner) -> (Option<LockLevel>, Vec<Grant>) {
        let Some(idx) = self
            .queue
            .iter()
            .position(|p| p.owner == owner && p.kind == PendingKind::Fresh)
        else {
            return (None, Vec::new());
        };
        let level = self.queue.remove(idx).map(|p| p.level);
        (level, self.grant_ready())
    }

    /// Timed waits past their deadline re-acquire as if notified.
    pub fn expire_waits(&mut self, now_ms: u64) -> Vec<Grant> {
        let mut expired = Vec::new();
        self.waiters.retain(|w| {
            let due = w.deadline_ms.is_some_and(|d| d <= now_ms);
            if due {
                expired.push(*w);
            }
            !due
        });
        if expired.is_empty() {
            return Vec::new();
        }
        for waiter in expired {
            self.queue.push_back(Pending {
                owner: waiter.owner,
                level: waiter.level,
                kind: PendingKind::Reacquire {
                    armed: true,
                    count: waiter.count,
                },
            });
        }
        self.grant_ready()
    }

    /// Removes every trace of `owner`, then grants whoever became eligible.
    pub fn remove_owner(&mut self, owner: LockOwner) -> Vec<Grant> {
        self.holders.retain(|h| h.owner != owner);
        self.queue.retain(|p| p.owner != owner);
        self.waiters.retain(|w| w.owner != owner);
        self.grant_ready()
    }

    pub fn remove_client(&mut self, client: ClientId) -> Vec<Grant> {
        self.holders.retain(|h| h.owner.client != client);
        self.queue.retain(|p| p.owner.client != client);
        self.waiters.retain(|w| w.owner.client != client);
        self.grant_ready()
    }

    /// A reconnecting client reports it holds this lock.
    ///
    /// Already held is a no-op. Otherwise the hold is granted if compatible
    /// with current holders, or queued ahead of everyone else.
    pub fn reestablish_held(&mut self, owner: LockOwner, level: LockLevel) -> Vec<Grant> {
        if self.holder(owner).is_some() {
            return Vec::new();
        }
        self.queue.retain(|p| p.owner != owner);
        self.waiters.retain(|w| w.owner != owner);
        if self.compatible(level) {
            self.holders.push(Holder {
                owner,
                level,
                count: 1,
            });
            return vec![Grant { owner, level }];
        }
        self.queue.push_front(Pending {
            owner,
            level,
            kind: PendingKind::Reacquire {
                armed: true,
                count: 1,
            },
        });
        Vec::new()
    }

    /// A reconnecting client reports a pending acquire.
    pub fn reestablish_pending(&mut self, owner: LockOwner, level: LockLevel) -> Vec<Grant> {
        if let Some(held) = self.holder(owner) {
            // Granted while the client was away; repeat the award.
            return vec![Grant {
                owner,
                level: held.level,
            }];
        }
        if self.is_queued(owner) {
            return Vec::new();
        }
        self.waiters.retain(|w| w.owner != owner);
        self.queue.push_back(Pending {
            owner,
            level,
            kind: PendingKind::Fresh,
        });
        self.grant_ready()
    }

    /// A reconnecting client reports a thread parked in `wait`.
    pub fn reestablish_wait(&mut self, owner: LockOwner, level: LockLevel, deadline_ms: Option<u64>) {
        if self.is_waiting(owner) || self.is_queued(owner) {
            return;
        }
        self.holders.retain(|h| h.owner != owner);
        self.waiters.push_back(Waiter {
            owner,
            level,
            count: 1,
            deadline_ms,
        });
    }

    pub fn grant_ready(&mut self) -> Vec<Grant> {
        let mut grants = Vec::new();
        while let Some(front) = self.queue.front() {
            if matches!(front.kind, PendingKind::Reacquire { armed: false, .. }) {
                break;
            }
            if !self.compatible(front.level) {
                break;
            }
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            let count = match next.kind {
                PendingKind::Fresh => 1,
                PendingKind::Reacquire { count, .. } => count,
            };
            self.holders.push(Holder {
                owner: next.owner,
                level: next.level,
                count,
            });
            grants.push(Grant {
                owner: next.owner,
                level: next.level,
            });
        }
        grants
    }
}
