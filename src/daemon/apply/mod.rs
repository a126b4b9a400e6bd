//! Transaction apply pipeline.
//!
//! Committed client transactions flow through three stages joined by bounded
//! crossbeam queues:
//!
//! 1. apply: a pool of workers commits each transaction atomically through
//!    the [`ObjectStore`]. A client is always routed to the same worker, so
//!    its transactions apply in submission order. The [`GlobalTransactionId`]
//!    is assigned under the commit lock.
//! 2. lock notify: one thread restores gid order and runs each
//!    transaction's notifies against the [`LockCoordinator`].
//! 3. broadcast: one thread sends deltas to interested clients, tells
//!    notified clients which of their waiters were released, acknowledges
//!    the origin and finally lets the released waiters compete again.
//!
//! A failed apply fences the client: everything it sent after the failing
//! transaction is dropped until it completes a new handshake.

pub mod sequencer;
pub mod store;
pub mod txn_log;

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::error::details::{SequenceViolationDetails, TransactionFailedDetails};
use crate::core::{
    ClientId, ConnectionId, ErrorPayload, GlobalTransactionId, LockOwner, NotifiedWaiters, ObjectDelta,
    ProtocolErrorCode, SequenceId, ServerTransaction, TransactionBatch, TransactionId, TxnType,
};
use crate::daemon::broadcast::{InterestRegistry, OutboundError, OutboundSink};
use crate::daemon::events::{CoordinatorEvent, EventBus, EventHandler};
use crate::daemon::locks::{LockCoordinator, LockError};
use crate::daemon::metrics;
use crate::daemon::proto::{Broadcast, ServerMessage};
use crate::error::{Effect, Transience};

pub use sequencer::GidSequencer;
pub use store::{
    InMemoryObjectStore, ObjectStore, PersistenceTransaction, StoreError, StoredObject,
};
pub use txn_log::{ClientLog, ResendDiff, ResendViolation, SequenceStatus, TransactionLog};

const FIRST_GID: u64 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub apply_workers: usize,
    /// Capacity of each stage queue; a full queue blocks the submitter.
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            apply_workers: 4,
            queue_capacity: 1_024,
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApplyError {
    #[error("{client} has not completed a handshake")]
    NotAccepting { client: ClientId },
    #[error("{client} sent {got} after {last}")]
    OutOfOrder {
        client: ClientId,
        last: TransactionId,
        got: TransactionId,
    },
    #[error("{client} sent invalid {sequence_id}")]
    InvalidSequence {
        client: ClientId,
        sequence_id: SequenceId,
    },
    #[error("{client} sent {got} but the next sequence id is {expected}")]
    SequenceGap {
        client: ClientId,
        expected: SequenceId,
        got: SequenceId,
    },
    #[error("{connection} no longer speaks for {client}")]
    Superseded {
        client: ClientId,
        connection: ConnectionId,
    },
    #[error("apply pipeline is shut down")]
    ShutDown,
    #[error("failed to start pipeline thread: {0}")]
    Spawn(#[source] io::Error),
}

impl ApplyError {
    pub fn transience(&self) -> Transience {
        match self {
            ApplyError::NotAccepting { .. } => Transience::Retryable,
            ApplyError::OutOfOrder { .. }
            | ApplyError::InvalidSequence { .. }
            | ApplyError::SequenceGap { .. }
            | ApplyError::Superseded { .. } => Transience::Permanent,
            ApplyError::ShutDown | ApplyError::Spawn(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // Earlier transactions of the batch may already be queued.
            ApplyError::OutOfOrder { .. }
            | ApplyError::InvalidSequence { .. }
            | ApplyError::SequenceGap { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }

    pub fn as_error_payload(&self) -> ErrorPayload {
        match self {
            ApplyError::NotAccepting { .. } => {
                ErrorPayload::new(ProtocolErrorCode::HandshakeRequired, self.to_string(), true)
            }
            ApplyError::OutOfOrder { last, got, .. } => {
                ErrorPayload::new(ProtocolErrorCode::SequenceViolation, self.to_string(), false)
                    .with_details(SequenceViolationDetails {
                        expected_at_least: last.get() + 1,
                        got: got.get(),
                    })
            }
            ApplyError::InvalidSequence { sequence_id, .. } => {
                ErrorPayload::new(ProtocolErrorCode::SequenceViolation, self.to_string(), false)
                    .with_details(SequenceViolationDetails {
                        expected_at_least: 1,
                        got: sequence_id.get(),
                    })
            }
            ApplyError::SequenceGap { expected, got, .. } => {
                ErrorPayload::new(ProtocolErrorCode::SequenceViolation, self.to_string(), false)
                    .with_details(SequenceViolationDetails {
                        expected_at_least: expected.get(),
                        got: got.get(),
                    })
            }
            ApplyError::Superseded { .. } => {
                ErrorPayload::new(ProtocolErrorCode::SessionSuperseded, self.to_string(), false)
            }
            ApplyError::ShutDown => {
                ErrorPayload::new(ProtocolErrorCode::Shutdown, self.to_string(), true)
            }
            ApplyError::Spawn(_) => {
                ErrorPayload::new(ProtocolErrorCode::Internal, self.to_string(), false)
            }
        }
    }
}

/// Collaborators the pipeline writes to.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn ObjectStore>,
    pub locks: Arc<LockCoordinator>,
    pub outbound: Arc<dyn OutboundSink>,
    pub interest: Arc<InterestRegistry>,
    pub events: Arc<EventBus>,
    pub log: Arc<TransactionLog>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmitSummary {
    pub queued: usize,
    pub duplicates: usize,
    /// Dropped because the client is fenced after a failure.
    pub dropped: usize,
}

struct ApplyJob {
    txn: ServerTransaction,
    epoch: u64,
}

struct Committed {
    gid: GlobalTransactionId,
    txn: ServerTransaction,
}

struct Resolved {
    gid: GlobalTransactionId,
    txn: ServerTransaction,
    notified: NotifiedWaiters,
}

#[derive(Clone, Copy, Debug)]
struct ClientSlot {
    epoch: u64,
    /// The connection whose handshake opened this epoch.
    connection: ConnectionId,
    fenced: bool,
    last_txn_id: Option<TransactionId>,
    /// One past the highest sequence id applied or queued. `None` until the
    /// client has a first transaction.
    next_sequence: Option<SequenceId>,
}

struct Shared {
    deps: PipelineDeps,
    clients: Mutex<HashMap<ClientId, ClientSlot>>,
    epochs: AtomicU64,
    next_gid: Mutex<u64>,
}

pub struct TransactionApplyPipeline {
    shared: Arc<Shared>,
    senders: RwLock<Vec<Sender<ApplyJob>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionApplyPipeline {
    pub fn start(config: &PipelineConfig, deps: PipelineDeps) -> Result<Self, ApplyError> {
        let shared = Arc::new(Shared {
            deps,
            clients: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(0),
            next_gid: Mutex::new(FIRST_GID),
        });
        let capacity = config.queue_capacity.max(1);
        let (notify_tx, notify_rx) = crossbeam::channel::bounded(capacity);
        let (broadcast_tx, broadcast_rx) = crossbeam::channel::bounded(capacity);

        let mut threads = Vec::new();
        let mut senders = Vec::new();
        for worker in 0..config.apply_workers.max(1) {
            let (tx, rx) = crossbeam::channel::bounded(capacity);
            let shared = Arc::clone(&shared);
            let notify_tx = notify_tx.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("dso-apply-{worker}"))
                    .spawn(move || run_apply_worker(shared, worker, rx, notify_tx))
                    .map_err(ApplyError::Spawn)?,
            );
            senders.push(tx);
        }
        drop(notify_tx);

        let notify_shared = Arc::clone(&shared);
        threads.push(
            thread::Builder::new()
                .name("dso-lock-notify".to_string())
                .spawn(move || run_notify_stage(notify_shared, notify_rx, broadcast_tx))
                .map_err(ApplyError::Spawn)?,
        );
        let broadcast_shared = Arc::clone(&shared);
        threads.push(
            thread::Builder::new()
                .name("dso-broadcast".to_string())
                .spawn(move || run_broadcast_stage(broadcast_shared, broadcast_rx))
                .map_err(ApplyError::Spawn)?,
        );

        tracing::info!(
            workers = senders.len(),
            queue_capacity = capacity,
            "apply pipeline started"
        );
        Ok(Self {
            shared,
            senders: RwLock::new(senders),
            threads: Mutex::new(threads),
        })
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.shared.deps.log
    }

    /// Opens a new submission epoch for `client` on `connection` after a
    /// successful handshake. Clears any fence; queued work from earlier
    /// epochs is dropped unapplied, and submissions from any other
    /// connection are refused.
    pub fn begin_session(&self, client: ClientId, connection: ConnectionId) {
        let epoch = self.shared.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let log = self.shared.deps.log.snapshot(client).unwrap_or_default();
        self.shared.slots().insert(
            client,
            ClientSlot {
                epoch,
                connection,
                fenced: false,
                last_txn_id: log.last_txn_id,
                next_sequence: log.highest.map(SequenceId::next),
            },
        );
        tracing::debug!(%client, %connection, epoch, "apply session opened");
    }

    pub fn forget_client(&self, client: ClientId) {
        if self.shared.slots().remove(&client).is_some() {
            tracing::debug!(%client, "apply session closed");
        }
    }

    pub fn is_fenced(&self, client: ClientId) -> bool {
        self.shared.slots().get(&client).is_some_and(|s| s.fenced)
    }

    /// Queues every transaction of `batch` that `client` sent on
    /// `connection`.
    ///
    /// Sequence ids must continue the client's log without gaps; an id at or
    /// below the applied watermark is re-acknowledged. Blocks while the
    /// worker queue is full.
    pub fn submit(
        &self,
        client: ClientId,
        connection: ConnectionId,
        batch: TransactionBatch,
    ) -> Result<SubmitSummary, ApplyError> {
        let (worker, tx) = {
            let senders = self.senders.read().unwrap_or_else(PoisonError::into_inner);
            if senders.is_empty() {
                return Err(ApplyError::ShutDown);
            }
            let worker = (client.get() % senders.len() as u64) as usize;
            (worker, senders[worker].clone())
        };

        let mut summary = SubmitSummary::default();
        for record in batch.transactions {
            let txn = ServerTransaction::new(client, batch.batch_id, record);
            let epoch = {
                let mut slots = self.shared.slots();
                let slot = slots
                    .get_mut(&client)
                    .ok_or(ApplyError::NotAccepting { client })?;
                if slot.connection != connection {
                    return Err(ApplyError::Superseded { client, connection });
                }
                if slot.fenced {
                    summary.dropped += 1;
                    continue;
                }
                match self.shared.deps.log.classify(client, txn.sequence_id) {
                    SequenceStatus::Applied => {
                        drop(slots);
                        self.shared.reack(&txn);
                        summary.duplicates += 1;
                        continue;
                    }
                    SequenceStatus::Invalid => {
                        return Err(ApplyError::InvalidSequence {
                            client,
                            sequence_id: txn.sequence_id,
                        });
                    }
                    SequenceStatus::Pending => {}
                }
                if let Some(expected) = slot.next_sequence
                    && txn.sequence_id != expected
                {
                    return Err(ApplyError::SequenceGap {
                        client,
                        expected,
                        got: txn.sequence_id,
                    });
                }
                if let Some(last) = slot.last_txn_id
                    && txn.txn_id <= last
                {
                    return Err(ApplyError::OutOfOrder {
                        client,
                        last,
                        got: txn.txn_id,
                    });
                }
                slot.last_txn_id = Some(txn.txn_id);
                slot.next_sequence = Some(txn.sequence_id.next());
                slot.epoch
            };
            tx.send(ApplyJob { txn, epoch })
                .map_err(|_| ApplyError::ShutDown)?;
            summary.queued += 1;
        }
        metrics::set_apply_queue_depth(worker, tx.len());
        Ok(summary)
    }

    /// Closes the queues and waits for every stage to drain.
    pub fn shutdown(&self) {
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let threads = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if threads.is_empty() {
            return;
        }
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("apply pipeline thread panicked");
            }
        }
        tracing::info!("apply pipeline stopped");
    }
}

impl Drop for TransactionApplyPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EventHandler for TransactionApplyPipeline {
    fn handle(&self, event: &CoordinatorEvent) {
        if let CoordinatorEvent::ClientDisconnected { client } = event {
            self.forget_client(*client);
        }
    }
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, HashMap<ClientId, ClientSlot>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, client: ClientId, epoch: u64) -> bool {
        self.slots()
            .get(&client)
            .is_some_and(|slot| slot.epoch == epoch && !slot.fenced)
    }

    fn fence(&self, client: ClientId) {
        if let Some(slot) = self.slots().get_mut(&client) {
            slot.fenced = true;
        }
    }

    fn send(&self, client: ClientId, message: ServerMessage) -> bool {
        let kind = message.type_name();
        match self.deps.outbound.send(client, message) {
            Ok(()) => true,
            Err(err @ OutboundError::NotConnected { .. }) => {
                tracing::debug!(%client, kind, error = %err, "outbound message skipped");
                false
            }
            Err(err) => {
                tracing::warn!(%client, kind, error = %err, "outbound message failed");
                false
            }
        }
    }

    fn reack(&self, txn: &ServerTransaction) {
        metrics::txn_duplicate(txn.origin);
        if txn.txn_type == TxnType::PassiveSync {
            return;
        }
        tracing::debug!(
            client = %txn.origin,
            txn_id = %txn.txn_id,
            sequence_id = %txn.sequence_id,
            "re-acknowledging applied transaction"
        );
        self.send(
            txn.origin,
            ServerMessage::TxnAck {
                txn_id: txn.txn_id,
                sequence_id: txn.sequence_id,
            },
        );
    }

    /// Commits `txn` and returns its gid. Passive sync transactions are
    /// logged without a gid.
    fn apply(&self, txn: &ServerTransaction) -> Result<Option<GlobalTransactionId>, StoreError> {
        let mut ptx = self.deps.store.begin()?;
        if let Err(err) = ptx.apply_deltas(txn) {
            ptx.abort();
            return Err(err);
        }
        let mut next_gid = self.next_gid.lock().unwrap_or_else(PoisonError::into_inner);
        ptx.commit()?;
        self.deps
            .log
            .record_applied(txn.origin, txn.sequence_id, txn.txn_id);
        if txn.txn_type == TxnType::PassiveSync {
            return Ok(None);
        }
        let gid = GlobalTransactionId::new(*next_gid);
        *next_gid += 1;
        Ok(Some(gid))
    }

    fn fail(&self, txn: &ServerTransaction, err: &StoreError) {
        let client = txn.origin;
        tracing::error!(
            %client,
            txn_id = %txn.txn_id,
            sequence_id = %txn.sequence_id,
            error = %err,
            "transaction failed to apply; fencing client"
        );
        self.fence(client);
        let payload = ErrorPayload::new(
            ProtocolErrorCode::TransactionFailed,
            format!("{} failed to apply: {err}", txn.txn_id),
            err.transience() != Transience::Permanent,
        )
        .with_details(TransactionFailedDetails {
            txn_id: txn.txn_id.get(),
            sequence_id: txn.sequence_id.get(),
        });
        self.send(client, ServerMessage::Error(payload));
        self.deps.events.publish(CoordinatorEvent::TransactionFailed {
            client,
            txn_id: txn.txn_id,
            sequence_id: txn.sequence_id,
            reason: err.to_string(),
        });
    }

    fn run_notifies(&self, txn: &ServerTransaction) -> NotifiedWaiters {
        let mut acc = NotifiedWaiters::new();
        for request in &txn.notifies {
            if !txn.holds_lock(&request.lock) {
                let err = LockError::NotifyWithoutHold {
                    lock: request.lock.clone(),
                    owner: LockOwner::new(txn.origin, request.thread),
                };
                tracing::warn!(txn_id = %txn.txn_id, error = %err, "notify ignored");
                self.send(txn.origin, ServerMessage::Error(err.as_error_payload()));
                continue;
            }
            self.deps.locks.notify(
                &request.lock,
                txn.origin,
                request.thread,
                request.kind,
                &mut acc,
            );
        }
        acc
    }

    fn broadcast(&self, resolved: Resolved) {
        let Resolved { gid, txn, notified } = resolved;
        let origin = txn.origin;
        let interest = &self.deps.interest;
        interest.subscribe(
            origin,
            txn.deltas
                .iter()
                .filter(|delta| delta.new_object)
                .map(|delta| delta.object_id),
        );

        let mut recipients: BTreeSet<ClientId> = interest
            .interested(origin, &txn.object_ids())
            .into_iter()
            .collect();
        recipients.extend(notified.clients().filter(|client| *client != origin));

        let mut sent = 0;
        for client in recipients {
            let deltas: Vec<ObjectDelta> = txn
                .deltas
                .iter()
                .filter(|delta| interest.is_interested(client, delta.object_id))
                .cloned()
                .collect();
            let message = ServerMessage::Broadcast(Broadcast {
                origin,
                gid,
                txn_id: txn.txn_id,
                deltas,
                notified: notified.for_client(client).to_vec(),
            });
            if self.send(client, message) {
                sent += 1;
            }
        }
        let own = notified.for_client(origin);
        if !own.is_empty() {
            self.send(
                origin,
                ServerMessage::Broadcast(Broadcast {
                    origin,
                    gid,
                    txn_id: txn.txn_id,
                    deltas: Vec::new(),
                    notified: own.to_vec(),
                }),
            );
        }
        self.send(
            origin,
            ServerMessage::TxnAck {
                txn_id: txn.txn_id,
                sequence_id: txn.sequence_id,
            },
        );
        self.deps.locks.arm_notified(&notified);
        if sent > 0 {
            metrics::broadcasts_out(sent);
        }
        tracing::trace!(%gid, %origin, sent, "transaction broadcast");
    }
}

fn run_apply_worker(
    shared: Arc<Shared>,
    worker: usize,
    rx: Receiver<ApplyJob>,
    notify_tx: Sender<Committed>,
) {
    let span = tracing::info_span!("apply_worker", worker);
    let _guard = span.enter();
    while let Ok(ApplyJob { txn, epoch }) = rx.recv() {
        metrics::set_apply_queue_depth(worker, rx.len());
        let client = txn.origin;
        if !shared.is_current(client, epoch) {
            tracing::debug!(%client, txn_id = %txn.txn_id, "dropping transaction of a fenced or replaced session");
            continue;
        }
        if shared.deps.log.is_applied(client, txn.sequence_id) {
            shared.reack(&txn);
            continue;
        }
        let started = Instant::now();
        match shared.apply(&txn) {
            Ok(gid) => {
                metrics::apply_ok(started.elapsed());
                if let Some(gid) = gid
                    && notify_tx.send(Committed { gid, txn }).is_err()
                {
                    break;
                }
            }
            Err(err) => {
                metrics::apply_err(client, started.elapsed());
                shared.fail(&txn, &err);
            }
        }
    }
}

fn run_notify_stage(shared: Arc<Shared>, rx: Receiver<Committed>, tx: Sender<Resolved>) {
    let mut sequencer = GidSequencer::new(GlobalTransactionId::new(FIRST_GID));
    while let Ok(Committed { gid, txn }) = rx.recv() {
        for (gid, txn) in sequencer.push(gid, txn) {
            let notified = shared.run_notifies(&txn);
            if tx.send(Resolved { gid, txn, notified }).is_err() {
                return;
            }
        }
    }
    if sequencer.parked() > 0 {
        tracing::warn!(parked = sequencer.parked(), "notify stage stopped with parked transactions");
    }
}

fn run_broadcast_stage(shared: Arc<Shared>, rx: Receiver<Resolved>) {
    while let Ok(resolved) = rx.recv() {
        shared.broadcast(resolved);
    }
}
