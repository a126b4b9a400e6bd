//! Client handshake and resynchronisation.
//!
//! Runs once per channel session, before any other application traffic from
//! that connection is accepted. A handshake is validated completely before
//! any state changes, so a rejected handshake leaves locks, the transaction
//! log and the session table untouched.

mod session;

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::core::error::details::VersionIncompatibleDetails;
use crate::core::{ClientId, ConnectionId, ErrorPayload, ProductVersion, ProtocolErrorCode};
use crate::daemon::apply::{ResendDiff, ResendViolation, TransactionApplyPipeline};
use crate::daemon::broadcast::{InterestRegistry, OutboundSink};
use crate::daemon::events::{CoordinatorEvent, EventBus};
use crate::daemon::locks::{LockCoordinator, ReportedLocks};
use crate::daemon::metrics;
use crate::daemon::object_ids::{ObjectIdAllocator, ObjectIdsExhausted};
use crate::daemon::proto::{ClientHandshake, HandshakeAck, ServerMessage};
use crate::error::{Effect, Transience};

pub use session::{Activation, SessionRegistry, SessionState};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error("client version {client_version} is incompatible with server {server_version}")]
    VersionIncompatible {
        client_version: String,
        server_version: String,
    },
    #[error("{connection} already speaks for {bound}, not {got}")]
    ClientMismatch {
        connection: ConnectionId,
        bound: ClientId,
        got: ClientId,
    },
    #[error("{sequence_ids} resent sequence ids but {txn_ids} resent transaction ids")]
    ResentMismatch { sequence_ids: usize, txn_ids: usize },
    #[error(transparent)]
    Resend(#[from] ResendViolation),
    #[error(transparent)]
    ObjectIds(#[from] ObjectIdsExhausted),
    #[error("no handshake on {connection} within {timeout_ms}ms")]
    Timeout {
        connection: ConnectionId,
        timeout_ms: u64,
    },
}

impl HandshakeError {
    pub fn code(&self) -> ProtocolErrorCode {
        match self {
            HandshakeError::VersionIncompatible { .. } => ProtocolErrorCode::VersionIncompatible,
            HandshakeError::ClientMismatch { .. } | HandshakeError::ResentMismatch { .. } => {
                ProtocolErrorCode::InvalidRequest
            }
            HandshakeError::Resend(_) => ProtocolErrorCode::SequenceViolation,
            HandshakeError::ObjectIds(err) => err.code(),
            HandshakeError::Timeout { .. } => ProtocolErrorCode::HandshakeTimeout,
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            HandshakeError::Timeout { .. } => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }

    pub fn as_error_payload(&self) -> ErrorPayload {
        match self {
            HandshakeError::VersionIncompatible {
                client_version,
                server_version,
            } => ErrorPayload::new(self.code(), self.to_string(), false).with_details(
                VersionIncompatibleDetails {
                    client_version: client_version.clone(),
                    server_version: server_version.clone(),
                },
            ),
            HandshakeError::Resend(violation) => violation.as_error_payload(),
            _ => ErrorPayload::new(
                self.code(),
                self.to_string(),
                self.transience().is_retryable(),
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeSettings {
    pub server_version: ProductVersion,
    pub enforce_version_match: bool,
    pub timeout_ms: u64,
}

#[derive(Clone)]
pub struct HandshakeDeps {
    pub sessions: Arc<SessionRegistry>,
    pub locks: Arc<LockCoordinator>,
    pub pipeline: Arc<TransactionApplyPipeline>,
    pub interest: Arc<InterestRegistry>,
    pub object_ids: Arc<ObjectIdAllocator>,
    pub events: Arc<EventBus>,
    /// Carries the ack, which must reach the client ahead of any lock
    /// response the resynchronisation produces.
    pub outbound: Arc<dyn OutboundSink>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandshakeOutcome {
    pub client: ClientId,
    pub ack: HandshakeAck,
    /// Older connection of the same client, to be torn down without
    /// releasing the client's locks.
    pub superseded: Option<ConnectionId>,
    pub reconnect: bool,
}

pub struct HandshakeCoordinator {
    settings: HandshakeSettings,
    deps: HandshakeDeps,
}

impl HandshakeCoordinator {
    pub fn new(settings: HandshakeSettings, deps: HandshakeDeps) -> Self {
        Self { settings, deps }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.deps.sessions
    }

    /// Starts the handshake clock for a freshly established channel.
    pub fn channel_established(&self, connection: ConnectionId, now_ms: u64) {
        let deadline = now_ms.saturating_add(self.settings.timeout_ms);
        self.deps.sessions.open(connection, deadline);
    }

    pub fn is_active(&self, connection: ConnectionId) -> bool {
        self.deps.sessions.client_of(connection).is_some()
    }

    pub fn handle(
        &self,
        connection: ConnectionId,
        handshake: ClientHandshake,
        now_ms: u64,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let started = Instant::now();
        let client = handshake.client_id;
        let span = tracing::info_span!("handshake", %connection, %client);
        let _guard = span.enter();

        let checked = self.validate(connection, &handshake).and_then(|diff| {
            let object_ids = handshake
                .request_object_ids
                .then(|| self.deps.object_ids.issue(client))
                .transpose()?;
            Ok((diff, object_ids))
        });
        let (diff, object_ids) = match checked {
            Ok(checked) => checked,
            Err(err) => {
                self.rejected(connection, Some(client), &err);
                return Err(err);
            }
        };

        let activation = self.deps.sessions.activate(connection, client);
        let ack = HandshakeAck {
            acknowledged: diff.acknowledged,
            pending: diff.pending,
            object_ids,
            server_version: self.settings.server_version.to_string(),
        };
        if let Err(err) = self
            .deps
            .outbound
            .send(client, ServerMessage::HandshakeAck(ack.clone()))
        {
            tracing::warn!(error = %err, "handshake ack not delivered");
        }

        self.deps.pipeline.begin_session(client, connection);
        self.deps.locks.reestablish(
            client,
            ReportedLocks {
                held: &handshake.lock_contexts,
                waiting: &handshake.wait_contexts,
                pending: &handshake.pending_lock_contexts,
                pending_try: &handshake.pending_try_lock_contexts,
            },
            now_ms,
        );
        self.deps
            .interest
            .replace(client, handshake.object_ids.iter().copied());

        if let Some(old) = activation.superseded {
            tracing::info!(%old, "superseding older session of client");
            self.deps.events.publish(CoordinatorEvent::SessionSuperseded {
                client,
                old,
                new: connection,
            });
        }
        self.deps
            .events
            .publish(CoordinatorEvent::ConnectionEstablished {
                client,
                connection,
                reconnect: activation.reconnect,
            });
        metrics::handshake_ok(started.elapsed());
        tracing::debug!(
            acknowledged = ack.acknowledged.len(),
            pending = ack.pending.len(),
            locks = handshake.lock_contexts.len(),
            reconnect = activation.reconnect,
            "handshake complete"
        );

        Ok(HandshakeOutcome {
            client,
            ack,
            superseded: activation.superseded,
            reconnect: activation.reconnect,
        })
    }

    fn validate(
        &self,
        connection: ConnectionId,
        handshake: &ClientHandshake,
    ) -> Result<ResendDiff, HandshakeError> {
        if self.settings.enforce_version_match {
            let compatible = ProductVersion::parse(&handshake.client_version)
                .is_some_and(|v| v.is_compatible_with(&self.settings.server_version));
            if !compatible {
                return Err(HandshakeError::VersionIncompatible {
                    client_version: handshake.client_version.clone(),
                    server_version: self.settings.server_version.to_string(),
                });
            }
        }
        if let Some(bound) = self.deps.sessions.client_of(connection)
            && bound != handshake.client_id
        {
            return Err(HandshakeError::ClientMismatch {
                connection,
                bound,
                got: handshake.client_id,
            });
        }
        if handshake.resent_sequence_ids.len() != handshake.resent_txn_ids.len() {
            return Err(HandshakeError::ResentMismatch {
                sequence_ids: handshake.resent_sequence_ids.len(),
                txn_ids: handshake.resent_txn_ids.len(),
            });
        }
        Ok(self
            .deps
            .pipeline
            .log()
            .diff(handshake.client_id, &handshake.resent_sequence_ids)?)
    }

    fn rejected(&self, connection: ConnectionId, client: Option<ClientId>, err: &HandshakeError) {
        let code = err.code();
        tracing::warn!(%connection, error = %err, "handshake rejected");
        metrics::handshake_rejected(code.as_str());
        self.deps.events.publish(CoordinatorEvent::HandshakeRejected {
            connection,
            client,
            code,
            reason: err.to_string(),
        });
    }

    /// Drops connections that never hand-shook in time.
    pub fn expire(&self, now_ms: u64) -> Vec<(ConnectionId, HandshakeError)> {
        let expired = self.deps.sessions.expired(now_ms);
        expired
            .into_iter()
            .map(|connection| {
                self.deps.sessions.close(connection);
                let err = HandshakeError::Timeout {
                    connection,
                    timeout_ms: self.settings.timeout_ms,
                };
                self.rejected(connection, None, &err);
                (connection, err)
            })
            .collect()
    }

    /// Forgets `connection`. Returns the client whose last connection this
    /// was; superseded connections return `None`.
    pub fn connection_closed(&self, connection: ConnectionId) -> Option<ClientId> {
        self.deps.sessions.close(connection)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::core::{
        LockContext, LockId, LockLevel, LockResponse, ObjectId, SequenceId, ThreadId,
        TransactionId,
    };
    use crate::daemon::apply::{InMemoryObjectStore, PipelineConfig, PipelineDeps, TransactionLog};
    use crate::daemon::broadcast::{OutboundError, OutboundSink};
    use crate::daemon::events::EventHandler;
    use crate::daemon::locks::{LockResponseSink, LockStats};
    use crate::daemon::object_ids::ObjectIdConfig;
    use crate::daemon::proto::ServerMessage;

    /// Records outbound message types in delivery order.
    #[derive(Default)]
    struct Wire(Mutex<Vec<&'static str>>);

    impl OutboundSink for Wire {
        fn send(&self, _client: ClientId, message: ServerMessage) -> Result<(), OutboundError> {
            self.0.lock().unwrap().push(message.type_name());
            Ok(())
        }
    }

    impl LockResponseSink for Wire {
        fn deliver(&self, _client: ClientId, _response: LockResponse) {
            self.0.lock().unwrap().push("lock_response");
        }
    }

    #[derive(Default)]
    struct EventNames(Mutex<Vec<&'static str>>);

    impl EventHandler for EventNames {
        fn handle(&self, event: &CoordinatorEvent) {
            self.0.lock().unwrap().push(event.name());
        }
    }

    struct Harness {
        coordinator: HandshakeCoordinator,
        locks: Arc<LockCoordinator>,
        log: Arc<TransactionLog>,
        events: Arc<EventNames>,
        wire: Arc<Wire>,
    }

    fn harness(enforce_version_match: bool) -> Harness {
        harness_with_ids(enforce_version_match, ObjectIdConfig::default())
    }

    fn harness_with_ids(enforce_version_match: bool, ids: ObjectIdConfig) -> Harness {
        let wire = Arc::new(Wire::default());
        let locks = Arc::new(LockCoordinator::new(wire.clone(), LockStats::default()));
        let interest = Arc::new(InterestRegistry::new());
        let bus = Arc::new(EventBus::new());
        let events = Arc::new(EventNames::default());
        bus.register(events.clone());
        let log = Arc::new(TransactionLog::new());
        let pipeline = TransactionApplyPipeline::start(
            &PipelineConfig {
                apply_workers: 1,
                queue_capacity: 4,
            },
            PipelineDeps {
                store: Arc::new(InMemoryObjectStore::new()),
                locks: Arc::clone(&locks),
                outbound: wire.clone(),
                interest: Arc::clone(&interest),
                events: Arc::clone(&bus),
                log: Arc::clone(&log),
            },
        )
        .unwrap();
        let coordinator = HandshakeCoordinator::new(
            HandshakeSettings {
                server_version: ProductVersion::parse("4.3.0").unwrap(),
                enforce_version_match,
                timeout_ms: 1_000,
            },
            HandshakeDeps {
                sessions: Arc::new(SessionRegistry::new()),
                locks: Arc::clone(&locks),
                pipeline: Arc::new(pipeline),
                interest,
                object_ids: Arc::new(ObjectIdAllocator::new(&ids)),
                events: bus,
                outbound: wire.clone(),
            },
        );
        Harness {
            coordinator,
            locks,
            log,
            events,
            wire,
        }
    }

    fn handshake(client: u64) -> ClientHandshake {
        ClientHandshake {
            client_id: ClientId::new(client),
            client_version: "4.3.2".to_string(),
            object_ids: vec![ObjectId::new(1)],
            lock_contexts: Vec::new(),
            wait_contexts: Vec::new(),
            pending_lock_contexts: Vec::new(),
            pending_try_lock_contexts: Vec::new(),
            resent_sequence_ids: Vec::new(),
            resent_txn_ids: Vec::new(),
            request_object_ids: false,
        }
    }

    fn resend(hs: &mut ClientHandshake, seqs: &[u64]) {
        hs.resent_sequence_ids = seqs.iter().copied().map(SequenceId::new).collect();
        hs.resent_txn_ids = seqs.iter().copied().map(TransactionId::new).collect();
    }

    #[test]
    fn incompatible_version_is_rejected_without_side_effects() {
        let h = harness(true);
        let conn = ConnectionId::new(1);
        h.coordinator.channel_established(conn, 0);
        let mut hs = handshake(1);
        hs.client_version = "5.0.0".to_string();
        hs.lock_contexts = vec![LockContext::new(
            LockId::named("x"),
            ThreadId::new(1),
            LockLevel::Write,
        )];
        let err = h.coordinator.handle(conn, hs, 0).unwrap_err();
        assert_eq!(err.code(), ProtocolErrorCode::VersionIncompatible);
        assert!(!h.coordinator.is_active(conn));
        assert_eq!(h.locks.lock_count(), 0);
        assert_eq!(*h.events.0.lock().unwrap(), vec!["handshake_rejected"]);
    }

    #[test]
    fn version_check_can_be_disabled() {
        let h = harness(false);
        let mut hs = handshake(1);
        hs.client_version = "UNKNOWN".to_string();
        assert!(h.coordinator.handle(ConnectionId::new(1), hs, 0).is_ok());
    }

    #[test]
    fn resent_transactions_are_diffed_against_the_log() {
        let h = harness(true);
        let client = ClientId::new(1);
        for seq in 1..=3 {
            h.log
                .record_applied(client, SequenceId::new(seq), TransactionId::new(seq));
        }
        let mut hs = handshake(1);
        resend(&mut hs, &[2, 3, 4, 5]);
        let outcome = h.coordinator.handle(ConnectionId::new(1), hs, 0).unwrap();
        assert_eq!(
            outcome.ack.acknowledged,
            vec![SequenceId::new(2), SequenceId::new(3)]
        );
        assert_eq!(
            outcome.ack.pending,
            vec![SequenceId::new(4), SequenceId::new(5)]
        );
        assert_eq!(outcome.ack.server_version, "4.3.0");
    }

    #[test]
    fn gap_in_resend_is_a_sequence_violation() {
        let h = harness(true);
        let client = ClientId::new(1);
        h.log
            .record_applied(client, SequenceId::new(1), TransactionId::new(1));
        let mut hs = handshake(1);
        resend(&mut hs, &[3]);
        let err = h.coordinator.handle(ConnectionId::new(1), hs, 0).unwrap_err();
        assert_eq!(
            err.as_error_payload().code,
            ProtocolErrorCode::SequenceViolation
        );
    }

    #[test]
    fn held_locks_are_reestablished_and_stale_ones_dropped() {
        let h = harness(true);
        let client = ClientId::new(1);
        let thread = ThreadId::new(1);
        h.locks
            .acquire(&LockId::named("stale"), client, thread, LockLevel::Write)
            .unwrap();
        let mut hs = handshake(1);
        hs.lock_contexts = vec![LockContext::new(LockId::named("kept"), thread, LockLevel::Read)];
        h.coordinator.handle(ConnectionId::new(1), hs, 0).unwrap();
        assert_eq!(h.locks.hold_count(&LockId::named("kept"), client, thread), 1);
        assert!(h.locks.holders(&LockId::named("stale")).is_empty());
    }

    #[test]
    fn newer_handshake_supersedes_without_releasing_locks() {
        let h = harness(true);
        let (old, new) = (ConnectionId::new(1), ConnectionId::new(2));
        let lock = LockContext::new(LockId::named("l"), ThreadId::new(1), LockLevel::Write);
        let mut hs = handshake(1);
        hs.lock_contexts = vec![lock.clone()];
        h.coordinator.handle(old, hs.clone(), 0).unwrap();

        let outcome = h.coordinator.handle(new, hs, 10).unwrap();
        assert_eq!(outcome.superseded, Some(old));
        assert!(outcome.reconnect);
        assert_eq!(
            h.locks.hold_count(&lock.lock, ClientId::new(1), lock.thread),
            1
        );
        assert_eq!(h.coordinator.connection_closed(old), None);
        assert!(
            h.events
                .0
                .lock()
                .unwrap()
                .contains(&"session_superseded")
        );
    }

    #[test]
    fn connection_cannot_switch_identity() {
        let h = harness(true);
        let conn = ConnectionId::new(1);
        h.coordinator.handle(conn, handshake(1), 0).unwrap();
        let err = h.coordinator.handle(conn, handshake(2), 0).unwrap_err();
        assert!(matches!(err, HandshakeError::ClientMismatch { .. }));
        assert!(h.coordinator.handle(conn, handshake(1), 0).is_ok());
    }

    #[test]
    fn object_ids_issued_on_request() {
        let h = harness(true);
        let mut hs = handshake(1);
        hs.request_object_ids = true;
        let outcome = h.coordinator.handle(ConnectionId::new(1), hs, 0).unwrap();
        assert!(outcome.ack.object_ids.is_some_and(|range| !range.is_empty()));
    }

    #[test]
    fn silent_connections_time_out() {
        let h = harness(true);
        h.coordinator.channel_established(ConnectionId::new(1), 0);
        h.coordinator.channel_established(ConnectionId::new(2), 0);
        h.coordinator
            .handle(ConnectionId::new(2), handshake(1), 5)
            .unwrap();
        let expired = h.coordinator.expire(1_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, ConnectionId::new(1));
        assert_eq!(expired[0].1.code(), ProtocolErrorCode::HandshakeTimeout);
        assert!(h.coordinator.expire(2_000).is_empty());
    }

    #[test]
    fn ack_precedes_replayed_lock_awards() {
        let h = harness(true);
        let mut hs = handshake(1);
        hs.pending_lock_contexts = vec![LockContext::new(
            LockId::named("p"),
            ThreadId::new(1),
            LockLevel::Write,
        )];
        h.coordinator.handle(ConnectionId::new(1), hs, 0).unwrap();
        assert_eq!(
            *h.wire.0.lock().unwrap(),
            vec!["handshake_ack", "lock_response"]
        );
    }

    #[test]
    fn rejected_handshake_sends_nothing() {
        let h = harness(true);
        let mut hs = handshake(1);
        hs.resent_txn_ids = vec![TransactionId::new(1)];
        let err = h.coordinator.handle(ConnectionId::new(1), hs, 0).unwrap_err();
        assert!(matches!(err, HandshakeError::ResentMismatch { .. }));
        assert!(h.wire.0.lock().unwrap().is_empty());
    }

    #[test]
    fn exhausted_object_ids_reject_before_activation() {
        let h = harness_with_ids(
            true,
            ObjectIdConfig {
                batch_size: 10,
                max_batch_size: 10,
                first_id: u64::MAX - 3,
            },
        );
        let mut hs = handshake(1);
        hs.request_object_ids = true;
        let err = h.coordinator.handle(ConnectionId::new(1), hs, 0).unwrap_err();
        assert!(matches!(err, HandshakeError::ObjectIds(_)));
        assert_eq!(err.as_error_payload().code, ProtocolErrorCode::Internal);
        assert!(!h.coordinator.is_active(ConnectionId::new(1)));
        assert!(h.wire.0.lock().unwrap().is_empty());
    }
}
