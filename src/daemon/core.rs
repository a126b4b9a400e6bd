//! Coordinator assembly and message dispatch.
//!
//! [`Coordinator`] owns every component and routes decoded client messages
//! to them. It knows nothing about sockets; the server hands it delivered
//! payloads and acts on the returned [`Disposition`].

use std::sync::Arc;

use crate::config::Config;
use crate::core::{
    ClientId, ConnectionId, ErrorPayload, Limits, LockResponse, ProtocolErrorCode,
};
use crate::daemon::apply::{
    ApplyError, ObjectStore, PipelineDeps, TransactionApplyPipeline, TransactionLog,
};
use crate::daemon::broadcast::{InterestRegistry, OutboundSink};
use crate::daemon::events::{CoordinatorEvent, EventBus, OperatorEventLog};
use crate::daemon::handshake::{HandshakeCoordinator, HandshakeDeps, SessionRegistry};
use crate::daemon::locks::{LockCoordinator, LockError, LockResponseSink, LockStats};
use crate::daemon::object_ids::ObjectIdAllocator;
use crate::daemon::proto::{ClientMessage, LockOp, LockRequest, ServerMessage, decode_client_message};
use crate::error::Error;

/// What the transport has to do once a message was handled.
#[derive(Clone, Debug, PartialEq)]
pub enum Disposition {
    Continue,
    /// Handshake accepted. A superseded connection must be closed without
    /// reporting the client as gone.
    Activated {
        client: ClientId,
        superseded: Option<ConnectionId>,
    },
    /// Deliver `reply` on this connection, then close it with `error`.
    Close {
        reply: ServerMessage,
        error: ErrorPayload,
    },
}

impl Disposition {
    fn reject(error: ErrorPayload) -> Self {
        Disposition::Close {
            reply: ServerMessage::HandshakeReject(error.clone()),
            error,
        }
    }

    fn fatal(error: ErrorPayload) -> Self {
        Disposition::Close {
            reply: ServerMessage::Error(error.clone()),
            error,
        }
    }
}

/// Collaborators supplied by whoever owns the transport.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub store: Arc<dyn ObjectStore>,
    /// Shared with the outbound sink so it can resolve a client to its
    /// connection.
    pub sessions: Arc<SessionRegistry>,
    pub outbound: Arc<dyn OutboundSink>,
}

/// Lock responses travel as ordinary server messages.
struct OutboundLockResponses {
    outbound: Arc<dyn OutboundSink>,
}

impl LockResponseSink for OutboundLockResponses {
    fn deliver(&self, client: ClientId, response: LockResponse) {
        if let Err(err) = self
            .outbound
            .send(client, ServerMessage::LockResponse(response))
        {
            tracing::debug!(%client, error = %err, "lock response not delivered");
        }
    }
}

pub struct Coordinator {
    limits: Limits,
    events: Arc<EventBus>,
    locks: Arc<LockCoordinator>,
    pipeline: Arc<TransactionApplyPipeline>,
    handshake: HandshakeCoordinator,
    interest: Arc<InterestRegistry>,
    object_ids: Arc<ObjectIdAllocator>,
    outbound: Arc<dyn OutboundSink>,
}

impl Coordinator {
    pub fn start(config: &Config, deps: CoordinatorDeps) -> Result<Self, Error> {
        let settings = config.handshake_settings()?;
        let events = Arc::new(EventBus::new());
        let locks = Arc::new(LockCoordinator::new(
            Arc::new(OutboundLockResponses {
                outbound: Arc::clone(&deps.outbound),
            }),
            LockStats::new(config.locks.stats),
        ));
        let interest = Arc::new(InterestRegistry::new());
        let object_ids = Arc::new(ObjectIdAllocator::new(&config.object_ids));
        let pipeline = Arc::new(TransactionApplyPipeline::start(
            &config.pipeline,
            PipelineDeps {
                store: deps.store,
                locks: Arc::clone(&locks),
                outbound: Arc::clone(&deps.outbound),
                interest: Arc::clone(&interest),
                events: Arc::clone(&events),
                log: Arc::new(TransactionLog::new()),
            },
        )?);

        events.register(locks.clone());
        events.register(interest.clone());
        events.register(pipeline.clone());
        events.register(deps.sessions.clone());
        events.register(Arc::new(OperatorEventLog));

        let handshake = HandshakeCoordinator::new(
            settings,
            HandshakeDeps {
                sessions: deps.sessions,
                locks: Arc::clone(&locks),
                pipeline: Arc::clone(&pipeline),
                interest: Arc::clone(&interest),
                object_ids: Arc::clone(&object_ids),
                events: Arc::clone(&events),
                outbound: Arc::clone(&deps.outbound),
            },
        );

        Ok(Self {
            limits: config.limits.clone(),
            events,
            locks,
            pipeline,
            handshake,
            interest,
            object_ids,
            outbound: deps.outbound,
        })
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    pub fn pipeline(&self) -> &Arc<TransactionApplyPipeline> {
        &self.pipeline
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        self.handshake.sessions()
    }

    /// The channel of `connection` is up; the handshake clock starts.
    pub fn channel_established(&self, connection: ConnectionId, now_ms: u64) {
        self.handshake.channel_established(connection, now_ms);
    }

    /// Decodes and dispatches one delivered payload.
    pub fn handle_payload(&self, connection: ConnectionId, bytes: &[u8], now_ms: u64) -> Disposition {
        match decode_client_message(bytes, &self.limits) {
            Ok(message) => self.dispatch(connection, message, now_ms),
            Err(err) => {
                tracing::warn!(%connection, error = %err, "undecodable client message");
                Disposition::fatal(err.as_error_payload())
            }
        }
    }

    pub fn dispatch(
        &self,
        connection: ConnectionId,
        message: ClientMessage,
        now_ms: u64,
    ) -> Disposition {
        tracing::trace!(%connection, message = message.type_name(), "dispatch");
        if let ClientMessage::Handshake(handshake) = message {
            return match self.handshake.handle(connection, handshake, now_ms) {
                Ok(outcome) => Disposition::Activated {
                    client: outcome.client,
                    superseded: outcome.superseded,
                },
                Err(err) => Disposition::reject(err.as_error_payload()),
            };
        }

        let Some(client) = self.handshake.sessions().client_of(connection) else {
            tracing::warn!(
                %connection,
                message = message.type_name(),
                "traffic before handshake"
            );
            return Disposition::fatal(ErrorPayload::new(
                ProtocolErrorCode::HandshakeRequired,
                format!("{} received before handshake", message.type_name()),
                false,
            ));
        };

        match message {
            ClientMessage::Handshake(_) => Disposition::Continue,
            ClientMessage::Commit(batch) => match self.pipeline.submit(client, connection, batch)
            {
                Ok(summary) => {
                    tracing::trace!(
                        %client,
                        queued = summary.queued,
                        duplicates = summary.duplicates,
                        dropped = summary.dropped,
                        "commit accepted"
                    );
                    Disposition::Continue
                }
                Err(err) => self.commit_rejected(client, err),
            },
            ClientMessage::Lock(request) => {
                if let Err(err) = self.lock(client, &request, now_ms) {
                    tracing::warn!(%client, error = %err, "lock request refused");
                    self.reply(client, ServerMessage::Error(err.as_error_payload()));
                }
                Disposition::Continue
            }
            ClientMessage::RequestObjectIds { count } => {
                match self.object_ids.issue_count(client, count) {
                    Ok(range) => self.reply(client, ServerMessage::ObjectIds(range)),
                    Err(err) => {
                        tracing::error!(%client, error = %err, "object id request refused");
                        self.reply(client, ServerMessage::Error(err.as_error_payload()));
                    }
                }
                Disposition::Continue
            }
            ClientMessage::Subscribe { object_ids } => {
                self.interest.subscribe(client, object_ids);
                Disposition::Continue
            }
        }
    }

    fn commit_rejected(&self, client: ClientId, err: ApplyError) -> Disposition {
        tracing::warn!(%client, error = %err, "commit rejected");
        Disposition::fatal(err.as_error_payload())
    }

    fn lock(&self, client: ClientId, request: &LockRequest, now_ms: u64) -> Result<(), LockError> {
        let LockRequest { lock, thread, op } = request;
        match *op {
            LockOp::Acquire { level } => {
                self.locks.acquire(lock, client, *thread, level)?;
            }
            LockOp::TryAcquire { level } => {
                self.locks.try_acquire(lock, client, *thread, level)?;
            }
            LockOp::Release => self.locks.release(lock, client, *thread)?,
            LockOp::Wait { timeout_ms } => {
                let deadline = timeout_ms.map(|timeout| now_ms.saturating_add(timeout));
                self.locks.wait(lock, client, *thread, deadline)?;
            }
            LockOp::Cancel => {
                if !self.locks.cancel(lock, client, *thread) {
                    tracing::debug!(%client, %lock, %thread, "cancel with nothing pending");
                }
            }
        }
        Ok(())
    }

    fn reply(&self, client: ClientId, message: ServerMessage) {
        if let Err(err) = self.outbound.send(client, message) {
            tracing::debug!(%client, error = %err, "reply not delivered");
        }
    }

    /// Forgets `connection`. If it was the client's live connection the
    /// client is gone for good and its state is released.
    pub fn connection_closed(&self, connection: ConnectionId) -> Option<ClientId> {
        let client = self.handshake.connection_closed(connection)?;
        self.events
            .publish(CoordinatorEvent::ClientDisconnected { client });
        Some(client)
    }

    /// Runs the coordinator's timers. Returns the connections whose
    /// handshake window ran out, with the reason to close them.
    pub fn tick(&self, now_ms: u64) -> Vec<(ConnectionId, ErrorPayload)> {
        self.locks.expire_waits(now_ms);
        self.handshake
            .expire(now_ms)
            .into_iter()
            .map(|(connection, err)| (connection, err.as_error_payload()))
            .collect()
    }

    pub fn shutdown(&self) {
        self.pipeline.shutdown();
    }
}
