//! Typed coordinator lifecycle events.
//!
//! Components that care about client lifecycle register an [`EventHandler`]
//! on the [`EventBus`] at assembly time. Handlers run synchronously on the
//! publishing thread, in registration order.

use std::sync::{Arc, PoisonError, RwLock};

use crate::core::{ClientId, ConnectionId, ProtocolErrorCode, SequenceId, TransactionId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinatorEvent {
    ConnectionEstablished {
        client: ClientId,
        connection: ConnectionId,
        reconnect: bool,
    },
    /// The client is gone for good: its locks, interest and pipeline state
    /// are released.
    ClientDisconnected { client: ClientId },
    HandshakeRejected {
        connection: ConnectionId,
        client: Option<ClientId>,
        code: ProtocolErrorCode,
        reason: String,
    },
    TransactionFailed {
        client: ClientId,
        txn_id: TransactionId,
        sequence_id: SequenceId,
        reason: String,
    },
    SessionSuperseded {
        client: ClientId,
        old: ConnectionId,
        new: ConnectionId,
    },
}

impl CoordinatorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorEvent::ConnectionEstablished { .. } => "connection_established",
            CoordinatorEvent::ClientDisconnected { .. } => "client_disconnected",
            CoordinatorEvent::HandshakeRejected { .. } => "handshake_rejected",
            CoordinatorEvent::TransactionFailed { .. } => "transaction_failed",
            CoordinatorEvent::SessionSuperseded { .. } => "session_superseded",
        }
    }
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &CoordinatorEvent);
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn publish(&self, event: CoordinatorEvent) {
        tracing::debug!(event = event.name(), "publish");
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler.handle(&event);
        }
    }
}

/// Operator-facing log lines for lifecycle events.
pub struct OperatorEventLog;

impl EventHandler for OperatorEventLog {
    fn handle(&self, event: &CoordinatorEvent) {
        match event {
            CoordinatorEvent::ConnectionEstablished {
                client,
                connection,
                reconnect,
            } => {
                tracing::info!(target: "operator", %client, %connection, reconnect, "client joined");
            }
            CoordinatorEvent::ClientDisconnected { client } => {
                tracing::info!(target: "operator", %client, "client left");
            }
            CoordinatorEvent::HandshakeRejected {
                connection,
                client,
                code,
                reason,
            } => {
                tracing::warn!(
                    target: "operator",
                    %connection,
                    client = ?client,
                    code = code.as_str(),
                    %reason,
                    "handshake rejected"
                );
            }
            CoordinatorEvent::TransactionFailed {
                client,
                txn_id,
                sequence_id,
                reason,
            } => {
                tracing::error!(
                    target: "operator",
                    %client,
                    %txn_id,
                    %sequence_id,
                    %reason,
                    "transaction failed"
                );
            }
            CoordinatorEvent::SessionSuperseded { client, old, new } => {
                tracing::info!(target: "operator", %client, %old, %new, "session superseded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<&'static str>>);

    impl EventHandler for Recording {
        fn handle(&self, event: &CoordinatorEvent) {
            self.0.lock().unwrap().push(event.name());
        }
    }

    #[test]
    fn handlers_see_events_in_order() {
        let bus = EventBus::new();
        let first = Arc::new(Recording::default());
        let second = Arc::new(Recording::default());
        bus.register(first.clone());
        bus.register(Arc::new(OperatorEventLog));
        bus.register(second.clone());

        bus.publish(CoordinatorEvent::ClientDisconnected {
            client: ClientId::new(1),
        });
        bus.publish(CoordinatorEvent::SessionSuperseded {
            client: ClientId::new(1),
            old: ConnectionId::new(1),
            new: ConnectionId::new(2),
        });

        let expected = vec!["client_disconnected", "session_superseded"];
        assert_eq!(*first.0.lock().unwrap(), expected);
        assert_eq!(*second.0.lock().unwrap(), expected);
    }
}
