//! Outbound delivery and per-client object interest.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

use crate::core::{ClientId, ObjectId};
use crate::daemon::events::{CoordinatorEvent, EventHandler};
use crate::daemon::proto::ServerMessage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboundError {
    #[error("{client} is not connected")]
    NotConnected { client: ClientId },
    #[error("channel to {client} is closed")]
    Closed { client: ClientId },
    #[error("outbound queue for {client} overflowed")]
    Overloaded { client: ClientId },
    #[error("failed to encode message for {client}: {reason}")]
    Encode { client: ClientId, reason: String },
}

/// The only way the coordinator writes to clients.
pub trait OutboundSink: Send + Sync {
    fn send(&self, client: ClientId, message: ServerMessage) -> Result<(), OutboundError>;
}

/// Which objects each client holds references to.
#[derive(Default)]
pub struct InterestRegistry {
    by_client: RwLock<HashMap<ClientId, BTreeSet<ObjectId>>>,
}

impl InterestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the client's interest set wholesale, as reported at handshake.
    pub fn replace(&self, client: ClientId, objects: impl IntoIterator<Item = ObjectId>) {
        let set: BTreeSet<ObjectId> = objects.into_iter().collect();
        self.by_client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client, set);
    }

    pub fn subscribe(&self, client: ClientId, objects: impl IntoIterator<Item = ObjectId>) {
        self.by_client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(client)
            .or_default()
            .extend(objects);
    }

    pub fn remove(&self, client: ClientId) {
        self.by_client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client);
    }

    /// Clients other than `origin` interested in any of `objects`.
    pub fn interested(&self, origin: ClientId, objects: &BTreeSet<ObjectId>) -> Vec<ClientId> {
        let table = self.by_client.read().unwrap_or_else(PoisonError::into_inner);
        let mut clients: Vec<ClientId> = table
            .iter()
            .filter(|(client, interest)| {
                **client != origin && objects.iter().any(|id| interest.contains(id))
            })
            .map(|(client, _)| *client)
            .collect();
        clients.sort();
        clients
    }

    pub fn is_interested(&self, client: ClientId, object: ObjectId) -> bool {
        self.by_client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client)
            .is_some_and(|set| set.contains(&object))
    }
}

impl EventHandler for InterestRegistry {
    fn handle(&self, event: &CoordinatorEvent) {
        if let CoordinatorEvent::ClientDisconnected { client } = event {
            self.remove(*client);
        }
    }
}
