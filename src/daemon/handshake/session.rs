//! Which connection speaks for which client.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::{ClientId, ConnectionId};
use crate::daemon::events::{CoordinatorEvent, EventHandler};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Channel is up; the client has until `deadline_ms` to hand-shake.
    AwaitingHandshake { deadline_ms: u64 },
    Active { client: ClientId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Activation {
    /// Connection that spoke for the client before this one.
    pub superseded: Option<ConnectionId>,
    /// The client was already known when it hand-shook.
    pub reconnect: bool,
}

#[derive(Default)]
struct Sessions {
    by_connection: HashMap<ConnectionId, SessionState>,
    by_client: HashMap<ClientId, ConnectionId>,
    known: HashSet<ClientId>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Sessions>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(&self, connection: ConnectionId, deadline_ms: u64) {
        self.sessions()
            .by_connection
            .insert(connection, SessionState::AwaitingHandshake { deadline_ms });
    }

    pub fn state(&self, connection: ConnectionId) -> Option<SessionState> {
        self.sessions().by_connection.get(&connection).copied()
    }

    pub fn client_of(&self, connection: ConnectionId) -> Option<ClientId> {
        match self.state(connection)? {
            SessionState::Active { client } => Some(client),
            SessionState::AwaitingHandshake { .. } => None,
        }
    }

    pub fn connection_of(&self, client: ClientId) -> Option<ConnectionId> {
        self.sessions().by_client.get(&client).copied()
    }

    /// Binds `client` to `connection`, replacing whatever connection spoke
    /// for it before. The replaced connection forgets its binding.
    pub fn activate(&self, connection: ConnectionId, client: ClientId) -> Activation {
        let mut sessions = self.sessions();
        let reconnect = !sessions.known.insert(client);
        let previous = sessions.by_client.insert(client, connection);
        let superseded = previous.filter(|prev| *prev != connection);
        if let Some(old) = superseded {
            sessions.by_connection.remove(&old);
        }
        sessions
            .by_connection
            .insert(connection, SessionState::Active { client });
        Activation {
            superseded,
            reconnect,
        }
    }

    /// Forgets `connection`. Returns the client it was actively speaking
    /// for, if any.
    pub fn close(&self, connection: ConnectionId) -> Option<ClientId> {
        let mut sessions = self.sessions();
        let state = sessions.by_connection.remove(&connection)?;
        let SessionState::Active { client } = state else {
            return None;
        };
        if sessions.by_client.get(&client) == Some(&connection) {
            sessions.by_client.remove(&client);
            Some(client)
        } else {
            None
        }
    }

    /// Connections whose handshake deadline has passed.
    pub fn expired(&self, now_ms: u64) -> Vec<ConnectionId> {
        let mut expired: Vec<ConnectionId> = self
            .sessions()
            .by_connection
            .iter()
            .filter_map(|(conn, state)| match state {
                SessionState::AwaitingHandshake { deadline_ms } if *deadline_ms <= now_ms => {
                    Some(*conn)
                }
                _ => None,
            })
            .collect();
        expired.sort();
        expired
    }

    pub fn active_clients(&self) -> usize {
        self.sessions().by_client.len()
    }
}

impl EventHandler for SessionRegistry {
    fn handle(&self, event: &CoordinatorEvent) {
        if let CoordinatorEvent::ClientDisconnected { client } = event {
            let mut sessions = self.sessions();
            sessions.known.remove(client);
            if let Some(conn) = sessions.by_client.remove(client) {
                sessions.by_connection.remove(&conn);
            }
        }
    }
}
