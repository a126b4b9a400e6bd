//! A coordinator wired to a recording outbound sink and a failable store.

use std::sync::Arc;

use dso_l2::config::Config;
use dso_l2::core::{ProtocolErrorCode, TxnRecord};
use dso_l2::daemon::handshake::SessionRegistry;
use dso_l2::daemon::proto::{ClientHandshake, HandshakeAck};
use dso_l2::daemon::{ClientMessage, Coordinator, CoordinatorDeps, Disposition, ServerMessage};
use dso_l2::{ClientId, ConnectionId, ErrorPayload, SequenceId};

use super::outbound::RecordingOutbound;
use super::store::FailingStore;
use super::txn::batch;

pub const SERVER_VERSION: &str = "1.0.0";
pub const CLIENT_VERSION: &str = "1.0.4";

pub struct Harness {
    pub coordinator: Coordinator,
    pub outbound: Arc<RecordingOutbound>,
    pub store: FailingStore,
}

impl Harness {
    pub fn start() -> Self {
        Self::with_workers(2)
    }

    pub fn with_workers(apply_workers: usize) -> Self {
        let mut config = Config::default();
        config.server.server_version = SERVER_VERSION.to_string();
        config.pipeline.apply_workers = apply_workers;
        let outbound = Arc::new(RecordingOutbound::default());
        let store = FailingStore::default();
        let coordinator = Coordinator::start(
            &config,
            CoordinatorDeps {
                store: Arc::new(store.clone()),
                sessions: Arc::new(SessionRegistry::new()),
                outbound: outbound.clone(),
            },
        )
        .expect("coordinator starts");
        Self {
            coordinator,
            outbound,
            store,
        }
    }

    /// Runs `handshake` on `conn` and returns the ack the client received.
    pub fn handshake(&self, conn: u64, handshake: ClientHandshake) -> HandshakeAck {
        let client = handshake.client_id;
        let connection = ConnectionId::new(conn);
        self.coordinator.channel_established(connection, 0);
        let disposition = self
            .coordinator
            .dispatch(connection, ClientMessage::Handshake(handshake), 0);
        assert!(
            matches!(disposition, Disposition::Activated { client: c, .. } if c == client),
            "handshake refused: {disposition:?}"
        );
        self.outbound.expect(client, |message| match message {
            ServerMessage::HandshakeAck(ack) => Some(ack.clone()),
            _ => None,
        })
    }

    pub fn send(&self, conn: u64, message: ClientMessage) -> Disposition {
        self.coordinator
            .dispatch(ConnectionId::new(conn), message, 0)
    }

    pub fn commit(&self, conn: u64, records: Vec<TxnRecord>) -> Disposition {
        self.send(conn, ClientMessage::Commit(batch(records)))
    }

    pub fn expect_ack(&self, client: u64, seq: u64) {
        let want = SequenceId::new(seq);
        self.outbound
            .expect(ClientId::new(client), |message| match message {
                ServerMessage::TxnAck { sequence_id, .. } if *sequence_id == want => Some(()),
                _ => None,
            });
    }

    pub fn expect_error(&self, client: u64, code: ProtocolErrorCode) -> ErrorPayload {
        self.outbound
            .expect(ClientId::new(client), |message| match message {
                ServerMessage::Error(payload) if payload.code == code => Some(payload.clone()),
                _ => None,
            })
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.coordinator.shutdown();
    }
}
