//! The coordinator over real TCP connections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dso_l2::config::Config;
use dso_l2::core::{LockOutcome, ProtocolErrorCode};
use dso_l2::daemon::proto::{LockOp, LockRequest};
use dso_l2::daemon::{ClientMessage, InMemoryObjectStore, Server, ServerHandle, ServerMessage};
use dso_l2::{ClientId, LockId, LockLevel, ObjectId, ThreadId, TransactionId};

use crate::fixtures::client::{Received, TestClient};
use crate::fixtures::coordinator::{CLIENT_VERSION, SERVER_VERSION};
use crate::fixtures::txn::{batch, create, handshake, interested_in, update};

fn start() -> (ServerHandle, InMemoryObjectStore) {
    start_with(|_| {})
}

fn start_with(tune: impl FnOnce(&mut Config)) -> (ServerHandle, InMemoryObjectStore) {
    let mut config = Config::default();
    config.server.listen_addr = "127.0.0.1:0".to_string();
    config.server.server_version = SERVER_VERSION.to_string();
    config.pipeline.apply_workers = 2;
    tune(&mut config);
    let store = InMemoryObjectStore::new();
    let handle = Server::start(&config, Arc::new(store.clone())).expect("server starts");
    (handle, store)
}

fn join(handle: &ServerHandle, message: dso_l2::daemon::proto::ClientHandshake) -> TestClient {
    let client = TestClient::connect(handle.local_addr());
    client.send(&ClientMessage::Handshake(message));
    client.recv_matching(|m| match m {
        ServerMessage::HandshakeAck(_) => Some(()),
        ServerMessage::HandshakeReject(err) => panic!("handshake rejected: {err:?}"),
        _ => None,
    });
    client
}

fn lock_op(op: LockOp) -> ClientMessage {
    ClientMessage::Lock(LockRequest {
        lock: LockId::named("door"),
        thread: ThreadId::new(1),
        op,
    })
}

fn next_lock_outcome(client: &TestClient) -> LockOutcome {
    client.recv_matching(|m| match m {
        ServerMessage::LockResponse(response) => Some(response.outcome),
        _ => None,
    })
}

#[test]
fn commit_is_acknowledged_and_broadcast() {
    let (server, store) = start();
    let a = join(&server, handshake(1, CLIENT_VERSION));
    let b = join(&server, interested_in(handshake(2, CLIENT_VERSION), &[10]));

    a.send(&ClientMessage::Commit(batch(vec![create(1, 10, b"hello")])));
    a.recv_matching(|m| matches!(m, ServerMessage::TxnAck { .. }).then_some(()));
    let broadcast = b.recv_matching(|m| match m {
        ServerMessage::Broadcast(bc) => Some(bc.clone()),
        _ => None,
    });
    assert_eq!(broadcast.origin, ClientId::new(1));
    assert_eq!(broadcast.deltas.len(), 1);
    assert_eq!(
        store.get(ObjectId::new(10)).map(|o| o.state),
        Some(bytes::Bytes::from_static(b"hello"))
    );

    drop((a, b));
    server.shutdown();
}

#[test]
fn traffic_before_handshake_closes_the_channel() {
    let (server, _store) = start();
    let client = TestClient::connect(server.local_addr());
    client.send(&ClientMessage::RequestObjectIds { count: 4 });

    let error = client.closed().expect("close carries a reason");
    assert_eq!(error.code, ProtocolErrorCode::HandshakeRequired);
    drop(client);
    server.shutdown();
}

#[test]
fn lock_passes_between_clients() {
    let (server, _store) = start();
    let a = join(&server, handshake(1, CLIENT_VERSION));
    let b = join(&server, handshake(2, CLIENT_VERSION));

    a.send(&lock_op(LockOp::Acquire { level: LockLevel::Write }));
    assert_eq!(next_lock_outcome(&a), LockOutcome::Awarded);
    b.send(&lock_op(LockOp::Acquire { level: LockLevel::Write }));
    a.send(&lock_op(LockOp::Release));
    assert_eq!(next_lock_outcome(&b), LockOutcome::Awarded);

    drop((a, b));
    server.shutdown();
}

#[test]
fn lost_transport_resumes_the_same_session() {
    let (server, _store) = start();
    let mut a = join(&server, handshake(1, CLIENT_VERSION));
    a.send(&lock_op(LockOp::Acquire { level: LockLevel::Write }));
    assert_eq!(next_lock_outcome(&a), LockOutcome::Awarded);

    a.reconnect();
    loop {
        match a.next_event() {
            Received::Established { resumed } => {
                assert!(resumed);
                break;
            }
            Received::Closed { error } => panic!("closed instead of resuming: {error:?}"),
            Received::Message(_) => {}
        }
    }

    // No new handshake was needed and the lock survived.
    a.send(&ClientMessage::Commit(batch(vec![create(1, 20, b"x")])));
    a.recv_matching(|m| matches!(m, ServerMessage::TxnAck { .. }).then_some(()));
    assert_eq!(
        server.coordinator().locks().hold_count(
            &LockId::named("door"),
            ClientId::new(1),
            ThreadId::new(1)
        ),
        1
    );
    assert_eq!(server.connection_count(), 1);

    drop(a);
    server.shutdown();
}

fn wait_for_resume(client: &TestClient) {
    loop {
        match client.next_event() {
            Received::Established { resumed } => {
                assert!(resumed);
                return;
            }
            Received::Closed { error } => panic!("closed instead of resuming: {error:?}"),
            Received::Message(_) => {}
        }
    }
}

#[test]
fn paused_subscriber_neither_stalls_others_nor_misses_broadcasts() {
    let (server, _store) = start_with(|config| config.limits.channel_max_unacked = 2);
    let a = join(&server, handshake(1, CLIENT_VERSION));
    let mut b = join(&server, interested_in(handshake(2, CLIENT_VERSION), &[10]));
    b.drop_transport();

    let started = Instant::now();
    a.send(&ClientMessage::Commit(batch(vec![
        create(1, 10, b"v1"),
        update(2, 10, b"v2"),
        update(3, 10, b"v3"),
        update(4, 10, b"v4"),
    ])));
    let mut acked = Vec::new();
    while acked.len() < 4 {
        acked.push(a.recv_matching(|m| match m {
            ServerMessage::TxnAck { txn_id, .. } => Some(*txn_id),
            _ => None,
        }));
    }
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "acks waited on a paused subscriber: {:?}",
        started.elapsed()
    );
    assert_eq!(acked, (1..=4).map(TransactionId::new).collect::<Vec<_>>());

    b.reconnect();
    wait_for_resume(&b);
    let mut seen = Vec::new();
    while seen.len() < 4 {
        seen.push(b.recv_matching(|m| match m {
            ServerMessage::Broadcast(bc) => Some(bc.txn_id),
            _ => None,
        }));
    }
    assert_eq!(seen, (1..=4).map(TransactionId::new).collect::<Vec<_>>());

    drop((a, b));
    server.shutdown();
}

#[test]
fn outbound_overflow_closes_the_subscriber() {
    let (server, _store) = start_with(|config| {
        config.limits.channel_max_unacked = 1;
        config.limits.outbound_queue_capacity = 2;
    });
    let a = join(&server, handshake(1, CLIENT_VERSION));
    let mut b = join(&server, interested_in(handshake(2, CLIENT_VERSION), &[10]));
    b.drop_transport();

    let records = std::iter::once(create(1, 10, b"v"))
        .chain((2..=8).map(|n| update(n, 10, b"v")))
        .collect();
    a.send(&ClientMessage::Commit(batch(records)));
    for _ in 0..8 {
        a.recv_matching(|m| matches!(m, ServerMessage::TxnAck { .. }).then_some(()));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.connection_count() > 1 {
        assert!(Instant::now() < deadline, "overflowed subscriber was not closed");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(server.coordinator().sessions().connection_of(ClientId::new(2)).is_none());

    drop((a, b));
    server.shutdown();
}
