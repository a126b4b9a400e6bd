//! Distributed locks shared by several clients.

use dso_l2::core::{LockOutcome, LockOwner, ProtocolErrorCode};
use dso_l2::daemon::proto::{LockOp, LockRequest};
use dso_l2::daemon::{ClientMessage, Disposition, ServerMessage};
use dso_l2::{ClientId, ConnectionId, LockId, LockLevel, ThreadId};

use crate::fixtures::coordinator::{CLIENT_VERSION, Harness};
use crate::fixtures::txn::handshake;

fn request(op: LockOp) -> ClientMessage {
    ClientMessage::Lock(LockRequest {
        lock: LockId::named("shared"),
        thread: ThreadId::new(1),
        op,
    })
}

fn acquire(level: LockLevel) -> ClientMessage {
    request(LockOp::Acquire { level })
}

fn outcome_for(h: &Harness, client: u64) -> LockOutcome {
    h.outbound
        .expect(ClientId::new(client), |message| match message {
            ServerMessage::LockResponse(response) => Some(response.outcome),
            _ => None,
        })
}

fn connect(h: &Harness, clients: &[u64]) {
    for &client in clients {
        h.handshake(client, handshake(client, CLIENT_VERSION));
    }
}

#[test]
fn writer_waits_for_every_reader() {
    let h = Harness::start();
    let lock = LockId::named("shared");
    connect(&h, &[1, 2, 3]);

    h.send(1, acquire(LockLevel::Read));
    assert_eq!(outcome_for(&h, 1), LockOutcome::Awarded);
    h.send(2, acquire(LockLevel::Read));
    assert_eq!(outcome_for(&h, 2), LockOutcome::Awarded);
    h.send(3, acquire(LockLevel::Write));
    assert_eq!(h.coordinator.locks().queue_len(&lock), 1);

    // A departing reader is not enough.
    h.coordinator.connection_closed(ConnectionId::new(1));
    assert_eq!(h.coordinator.locks().queue_len(&lock), 1);

    h.send(2, request(LockOp::Release));
    assert_eq!(outcome_for(&h, 3), LockOutcome::Awarded);
    assert_eq!(
        h.coordinator.locks().holders(&lock),
        vec![(
            LockOwner::new(ClientId::new(3), ThreadId::new(1)),
            LockLevel::Write
        )]
    );
}

#[test]
fn queued_writers_are_granted_first_come_first_served() {
    let h = Harness::start();
    connect(&h, &[1, 2, 3, 4]);

    h.send(1, acquire(LockLevel::Write));
    for client in [3, 2, 4] {
        h.send(client, acquire(LockLevel::Write));
    }
    h.outbound.drain();

    let mut order = Vec::new();
    let mut holder = 1;
    for _ in 0..3 {
        h.send(holder, request(LockOp::Release));
        let (next, _) = h
            .outbound
            .collect_until(|log| {
                log.iter()
                    .any(|(_, m)| matches!(m, ServerMessage::LockResponse(_)))
            })
            .into_iter()
            .find(|(_, m)| matches!(m, ServerMessage::LockResponse(_)))
            .expect("award");
        order.push(next.get());
        holder = next.get();
    }
    assert_eq!(order, vec![3, 2, 4]);
}

#[test]
fn try_acquire_is_refused_without_queueing() {
    let h = Harness::start();
    let lock = LockId::named("shared");
    connect(&h, &[1, 2]);

    h.send(1, acquire(LockLevel::Write));
    h.send(2, request(LockOp::TryAcquire { level: LockLevel::Read }));
    assert_eq!(outcome_for(&h, 2), LockOutcome::Refused);
    assert_eq!(h.coordinator.locks().queue_len(&lock), 0);
}

#[test]
fn cancelled_request_leaves_the_queue() {
    let h = Harness::start();
    let lock = LockId::named("shared");
    connect(&h, &[1, 2]);

    h.send(1, acquire(LockLevel::Write));
    h.send(2, acquire(LockLevel::Write));
    h.send(2, request(LockOp::Cancel));
    assert_eq!(outcome_for(&h, 2), LockOutcome::Cancelled);
    assert_eq!(h.coordinator.locks().queue_len(&lock), 0);
}

#[test]
fn contract_violation_is_reported_and_the_connection_survives() {
    let h = Harness::start();
    connect(&h, &[1]);

    assert_eq!(h.send(1, request(LockOp::Release)), Disposition::Continue);
    h.expect_error(1, ProtocolErrorCode::LockProtocol);

    h.send(1, acquire(LockLevel::Write));
    assert_eq!(outcome_for(&h, 1), LockOutcome::Awarded);
}
