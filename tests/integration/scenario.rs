//! End-to-end coordination scenarios driven through the coordinator.

use dso_l2::core::{LockContext, LockOutcome, NotifyKind, NotifyRequest, TxnType};
use dso_l2::daemon::proto::{LockOp, LockRequest};
use dso_l2::daemon::{ClientMessage, ServerMessage};
use dso_l2::{ClientId, LockId, LockLevel, ObjectId, SequenceId, ThreadId};

use crate::fixtures::coordinator::{CLIENT_VERSION, Harness};
use crate::fixtures::txn::{create, handshake, holding, interested_in, notifying, resending, update};

fn lock(name: &str, thread: u64, op: LockOp) -> ClientMessage {
    ClientMessage::Lock(LockRequest {
        lock: LockId::named(name),
        thread: ThreadId::new(thread),
        op,
    })
}

const WRITE: LockOp = LockOp::Acquire {
    level: LockLevel::Write,
};

fn is_award_to(entry: &(ClientId, ServerMessage), client: u64) -> bool {
    matches!(
        entry,
        (to, ServerMessage::LockResponse(r))
            if *to == ClientId::new(client) && r.outcome == LockOutcome::Awarded
    )
}

#[test]
fn reconnect_resumes_locks_and_unacknowledged_transactions() {
    let h = Harness::start();
    let l = LockId::named("L");
    let (a, b) = (ClientId::new(1), ClientId::new(2));

    h.handshake(1, handshake(1, CLIENT_VERSION));
    h.handshake(2, handshake(2, CLIENT_VERSION));
    h.send(1, lock("L", 1, WRITE));

    // T1 is applied; its ack never reaches the client. T2 is lost in transit.
    h.commit(1, vec![create(1, 10, b"v1")]);
    h.expect_ack(1, 1);

    // B asks for L while A is away.
    h.send(2, lock("L", 1, WRITE));
    assert_eq!(h.coordinator.locks().queue_len(&l), 1);

    let held = LockContext::new(l.clone(), ThreadId::new(1), LockLevel::Write);
    let reconnect = resending(holding(handshake(1, CLIENT_VERSION), vec![held]), &[1, 2]);
    let ack = h.handshake(3, reconnect);
    assert_eq!(ack.acknowledged, vec![SequenceId::new(1)]);
    assert_eq!(ack.pending, vec![SequenceId::new(2)]);
    assert_eq!(h.coordinator.locks().hold_count(&l, a, ThreadId::new(1)), 1);
    assert_eq!(h.coordinator.locks().queue_len(&l), 1);

    let mut t2 = update(2, 10, b"v2");
    t2.txn_type = TxnType::Recovery;
    h.commit(3, vec![t2]);
    h.expect_ack(1, 2);
    let object = h.store.inner.get(ObjectId::new(10)).expect("object 10");
    assert_eq!(object.version, 2);
    assert_eq!(object.state.as_ref(), b"v2");

    h.send(3, lock("L", 1, LockOp::Release));
    h.outbound
        .collect_until(|log| log.iter().any(|e| is_award_to(e, 2)));
    assert_eq!(h.coordinator.locks().holders(&l).len(), 1);
    assert_eq!(h.coordinator.locks().hold_count(&l, b, ThreadId::new(1)), 1);
}

#[test]
fn notify_hands_the_lock_to_the_waiter_after_the_broadcast() {
    let h = Harness::start();
    let x = LockId::named("X");
    let (b, c) = (ClientId::new(2), ClientId::new(3));

    h.handshake(1, handshake(1, CLIENT_VERSION));
    h.handshake(2, handshake(2, CLIENT_VERSION));
    h.handshake(3, interested_in(handshake(3, CLIENT_VERSION), &[10]));

    // B takes X and waits on it, which lets A in.
    h.send(2, lock("X", 1, WRITE));
    h.send(2, lock("X", 1, LockOp::Wait { timeout_ms: None }));
    h.send(1, lock("X", 1, WRITE));
    assert_eq!(h.coordinator.locks().waiter_count(&x), 1);
    h.outbound.drain();

    let notify = NotifyRequest {
        lock: x.clone(),
        thread: ThreadId::new(1),
        kind: NotifyKind::One,
    };
    h.commit(1, vec![notifying(create(1, 10, b"state"), x.clone(), notify)]);
    let mut log = h.outbound.collect_until(|log| {
        log.iter()
            .any(|(to, m)| *to == ClientId::new(1) && matches!(m, ServerMessage::TxnAck { .. }))
    });
    // Notified but still blocked: A holds X until it releases.
    assert_eq!(h.coordinator.locks().hold_count(&x, b, ThreadId::new(1)), 0);
    assert!(!log.iter().any(|e| is_award_to(e, 2)));

    h.send(1, lock("X", 1, LockOp::Release));
    log.extend(
        h.outbound
            .collect_until(|log| log.iter().any(|e| is_award_to(e, 2))),
    );
    let delta_broadcast = log
        .iter()
        .position(|(to, m)| *to == c && matches!(m, ServerMessage::Broadcast(bc) if !bc.deltas.is_empty()))
        .expect("subscribed client saw the deltas");
    let award = log
        .iter()
        .position(|e| is_award_to(e, 2))
        .expect("waiter re-acquired");
    assert!(delta_broadcast < award);

    let notified: Vec<_> = log
        .iter()
        .filter_map(|(to, m)| match m {
            ServerMessage::Broadcast(bc) if *to == b && !bc.notified.is_empty() => Some(bc),
            _ => None,
        })
        .collect();
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].notified.len(), 1);
    assert_eq!(notified[0].notified[0].thread, ThreadId::new(1));
    assert_eq!(h.coordinator.locks().hold_count(&x, b, ThreadId::new(1)), 1);
    assert_eq!(h.coordinator.locks().waiter_count(&x), 0);
}
