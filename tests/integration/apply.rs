//! Transaction apply pipeline behind a coordinator.

use std::collections::BTreeMap;

use proptest::prelude::*;

use dso_l2::core::ProtocolErrorCode;
use dso_l2::daemon::{Disposition, ServerMessage};
use dso_l2::{ClientId, GlobalTransactionId, ObjectId, SequenceId, TransactionId};

use crate::fixtures::coordinator::{CLIENT_VERSION, Harness};
use crate::fixtures::txn::{create, handshake, interested_in, resending, update};

#[test]
fn broadcasts_follow_commit_order() {
    let h = Harness::start();
    h.handshake(1, handshake(1, CLIENT_VERSION));
    h.handshake(2, interested_in(handshake(2, CLIENT_VERSION), &[10, 11]));

    h.commit(1, vec![create(1, 10, b"a"), create(2, 11, b"b")]);
    h.commit(1, vec![update(3, 10, b"c")]);
    for seq in 1..=3 {
        h.expect_ack(1, seq);
    }

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let broadcast = h.outbound.expect(ClientId::new(2), |message| match message {
            ServerMessage::Broadcast(b) => Some(b.clone()),
            _ => None,
        });
        assert_eq!(broadcast.origin, ClientId::new(1));
        seen.push((broadcast.gid, broadcast.txn_id));
    }
    assert!(seen.windows(2).all(|pair| pair[0].0 < pair[1].0));
    assert_eq!(
        seen.iter().map(|(_, txn)| *txn).collect::<Vec<_>>(),
        vec![TransactionId::new(1), TransactionId::new(2), TransactionId::new(3)]
    );

    let object = h.store.inner.get(ObjectId::new(10)).expect("object 10");
    assert_eq!(object.version, 2);
    assert_eq!(object.state.as_ref(), b"c");
}

#[test]
fn failed_delta_applies_nothing() {
    let h = Harness::start();
    h.handshake(1, handshake(1, CLIENT_VERSION));

    let mut txn = create(1, 10, b"a");
    txn.deltas.extend(update(1, 99, b"missing").deltas);
    h.commit(1, vec![txn]);

    let error = h.expect_error(1, ProtocolErrorCode::TransactionFailed);
    assert!(!error.retryable);
    assert!(h.store.inner.get(ObjectId::new(10)).is_none());
    assert!(h.coordinator.pipeline().is_fenced(ClientId::new(1)));
}

#[test]
fn failed_commit_fences_until_the_next_handshake() {
    let h = Harness::start();
    h.handshake(1, handshake(1, CLIENT_VERSION));
    h.store.fail_commits(true);

    h.commit(1, vec![create(1, 10, b"a")]);
    h.expect_error(1, ProtocolErrorCode::TransactionFailed);

    // Fenced: later submissions are dropped, not applied or acknowledged.
    assert_eq!(h.commit(1, vec![create(2, 11, b"b")]), Disposition::Continue);
    assert!(h.coordinator.pipeline().is_fenced(ClientId::new(1)));
    assert!(h.store.inner.is_empty());

    h.store.fail_commits(false);
    let ack = h.handshake(2, resending(handshake(1, CLIENT_VERSION), &[1, 2]));
    assert!(ack.acknowledged.is_empty());
    assert_eq!(ack.pending, vec![SequenceId::new(1), SequenceId::new(2)]);
    assert!(!h.coordinator.pipeline().is_fenced(ClientId::new(1)));

    h.commit(2, vec![create(1, 10, b"a"), create(2, 11, b"b")]);
    h.expect_ack(1, 1);
    h.expect_ack(1, 2);
    assert_eq!(h.store.inner.len(), 2);
}

#[test]
fn resent_applied_transaction_is_acknowledged_again() {
    let h = Harness::start();
    h.handshake(1, handshake(1, CLIENT_VERSION));
    h.commit(1, vec![create(1, 10, b"a")]);
    h.expect_ack(1, 1);

    h.commit(1, vec![create(1, 10, b"a")]);
    h.expect_ack(1, 1);
    let object = h.store.inner.get(ObjectId::new(10)).expect("object 10");
    assert_eq!(object.version, 1);
}

#[test]
fn sequence_gap_closes_the_connection_without_acknowledging() {
    let h = Harness::start();
    h.handshake(1, handshake(1, CLIENT_VERSION));
    h.commit(1, vec![create(1, 10, b"a")]);
    h.expect_ack(1, 1);

    let Disposition::Close { error, .. } = h.commit(1, vec![create(3, 12, b"c")]) else {
        panic!("a skipped sequence id must close the connection");
    };
    assert_eq!(error.code, ProtocolErrorCode::SequenceViolation);
    assert!(h.store.inner.get(ObjectId::new(12)).is_none());
    assert!(h.outbound.drain().iter().all(|(_, message)| {
        !matches!(message, ServerMessage::TxnAck { sequence_id, .. } if *sequence_id == SequenceId::new(3))
    }));
}

const WRITERS: u64 = 4;
const READERS: [u64; 2] = [10, 11];

fn object_of(writer: u64) -> u64 {
    100 + writer
}

/// Commits one transaction per entry of `order`, each from the writer the
/// entry names, and checks ordering at every origin and every receiver.
fn check_interleaved_commits(workers: usize, order: &[u64]) {
    let h = Harness::with_workers(workers);
    for writer in 1..=WRITERS {
        h.handshake(writer, handshake(writer, CLIENT_VERSION));
    }
    let watched: Vec<u64> = (1..=WRITERS).map(object_of).collect();
    for reader in READERS {
        h.handshake(reader, interested_in(handshake(reader, CLIENT_VERSION), &watched));
    }

    let mut committed: BTreeMap<u64, u64> = BTreeMap::new();
    for &writer in order {
        let n = committed.entry(writer).or_default();
        *n += 1;
        let record = if *n == 1 {
            create(*n, object_of(writer), b"v")
        } else {
            update(*n, object_of(writer), b"v")
        };
        assert_eq!(h.commit(writer, vec![record]), Disposition::Continue);
    }

    let total = order.len();
    let log = h.outbound.collect_until(|log| {
        let acks = log
            .iter()
            .filter(|(_, m)| matches!(m, ServerMessage::TxnAck { .. }))
            .count();
        let broadcasts = log
            .iter()
            .filter(|(_, m)| matches!(m, ServerMessage::Broadcast(_)))
            .count();
        acks == total && broadcasts == total * READERS.len()
    });

    let mut acks: BTreeMap<ClientId, Vec<u64>> = BTreeMap::new();
    let mut received: BTreeMap<ClientId, Vec<(GlobalTransactionId, ClientId, u64)>> =
        BTreeMap::new();
    for (to, message) in &log {
        match message {
            ServerMessage::TxnAck { txn_id, .. } => acks.entry(*to).or_default().push(txn_id.get()),
            ServerMessage::Broadcast(b) => received
                .entry(*to)
                .or_default()
                .push((b.gid, b.origin, b.txn_id.get())),
            _ => {}
        }
    }

    for (&writer, &count) in &committed {
        let client = ClientId::new(writer);
        assert_eq!(acks[&client], (1..=count).collect::<Vec<_>>(), "acks of {client}");
        let object = h.store.inner.get(ObjectId::new(object_of(writer))).expect("object");
        assert_eq!(object.version, count);
    }
    let mut by_gid: BTreeMap<GlobalTransactionId, (ClientId, u64)> = BTreeMap::new();
    for reader in READERS {
        let stream = &received[&ClientId::new(reader)];
        assert!(
            stream.windows(2).all(|pair| pair[0].0 < pair[1].0),
            "broadcasts to reader {reader} out of gid order: {stream:?}"
        );
        for (&writer, &count) in &committed {
            let from_writer: Vec<u64> = stream
                .iter()
                .filter(|(_, origin, _)| *origin == ClientId::new(writer))
                .map(|(_, _, txn)| *txn)
                .collect();
            assert_eq!(from_writer, (1..=count).collect::<Vec<_>>());
        }
        for &(gid, origin, txn) in stream {
            let seen = *by_gid.entry(gid).or_insert((origin, txn));
            assert_eq!(seen, (origin, txn), "{gid} named two transactions");
        }
    }
}

#[test]
fn interleaved_clients_keep_their_own_order() {
    let order: Vec<u64> = (0..40).map(|i| i % WRITERS + 1).collect();
    check_interleaved_commits(4, &order);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn any_interleaving_preserves_per_client_and_gid_order(
        workers in 2usize..=4,
        order in proptest::collection::vec(1u64..=WRITERS, 1..40),
    ) {
        check_interleaved_commits(workers, &order);
    }
}
