//! A lossy in-memory link between two sans-IO channels.
//!
//! Data, ack and nak packets may be dropped, duplicated or reordered.
//! Control packets (open, open_ack, close) always arrive, in order.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use bytes::Bytes;
use dso_l2::core::ChannelSessionId;
use dso_l2::daemon::channel::{ChannelAction, Packet, SequencedChannel};
use dso_l2::Limits;

#[derive(Clone, Copy, Debug)]
pub struct Faults {
    pub drop: f64,
    pub duplicate: f64,
    pub reorder: bool,
}

pub struct LossyLink {
    rng: StdRng,
    faults: Faults,
}

impl LossyLink {
    pub fn new(seed: u64, faults: Faults) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            faults,
        }
    }

    /// Passes `packets` through the link.
    pub fn carry(&mut self, packets: Vec<Packet>) -> Vec<Packet> {
        let mut out = Vec::with_capacity(packets.len());
        for packet in packets {
            let lossy = matches!(
                packet,
                Packet::Data(_) | Packet::Ack { .. } | Packet::Nak { .. }
            );
            if !lossy {
                out.push(packet);
                continue;
            }
            if self.rng.gen_bool(self.faults.drop) {
                continue;
            }
            if self.rng.gen_bool(self.faults.duplicate) {
                out.push(packet.clone());
            }
            out.push(packet);
        }
        if self.faults.reorder {
            out.shuffle(&mut self.rng);
        }
        out
    }
}

pub fn transmitted(actions: &[ChannelAction]) -> Vec<Packet> {
    actions
        .iter()
        .filter_map(|action| match action {
            ChannelAction::Transmit(packet) => Some(packet.clone()),
            _ => None,
        })
        .collect()
}

pub fn delivered(actions: &[ChannelAction]) -> Vec<Bytes> {
    actions
        .iter()
        .filter_map(|action| match action {
            ChannelAction::Deliver(payload) => Some(payload.clone()),
            _ => None,
        })
        .collect()
}

pub fn closed(actions: &[ChannelAction]) -> bool {
    actions
        .iter()
        .any(|action| matches!(action, ChannelAction::Closed { .. }))
}

/// Limits with fast timers and no keepalive, for simulated time.
pub fn fast_limits() -> Limits {
    Limits {
        channel_max_unacked: 64,
        channel_ack_every: 4,
        channel_ack_delay_ms: 5,
        channel_retransmit_ms: 20,
        channel_gap_timeout_ms: 600_000,
        keepalive_ms: 0,
        dead_ms: 0,
        ..Limits::default()
    }
}

/// An initiator/acceptor pair that completed the open exchange.
pub fn open_pair(limits: &Limits) -> (SequencedChannel, SequencedChannel) {
    let mut client = SequencedChannel::initiator(ChannelSessionId::random(), limits, 0);
    let mut server = SequencedChannel::acceptor(limits, 0);
    let open = transmitted(&client.open(0));
    let mut replies = Vec::new();
    for packet in open {
        replies.extend(transmitted(&server.on_receive(packet, 0)));
    }
    for packet in replies {
        client.on_receive(packet, 0);
    }
    (client, server)
}
