//! Sequenced channel delivery over a lossy link.

use bytes::Bytes;
use proptest::prelude::*;

use dso_l2::daemon::channel::{ChannelState, Packet, SequencedChannel};

use crate::fixtures::link::{Faults, LossyLink, closed, delivered, fast_limits, open_pair, transmitted};

const TICK_MS: u64 = 5;
const GIVE_UP_MS: u64 = 120_000;

fn payload(n: u64) -> Bytes {
    Bytes::from(n.to_be_bytes().to_vec())
}

struct Sim {
    client: SequencedChannel,
    server: SequencedChannel,
    link: LossyLink,
    to_server: Vec<Packet>,
    to_client: Vec<Packet>,
    received: Vec<Bytes>,
    next: u64,
    now: u64,
}

impl Sim {
    fn new(seed: u64, faults: Faults) -> Self {
        let (client, server) = open_pair(&fast_limits());
        Self {
            client,
            server,
            link: LossyLink::new(seed, faults),
            to_server: Vec::new(),
            to_client: Vec::new(),
            received: Vec::new(),
            next: 0,
            now: 0,
        }
    }

    /// Advances simulated time by one tick, offering up to `total` messages.
    fn step(&mut self, total: u64) {
        self.now += TICK_MS;
        let now = self.now;
        while self.next < total && !self.client.is_window_full() {
            let actions = self
                .client
                .send(payload(self.next), now)
                .expect("send within window");
            self.to_server.extend(transmitted(&actions));
            self.next += 1;
        }

        self.to_server
            .extend(transmitted(&self.client.poll_timers(now)));
        let actions = self.server.poll_timers(now);
        assert!(!closed(&actions), "server closed on timers");
        self.to_client.extend(transmitted(&actions));

        for packet in self.link.carry(std::mem::take(&mut self.to_server)) {
            let actions = self.server.on_receive(packet, now);
            assert!(!closed(&actions), "server closed: {actions:?}");
            self.received.extend(delivered(&actions));
            self.to_client.extend(transmitted(&actions));
        }
        for packet in self.link.carry(std::mem::take(&mut self.to_client)) {
            let actions = self.client.on_receive(packet, now);
            assert!(!closed(&actions), "client closed: {actions:?}");
            self.to_server.extend(transmitted(&actions));
        }
    }

    fn run_until_delivered(&mut self, total: u64) {
        while (self.received.len() as u64) < total && self.now < GIVE_UP_MS {
            self.step(total);
        }
    }

    /// Both transports die with packets in flight, then the client reopens.
    fn reconnect(&mut self) {
        self.to_server.clear();
        self.to_client.clear();
        let now = self.now;
        self.client.on_transport_reset(now);
        self.server.on_transport_reset(now);
        assert_eq!(self.server.state(), ChannelState::PausedAwaitingResend);

        let open = transmitted(&self.client.open(now));
        for packet in open {
            let actions = self.server.on_receive(packet, now);
            self.received.extend(delivered(&actions));
            self.to_client.extend(transmitted(&actions));
        }
        for packet in std::mem::take(&mut self.to_client) {
            let actions = self.client.on_receive(packet, now);
            self.to_server.extend(transmitted(&actions));
        }
        assert_eq!(self.client.state(), ChannelState::Established);
    }

    fn assert_exactly_once(&self, total: u64) {
        let expected: Vec<Bytes> = (0..total).map(payload).collect();
        assert_eq!(self.received, expected);
    }
}

#[test]
fn clean_link_delivers_in_order() {
    let faults = Faults {
        drop: 0.0,
        duplicate: 0.0,
        reorder: false,
    };
    let mut sim = Sim::new(1, faults);
    sim.run_until_delivered(500);
    sim.assert_exactly_once(500);
}

#[test]
fn resume_after_transport_loss_neither_loses_nor_repeats() {
    let faults = Faults {
        drop: 0.1,
        duplicate: 0.1,
        reorder: true,
    };
    let mut sim = Sim::new(7, faults);
    for _ in 0..10 {
        sim.step(300);
    }
    sim.reconnect();
    for _ in 0..10 {
        sim.step(300);
    }
    sim.reconnect();
    sim.run_until_delivered(300);
    sim.assert_exactly_once(300);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn lossy_link_delivers_exactly_once_in_order(
        seed in any::<u64>(),
        drop in 0.0f64..0.3,
        duplicate in 0.0f64..0.3,
        reorder in any::<bool>(),
        total in 1u64..400,
    ) {
        let mut sim = Sim::new(seed, Faults { drop, duplicate, reorder });
        sim.run_until_delivered(total);
        sim.assert_exactly_once(total);
    }
}
