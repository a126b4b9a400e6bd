//! Sans-IO sequenced channel state machine.
//!
//! The channel never touches a socket: every call returns the
//! [`ChannelAction`]s the owner must carry out (transmit a packet, hand a
//! payload to the upper layer, report a state change).

use bytes::Bytes;

use crate::core::error::details::SequenceViolationDetails;
use crate::core::{ChannelSessionId, ErrorPayload, Limits, ProtocolErrorCode};

use super::ChannelError;
use super::gap_buffer::{GapReject, IngestDecision, NakRange, ReceiveBuffer};
use super::keepalive::{KeepaliveDecision, KeepaliveTracker};
use super::packet::{Data, Open, Packet};
use super::send_window::SendWindow;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRole {
    /// Client side: sends `Open`, waits for `OpenAck`.
    Initiator,
    /// Server side: answers `Open`.
    Acceptor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Handshake,
    Established,
    PausedAwaitingResend,
    Closed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelAction {
    Transmit(Packet),
    Deliver(Bytes),
    Established { resumed: bool },
    Paused,
    Closed {
        error: Option<ErrorPayload>,
        by_peer: bool,
    },
}

#[derive(Clone, Debug)]
pub struct SequencedChannel {
    role: ChannelRole,
    state: ChannelState,
    session: Option<ChannelSessionId>,
    send: SendWindow,
    recv: ReceiveBuffer,
    keepalive: KeepaliveTracker,
    established_once: bool,
    /// Highest cumulative ack value put on the wire.
    ack_sent: u64,
    ack_pending_since_ms: Option<u64>,
    paused_at_ms: Option<u64>,
    retransmit_ms: u64,
    ack_delay_ms: u64,
    ack_every: u64,
    reconnect_window_ms: u64,
}

impl SequencedChannel {
    pub fn initiator(session: ChannelSessionId, limits: &Limits, now_ms: u64) -> Self {
        Self::new(ChannelRole::Initiator, Some(session), limits, now_ms)
    }

    pub fn acceptor(limits: &Limits, now_ms: u64) -> Self {
        Self::new(ChannelRole::Acceptor, None, limits, now_ms)
    }

    fn new(
        role: ChannelRole,
        session: Option<ChannelSessionId>,
        limits: &Limits,
        now_ms: u64,
    ) -> Self {
        Self {
            role,
            state: ChannelState::Handshake,
            session,
            send: SendWindow::new(limits.channel_max_unacked),
            recv: ReceiveBuffer::new(limits),
            keepalive: KeepaliveTracker::new(limits, now_ms),
            established_once: false,
            ack_sent: 0,
            ack_pending_since_ms: None,
            paused_at_ms: None,
            retransmit_ms: limits.channel_retransmit_ms,
            ack_delay_ms: limits.channel_ack_delay_ms,
            ack_every: limits.channel_ack_every.max(1) as u64,
            reconnect_window_ms: limits.reconnect_window_ms,
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn session(&self) -> Option<ChannelSessionId> {
        self.session
    }

    pub fn next_expected(&self) -> u64 {
        self.recv.next_expected()
    }

    pub fn unacked(&self) -> usize {
        self.send.unacked()
    }

    pub fn is_window_full(&self) -> bool {
        self.send.is_full()
    }

    /// Initiator only: (re)sends `Open` on a fresh transport.
    pub fn open(&mut self, now_ms: u64) -> Vec<ChannelAction> {
        let mut actions = Vec::new();
        let Some(session) = self.session else {
            return actions;
        };
        if self.role != ChannelRole::Initiator || self.state == ChannelState::Closed {
            return actions;
        }
        self.state = ChannelState::Handshake;
        self.keepalive.reset(now_ms);
        let open = Packet::Open(Open {
            session,
            next_expected: self.recv.next_expected(),
        });
        self.transmit(open, now_ms, &mut actions);
        actions
    }

    /// Queues `payload` for ordered delivery.
    ///
    /// Messages sent while the channel is not established are held in the
    /// window and go out when the session (re)opens.
    pub fn send(&mut self, payload: Bytes, now_ms: u64) -> Result<Vec<ChannelAction>, ChannelError> {
        if self.state == ChannelState::Closed {
            return Err(ChannelError::Closed);
        }
        let seq = self.send.push(payload.clone())?;
        let mut actions = Vec::new();
        if self.state == ChannelState::Established {
            let data = self.data_packet(seq, payload);
            self.transmit(data, now_ms, &mut actions);
        }
        Ok(actions)
    }

    pub fn on_receive(&mut self, packet: Packet, now_ms: u64) -> Vec<ChannelAction> {
        let mut actions = Vec::new();
        if self.state == ChannelState::Closed {
            return actions;
        }
        self.keepalive.note_recv(now_ms);

        match packet {
            Packet::Open(open) => self.on_open(open, now_ms, &mut actions),
            Packet::OpenAck(open) => self.on_open_ack(open, now_ms, &mut actions),
            Packet::Data(data) => self.on_data(data, now_ms, &mut actions),
            Packet::Ack { seq } => {
                if self.state == ChannelState::Established
                    && let Err(err) = self.send.ack(seq)
                {
                    self.violation(&err, now_ms, &mut actions);
                }
            }
            Packet::Nak { from, to } => {
                if self.state == ChannelState::Established {
                    self.on_nak(from, to, now_ms, &mut actions);
                }
            }
            Packet::Ping { nonce } => self.transmit(Packet::Pong { nonce }, now_ms, &mut actions),
            Packet::Pong { .. } => {}
            Packet::Close { error } => {
                self.state = ChannelState::Closed;
                actions.push(ChannelAction::Closed {
                    error,
                    by_peer: true,
                });
            }
        }
        actions
    }

    fn on_open(&mut self, open: Open, now_ms: u64, actions: &mut Vec<ChannelAction>) {
        if self.role != ChannelRole::Acceptor {
            self.close_with(
                ErrorPayload::new(
                    ProtocolErrorCode::InvalidRequest,
                    "initiator received open",
                    false,
                ),
                now_ms,
                actions,
            );
            return;
        }
        match self.session {
            None => self.session = Some(open.session),
            Some(current) if current == open.session => {}
            Some(_) => {
                self.close_with(
                    ErrorPayload::new(
                        ProtocolErrorCode::InvalidRequest,
                        "open for a different channel session",
                        false,
                    ),
                    now_ms,
                    actions,
                );
                return;
            }
        }
        if !self.resume_from(open.next_expected, now_ms, actions) {
            return;
        }
        let ack = Packet::OpenAck(Open {
            session: open.session,
            next_expected: self.recv.next_expected(),
        });
        self.transmit(ack, now_ms, actions);
        self.finish_establish(now_ms, actions);
    }

    fn on_open_ack(&mut self, open: Open, now_ms: u64, actions: &mut Vec<ChannelAction>) {
        if self.role != ChannelRole::Initiator || self.session != Some(open.session) {
            self.close_with(
                ErrorPayload::new(
                    ProtocolErrorCode::InvalidRequest,
                    "unexpected open_ack",
                    false,
                ),
                now_ms,
                actions,
            );
            return;
        }
        if self.state != ChannelState::Handshake {
            return;
        }
        if self.resume_from(open.next_expected, now_ms, actions) {
            self.finish_establish(now_ms, actions);
        }
    }

    /// Applies the peer's resume position. Returns `false` if the channel
    /// was closed for a sequence violation.
    fn resume_from(
        &mut self,
        peer_next_expected: u64,
        now_ms: u64,
        actions: &mut Vec<ChannelAction>,
    ) -> bool {
        let peer_acked = peer_next_expected.saturating_sub(1);
        if peer_acked < self.send.acked() {
            let payload = ErrorPayload::new(
                ProtocolErrorCode::SequenceViolation,
                format!(
                    "resume position {peer_next_expected} regresses below acknowledged {}",
                    self.send.acked()
                ),
                false,
            )
            .with_details(SequenceViolationDetails {
                expected_at_least: self.send.acked() + 1,
                got: peer_next_expected,
            });
            self.close_with(payload, now_ms, actions);
            return false;
        }
        if let Err(err) = self.send.ack(peer_acked) {
            self.violation(&err, now_ms, actions);
            return false;
        }
        true
    }

    fn finish_establish(&mut self, now_ms: u64, actions: &mut Vec<ChannelAction>) {
        let resumed = self.established_once;
        self.state = ChannelState::Established;
        self.established_once = true;
        self.paused_at_ms = None;
        self.keepalive.reset(now_ms);
        actions.push(ChannelAction::Established { resumed });
        for (seq, payload) in self.send.all() {
            let data = self.data_packet(seq, payload);
            self.transmit(data, now_ms, actions);
        }
    }

    fn on_data(&mut self, data: Data, now_ms: u64, actions: &mut Vec<ChannelAction>) {
        match self.state {
            ChannelState::Established => {}
            ChannelState::PausedAwaitingResend | ChannelState::Closed => return,
            ChannelState::Handshake => {
                self.close_with(
                    ErrorPayload::new(
                        ProtocolErrorCode::InvalidRequest,
                        "data before channel open",
                        false,
                    ),
                    now_ms,
                    actions,
                );
                return;
            }
        }

        if let Err(err) = self.send.ack(data.ack) {
            self.violation(&err, now_ms, actions);
            return;
        }

        match self.recv.ingest(data.seq, data.payload, now_ms) {
            IngestDecision::Deliver { messages, nak } => {
                actions.extend(messages.into_iter().map(ChannelAction::Deliver));
                if let Some(nak) = nak {
                    self.transmit_nak(nak, now_ms, actions);
                }
                if self.recv.delivered() - self.ack_sent >= self.ack_every {
                    let ack = Packet::Ack {
                        seq: self.recv.delivered(),
                    };
                    self.transmit(ack, now_ms, actions);
                } else if self.ack_pending_since_ms.is_none() {
                    self.ack_pending_since_ms = Some(now_ms);
                }
            }
            IngestDecision::Buffered { nak } => {
                if let Some(nak) = nak {
                    self.transmit_nak(nak, now_ms, actions);
                }
            }
            IngestDecision::Duplicate => {
                let ack = Packet::Ack {
                    seq: self.recv.delivered(),
                };
                self.transmit(ack, now_ms, actions);
            }
            IngestDecision::Reject(reject) => self.gap_failure(reject, now_ms, actions),
        }
    }

    fn on_nak(&mut self, from: u64, to: u64, now_ms: u64, actions: &mut Vec<ChannelAction>) {
        match self.send.range(from, to) {
            Ok(resend) => {
                for (seq, payload) in resend {
                    let data = self.data_packet(seq, payload);
                    self.transmit(data, now_ms, actions);
                }
            }
            Err(err) => self.violation(&err, now_ms, actions),
        }
    }

    /// Transport lost. Unacknowledged messages are kept for the resume.
    pub fn on_transport_reset(&mut self, now_ms: u64) -> Vec<ChannelAction> {
        match self.state {
            ChannelState::Closed | ChannelState::PausedAwaitingResend => Vec::new(),
            ChannelState::Handshake if self.role == ChannelRole::Acceptor => {
                // Never opened, so there is nothing a peer could resume.
                self.state = ChannelState::Closed;
                vec![ChannelAction::Closed {
                    error: None,
                    by_peer: false,
                }]
            }
            ChannelState::Handshake | ChannelState::Established => {
                self.state = ChannelState::PausedAwaitingResend;
                self.paused_at_ms = Some(now_ms);
                self.ack_pending_since_ms = None;
                vec![ChannelAction::Paused]
            }
        }
    }

    pub fn close(&mut self, error: Option<ErrorPayload>) -> Vec<ChannelAction> {
        if self.state == ChannelState::Closed {
            return Vec::new();
        }
        self.state = ChannelState::Closed;
        vec![
            ChannelAction::Transmit(Packet::Close {
                error: error.clone(),
            }),
            ChannelAction::Closed {
                error,
                by_peer: false,
            },
        ]
    }

    pub fn poll_timers(&mut self, now_ms: u64) -> Vec<ChannelAction> {
        let mut actions = Vec::new();
        match self.state {
            ChannelState::Closed | ChannelState::Handshake => {}
            ChannelState::PausedAwaitingResend => {
                let expired = self.role == ChannelRole::Acceptor
                    && self.paused_at_ms.is_some_and(|paused| {
                        now_ms.saturating_sub(paused) >= self.reconnect_window_ms
                    });
                if expired {
                    self.state = ChannelState::Closed;
                    actions.push(ChannelAction::Closed {
                        error: None,
                        by_peer: false,
                    });
                }
            }
            ChannelState::Established => self.poll_established(now_ms, &mut actions),
        }
        actions
    }

    fn poll_established(&mut self, now_ms: u64, actions: &mut Vec<ChannelAction>) {
        if let Some(reject) = self.recv.poll(now_ms) {
            self.gap_failure(reject, now_ms, actions);
            return;
        }

        match self.keepalive.poll(now_ms) {
            Some(KeepaliveDecision::Dead) => {
                actions.extend(self.on_transport_reset(now_ms));
                return;
            }
            Some(KeepaliveDecision::SendPing { nonce }) => {
                self.transmit(Packet::Ping { nonce }, now_ms, actions);
            }
            None => {}
        }

        for nak in self.recv.renak(now_ms, self.retransmit_ms) {
            self.transmit_nak(nak, now_ms, actions);
        }

        for (seq, payload) in self.send.due(now_ms, self.retransmit_ms) {
            let data = self.data_packet(seq, payload);
            self.transmit(data, now_ms, actions);
        }

        if let Some(since) = self.ack_pending_since_ms
            && now_ms.saturating_sub(since) >= self.ack_delay_ms
        {
            if self.recv.delivered() > self.ack_sent {
                let ack = Packet::Ack {
                    seq: self.recv.delivered(),
                };
                self.transmit(ack, now_ms, actions);
            }
            self.ack_pending_since_ms = None;
        }
    }

    fn data_packet(&self, seq: u64, payload: Bytes) -> Packet {
        Packet::Data(Data {
            seq,
            ack: self.recv.delivered(),
            payload,
        })
    }

    fn transmit_nak(&mut self, nak: NakRange, now_ms: u64, actions: &mut Vec<ChannelAction>) {
        self.transmit(
            Packet::Nak {
                from: nak.from,
                to: nak.to,
            },
            now_ms,
            actions,
        );
    }

    fn transmit(&mut self, packet: Packet, now_ms: u64, actions: &mut Vec<ChannelAction>) {
        match &packet {
            Packet::Data(data) => {
                self.send.mark_sent(data.seq, now_ms);
                self.note_ack_sent(data.ack);
            }
            Packet::Ack { seq } => self.note_ack_sent(*seq),
            _ => {}
        }
        self.keepalive.note_send(now_ms);
        actions.push(ChannelAction::Transmit(packet));
    }

    fn note_ack_sent(&mut self, ack: u64) {
        self.ack_sent = self.ack_sent.max(ack);
        if self.ack_sent >= self.recv.delivered() {
            self.ack_pending_since_ms = None;
        }
    }

    fn gap_failure(&mut self, reject: GapReject, now_ms: u64, actions: &mut Vec<ChannelAction>) {
        let payload = match reject {
            GapReject::Overflow { max_messages } => ErrorPayload::new(
                ProtocolErrorCode::GapOverflow,
                format!("more than {max_messages} messages buffered behind a gap"),
                false,
            ),
            GapReject::Timeout { open_ms } => ErrorPayload::new(
                ProtocolErrorCode::GapTimeout,
                format!("gap open for {open_ms}ms"),
                false,
            ),
        };
        self.close_with(payload, now_ms, actions);
    }

    fn violation(&mut self, err: &ChannelError, now_ms: u64, actions: &mut Vec<ChannelAction>) {
        let payload = ErrorPayload::new(ProtocolErrorCode::SequenceViolation, err.to_string(), false);
        self.close_with(payload, now_ms, actions);
    }

    fn close_with(&mut self, payload: ErrorPayload, _now_ms: u64, actions: &mut Vec<ChannelAction>) {
        tracing::warn!(
            code = payload.code.as_str(),
            reason = %payload.message,
            session = ?self.session,
            "closing channel"
        );
        actions.extend(self.close(Some(payload)));
    }
}
