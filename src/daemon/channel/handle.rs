//! Thread-safe owner of a [`SequencedChannel`] and its current transport.

use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::core::{ChannelSessionId, ErrorPayload};

use super::frame::FrameWriter;
use super::packet::{Packet, encode_packet};
use super::sequenced::{ChannelAction, ChannelState, SequencedChannel};
use super::{ChannelError, now_ms};

/// Where outbound packets go. Replaced on every reconnect.
pub trait PacketSink: Send {
    fn transmit(&mut self, packet: &Packet) -> Result<(), ChannelError>;
}

pub struct FramedPacketWriter<W> {
    writer: FrameWriter<W>,
}

impl<W: Write> FramedPacketWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer: FrameWriter::new(writer, max_frame_bytes),
        }
    }
}

impl<W: Write + Send> PacketSink for FramedPacketWriter<W> {
    fn transmit(&mut self, packet: &Packet) -> Result<(), ChannelError> {
        let bytes = encode_packet(packet)?;
        self.writer.write_frame(&bytes)?;
        Ok(())
    }
}

/// What the owner of a handle has to react to.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    Delivered(Bytes),
    Established { resumed: bool },
    Paused,
    Closed {
        error: Option<ErrorPayload>,
        by_peer: bool,
    },
}

struct ChannelCore {
    channel: SequencedChannel,
    sink: Option<Box<dyn PacketSink>>,
}

struct Shared {
    core: Mutex<ChannelCore>,
    window: Condvar,
}

#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<Shared>,
}

impl ChannelHandle {
    pub fn new(channel: SequencedChannel) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(ChannelCore {
                    channel,
                    sink: None,
                }),
                window: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelCore> {
        self.shared.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ChannelState {
        self.lock().channel.state()
    }

    pub fn session(&self) -> Option<ChannelSessionId> {
        self.lock().channel.session()
    }

    pub fn unacked(&self) -> usize {
        self.lock().channel.unacked()
    }

    /// Installs the transport for the next (re)open.
    pub fn attach(&self, sink: Box<dyn PacketSink>) {
        self.lock().sink = Some(sink);
    }

    pub fn detach(&self) {
        self.lock().sink = None;
    }

    /// Initiator side: sends `Open` over the attached transport.
    pub fn open(&self) -> Vec<ChannelEvent> {
        let now = now_ms();
        let mut core = self.lock();
        let actions = core.channel.open(now);
        run(&mut core, actions, now)
    }

    /// Sends one message, blocking while the send window is full.
    pub fn send(&self, payload: Bytes, timeout: Duration) -> Result<(), ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut core = self.lock();
        loop {
            if core.channel.state() == ChannelState::Closed {
                return Err(ChannelError::Closed);
            }
            if !core.channel.is_window_full() {
                let now = now_ms();
                let actions = core.channel.send(payload, now)?;
                run(&mut core, actions, now);
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::SendTimeout);
            }
            let (guard, _) = self
                .shared
                .window
                .wait_timeout(core, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            core = guard;
        }
    }

    /// Non-blocking send; a full window surfaces as `WindowFull`.
    pub fn try_send(&self, payload: Bytes) -> Result<(), ChannelError> {
        let now = now_ms();
        let mut core = self.lock();
        let actions = core.channel.send(payload, now)?;
        run(&mut core, actions, now);
        Ok(())
    }

    pub fn on_receive(&self, packet: Packet) -> Vec<ChannelEvent> {
        self.with_channel(|channel, now| channel.on_receive(packet, now))
    }

    pub fn poll_timers(&self) -> Vec<ChannelEvent> {
        self.with_channel(|channel, now| channel.poll_timers(now))
    }

    pub fn on_transport_reset(&self) -> Vec<ChannelEvent> {
        self.with_channel(|channel, now| channel.on_transport_reset(now))
    }

    pub fn close(&self, error: Option<ErrorPayload>) -> Vec<ChannelEvent> {
        self.with_channel(|channel, _| channel.close(error))
    }

    fn with_channel(
        &self,
        f: impl FnOnce(&mut SequencedChannel, u64) -> Vec<ChannelAction>,
    ) -> Vec<ChannelEvent> {
        let now = now_ms();
        let events = {
            let mut core = self.lock();
            let actions = f(&mut core.channel, now);
            run(&mut core, actions, now)
        };
        // Acks free window space; a close must wake blocked senders too.
        self.shared.window.notify_all();
        events
    }
}

fn run(core: &mut ChannelCore, actions: Vec<ChannelAction>, now: u64) -> Vec<ChannelEvent> {
    let mut events = Vec::new();
    let mut transport_failed = false;
    for action in actions {
        match action {
            ChannelAction::Transmit(packet) => {
                if transport_failed {
                    continue;
                }
                if let Some(sink) = core.sink.as_mut()
                    && let Err(err) = sink.transmit(&packet)
                {
                    tracing::debug!(error = %err, "channel transport write failed");
                    core.sink = None;
                    transport_failed = true;
                }
            }
            ChannelAction::Deliver(payload) => events.push(ChannelEvent::Delivered(payload)),
            ChannelAction::Established { resumed } => {
                events.push(ChannelEvent::Established { resumed })
            }
            ChannelAction::Paused => {
                core.sink = None;
                events.push(ChannelEvent::Paused);
            }
            ChannelAction::Closed { error, by_peer } => {
                core.sink = None;
                events.push(ChannelEvent::Closed { error, by_peer });
            }
        }
    }
    if transport_failed {
        let actions = core.channel.on_transport_reset(now);
        events.extend(run(core, actions, now));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Limits;
    use crossbeam::channel::{Receiver, Sender, unbounded};
    use std::thread;

    struct ChannelSink(Sender<Packet>);

    impl PacketSink for ChannelSink {
        fn transmit(&mut self, packet: &Packet) -> Result<(), ChannelError> {
            self.0
                .send(packet.clone())
                .map_err(|_| ChannelError::Closed)
        }
    }

    fn limits() -> Limits {
        Limits {
            channel_max_unacked: 1,
            keepalive_ms: 0,
            dead_ms: 0,
            ..Default::default()
        }
    }

    type Pair = (
        ChannelHandle,
        Receiver<Packet>,
        ChannelHandle,
        Receiver<Packet>,
    );

    fn established_pair() -> Pair {
        let client = ChannelHandle::new(SequencedChannel::initiator(
            ChannelSessionId::random(),
            &limits(),
            now_ms(),
        ));
        let server = ChannelHandle::new(SequencedChannel::acceptor(&limits(), now_ms()));
        let (to_server, server_rx) = unbounded();
        let (to_client, client_rx) = unbounded();
        client.attach(Box::new(ChannelSink(to_server)));
        server.attach(Box::new(ChannelSink(to_client)));

        client.open();
        let open = server_rx.recv().unwrap();
        server.on_receive(open);
        let ack = client_rx.recv().unwrap();
        assert_eq!(
            client.on_receive(ack),
            vec![ChannelEvent::Established { resumed: false }]
        );
        (client, client_rx, server, server_rx)
    }

    #[test]
    fn send_blocks_until_window_opens() {
        let (client, _client_rx, _server, server_rx) = established_pair();
        client.send(Bytes::from_static(b"a"), Duration::from_secs(1)).unwrap();
        assert!(matches!(server_rx.recv().unwrap(), Packet::Data(_)));

        assert!(matches!(
            client.send(Bytes::from_static(b"b"), Duration::from_millis(10)),
            Err(ChannelError::SendTimeout)
        ));

        let acker = client.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            acker.on_receive(Packet::Ack { seq: 1 });
        });
        client.send(Bytes::from_static(b"b"), Duration::from_secs(5)).unwrap();
        releaser.join().unwrap();
        assert_eq!(client.unacked(), 1);
    }

    #[test]
    fn failed_transport_write_pauses_channel() {
        let (_client, client_rx, server, _server_rx) = established_pair();
        drop(client_rx);
        server.try_send(Bytes::from_static(b"x")).unwrap();
        assert_eq!(server.state(), ChannelState::PausedAwaitingResend);
    }

    #[test]
    fn close_wakes_blocked_sender() {
        let (client, _client_rx, _server, _server_rx) = established_pair();
        client.send(Bytes::from_static(b"a"), Duration::from_secs(1)).unwrap();
        let closer = client.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close(None);
        });
        assert!(matches!(
            client.send(Bytes::from_static(b"b"), Duration::from_secs(5)),
            Err(ChannelError::Closed)
        ));
        handle.join().unwrap();
    }
}
