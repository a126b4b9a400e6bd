//! Blocking TCP client speaking the coordinator protocol, for end-to-end
//! tests against a real server.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, unbounded};

use dso_l2::Limits;
use dso_l2::core::{ChannelSessionId, ErrorPayload};
use dso_l2::daemon::ServerMessage;
use dso_l2::daemon::channel::{
    ChannelEvent, ChannelHandle, FrameReader, FramedPacketWriter, SequencedChannel, decode_packet,
    now_ms,
};
use dso_l2::daemon::proto::{ClientMessage, decode_server_message, encode_client_message};

use super::outbound::WAIT;

#[derive(Debug)]
pub enum Received {
    Message(ServerMessage),
    Established { resumed: bool },
    Closed { error: Option<ErrorPayload> },
}

pub struct TestClient {
    addr: SocketAddr,
    limits: Limits,
    channel: ChannelHandle,
    stream: Option<TcpStream>,
    reader: Option<JoinHandle<()>>,
    events_tx: Sender<Received>,
    events: Receiver<Received>,
    stop: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl TestClient {
    /// Connects and waits until the channel is established.
    pub fn connect(addr: SocketAddr) -> Self {
        let limits = Limits::default();
        let channel = ChannelHandle::new(SequencedChannel::initiator(
            ChannelSessionId::random(),
            &limits,
            now_ms(),
        ));
        let (events_tx, events) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let timer_channel = channel.clone();
        let timer_tx = events_tx.clone();
        let timer_stop = Arc::clone(&stop);
        let timer = thread::spawn(move || {
            while !timer_stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(10));
                forward(timer_channel.poll_timers(), &timer_tx, &Limits::default());
            }
        });

        let mut client = Self {
            addr,
            limits,
            channel,
            stream: None,
            reader: None,
            events_tx,
            events,
            stop,
            timer: Some(timer),
        };
        client.attach();
        assert!(matches!(
            client.next_event(),
            Received::Established { resumed: false }
        ));
        client
    }

    fn attach(&mut self) {
        let stream = TcpStream::connect(self.addr).expect("connect");
        stream.set_nodelay(true).expect("nodelay");
        let writer = stream.try_clone().expect("clone stream");
        self.channel.attach(Box::new(FramedPacketWriter::new(
            writer,
            self.limits.max_frame_bytes,
        )));

        let mut reader = FrameReader::new(
            stream.try_clone().expect("clone stream"),
            self.limits.max_frame_bytes,
        );
        let channel = self.channel.clone();
        let tx = self.events_tx.clone();
        let limits = self.limits.clone();
        self.reader = Some(thread::spawn(move || {
            while let Ok(Some(bytes)) = reader.read_next() {
                let Ok(packet) = decode_packet(&bytes, &limits) else {
                    break;
                };
                forward(channel.on_receive(packet), &tx, &limits);
            }
            forward(channel.on_transport_reset(), &tx, &limits);
        }));
        self.stream = Some(stream);
        let events = self.channel.open();
        forward(events, &self.events_tx, &self.limits);
    }

    pub fn send(&self, message: &ClientMessage) {
        let bytes = encode_client_message(message).expect("encode");
        self.channel
            .send(Bytes::from(bytes), WAIT)
            .expect("channel send");
    }

    pub fn next_event(&self) -> Received {
        self.events.recv_timeout(WAIT).expect("timed out waiting for event")
    }

    /// Next application message, skipping channel events.
    pub fn recv(&self) -> ServerMessage {
        self.recv_matching(|m| Some(m.clone()))
    }

    pub fn recv_matching<T>(&self, mut pred: impl FnMut(&ServerMessage) -> Option<T>) -> T {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(Received::Message(message)) => {
                    if let Some(found) = pred(&message) {
                        return found;
                    }
                }
                Ok(_) => {}
                Err(_) => panic!("timed out waiting for server message"),
            }
        }
    }

    /// Waits for the channel to be closed by the server.
    pub fn closed(&self) -> Option<ErrorPayload> {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(Received::Closed { error }) => return error,
                Ok(_) => {}
                Err(_) => panic!("timed out waiting for close"),
            }
        }
    }

    /// Kills the TCP connection without closing the channel.
    pub fn drop_transport(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    /// Opens a new TCP connection for the same channel session.
    pub fn reconnect(&mut self) {
        self.drop_transport();
        self.attach();
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.channel.close(None);
        self.drop_transport();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}

fn forward(events: Vec<ChannelEvent>, tx: &Sender<Received>, limits: &Limits) {
    for event in events {
        let received = match event {
            ChannelEvent::Delivered(bytes) => match decode_server_message(&bytes, limits) {
                Ok(message) => Received::Message(message),
                Err(err) => panic!("undecodable server message: {err}"),
            },
            ChannelEvent::Established { resumed } => Received::Established { resumed },
            ChannelEvent::Closed { error, .. } => Received::Closed { error },
            ChannelEvent::Paused => continue,
        };
        let _ = tx.send(received);
    }
}
