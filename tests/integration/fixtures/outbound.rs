//! Outbound sink that records every message for assertions.

use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, unbounded};

use dso_l2::ClientId;
use dso_l2::core::LockResponse;
use dso_l2::daemon::locks::LockResponseSink;
use dso_l2::daemon::{OutboundError, OutboundSink, ServerMessage};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct RecordingOutbound {
    tx: Sender<(ClientId, ServerMessage)>,
    rx: Receiver<(ClientId, ServerMessage)>,
}

impl Default for RecordingOutbound {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

impl OutboundSink for RecordingOutbound {
    fn send(&self, client: ClientId, message: ServerMessage) -> Result<(), OutboundError> {
        self.tx
            .send((client, message))
            .map_err(|_| OutboundError::Closed { client })
    }
}

impl LockResponseSink for RecordingOutbound {
    fn deliver(&self, client: ClientId, response: LockResponse) {
        let _ = self.tx.send((client, ServerMessage::LockResponse(response)));
    }
}

impl RecordingOutbound {
    /// Everything recorded so far.
    pub fn drain(&self) -> Vec<(ClientId, ServerMessage)> {
        self.rx.try_iter().collect()
    }

    /// Waits for the first message to `client` matching `pred`, discarding
    /// whatever comes before it.
    pub fn expect<T>(
        &self,
        client: ClientId,
        mut pred: impl FnMut(&ServerMessage) -> Option<T>,
    ) -> T {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (to, message) = self
                .rx
                .recv_timeout(remaining)
                .unwrap_or_else(|_| panic!("timed out waiting for message to {client}"));
            if to == client
                && let Some(found) = pred(&message)
            {
                return found;
            }
        }
    }

    /// Records messages in arrival order until `done` accepts the log.
    pub fn collect_until(
        &self,
        mut done: impl FnMut(&[(ClientId, ServerMessage)]) -> bool,
    ) -> Vec<(ClientId, ServerMessage)> {
        let deadline = Instant::now() + WAIT;
        let mut log = Vec::new();
        while !done(&log) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(entry) => log.push(entry),
                Err(_) => panic!("timed out; recorded so far: {log:?}"),
            }
        }
        log
    }
}
