//! Send-side window of transmitted but unacknowledged messages.

use std::collections::VecDeque;

use bytes::Bytes;

use super::ChannelError;

#[derive(Clone, Debug)]
struct Outstanding {
    seq: u64,
    payload: Bytes,
    last_sent_ms: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct SendWindow {
    next_seq: u64,
    acked: u64,
    outstanding: VecDeque<Outstanding>,
    max_unacked: usize,
}

impl SendWindow {
    pub fn new(max_unacked: usize) -> Self {
        Self {
            next_seq: 1,
            acked: 0,
            outstanding: VecDeque::new(),
            max_unacked: max_unacked.max(1),
        }
    }

    pub fn is_full(&self) -> bool {
        self.outstanding.len() >= self.max_unacked
    }

    pub fn unacked(&self) -> usize {
        self.outstanding.len()
    }

    /// Highest cumulative ack received from the peer.
    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn highest_assigned(&self) -> u64 {
        self.next_seq - 1
    }

    /// Assigns the next sequence number. Callers check [`is_full`] first.
    ///
    /// [`is_full`]: SendWindow::is_full
    pub fn push(&mut self, payload: Bytes) -> Result<u64, ChannelError> {
        if self.is_full() {
            return Err(ChannelError::WindowFull {
                unacked: self.outstanding.len(),
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.outstanding.push_back(Outstanding {
            seq,
            payload,
            last_sent_ms: None,
        });
        Ok(seq)
    }

    pub fn mark_sent(&mut self, seq: u64, now_ms: u64) {
        if let Some(entry) = self.outstanding.iter_mut().find(|e| e.seq == seq) {
            entry.last_sent_ms = Some(now_ms);
        }
    }

    /// Applies a cumulative ack. Stale acks are ignored; an ack for a
    /// sequence number never assigned is a protocol violation.
    pub fn ack(&mut self, upto: u64) -> Result<usize, ChannelError> {
        if upto > self.highest_assigned() {
            return Err(ChannelError::AckBeyondSent {
                ack: upto,
                highest_sent: self.highest_assigned(),
            });
        }
        if upto <= self.acked {
            return Ok(0);
        }
        self.acked = upto;
        let mut released = 0;
        while self.outstanding.front().is_some_and(|e| e.seq <= upto) {
            self.outstanding.pop_front();
            released += 1;
        }
        Ok(released)
    }

    /// Outstanding messages inside `from..=to`, for a NAK.
    pub fn range(&self, from: u64, to: u64) -> Result<Vec<(u64, Bytes)>, ChannelError> {
        if to > self.highest_assigned() {
            return Err(ChannelError::NakBeyondSent {
                to,
                highest_sent: self.highest_assigned(),
            });
        }
        Ok(self
            .outstanding
            .iter()
            .filter(|e| e.seq >= from && e.seq <= to)
            .map(|e| (e.seq, e.payload.clone()))
            .collect())
    }

    /// Every outstanding message, oldest first (used on resume).
    pub fn all(&self) -> Vec<(u64, Bytes)> {
        self.outstanding
            .iter()
            .map(|e| (e.seq, e.payload.clone()))
            .collect()
    }

    /// Messages never sent, or sent more than `rto_ms` ago.
    pub fn due(&self, now_ms: u64, rto_ms: u64) -> Vec<(u64, Bytes)> {
        self.outstanding
            .iter()
            .filter(|e| match e.last_sent_ms {
                None => true,
                Some(sent) => now_ms.saturating_sub(sent) >= rto_ms,
            })
            .map(|e| (e.seq, e.payload.clone()))
            .collect()
    }
}
