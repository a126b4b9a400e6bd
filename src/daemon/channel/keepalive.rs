//! Channel keepalive tracking.

use crate::core::Limits;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeepaliveDecision {
    SendPing { nonce: u64 },
    /// Nothing heard from the peer for `dead_ms`.
    Dead,
}

#[derive(Clone, Debug)]
pub struct KeepaliveTracker {
    keepalive_ms: u64,
    dead_ms: u64,
    last_recv_ms: u64,
    last_send_ms: u64,
    next_nonce: u64,
}

impl KeepaliveTracker {
    pub fn new(limits: &Limits, now_ms: u64) -> Self {
        Self {
            keepalive_ms: limits.keepalive_ms,
            dead_ms: limits.dead_ms,
            last_recv_ms: now_ms,
            last_send_ms: now_ms,
            next_nonce: 1,
        }
    }

    pub fn note_recv(&mut self, now_ms: u64) {
        self.last_recv_ms = now_ms;
    }

    pub fn note_send(&mut self, now_ms: u64) {
        self.last_send_ms = now_ms;
    }

    /// Restarts both clocks, e.g. after a transport was replaced.
    pub fn reset(&mut self, now_ms: u64) {
        self.last_recv_ms = now_ms;
        self.last_send_ms = now_ms;
    }

    pub fn poll(&mut self, now_ms: u64) -> Option<KeepaliveDecision> {
        if self.dead_ms > 0 && now_ms.saturating_sub(self.last_recv_ms) >= self.dead_ms {
            return Some(KeepaliveDecision::Dead);
        }
        if self.keepalive_ms > 0 && now_ms.saturating_sub(self.last_send_ms) >= self.keepalive_ms {
            let nonce = self.next_nonce;
            self.next_nonce = self.next_nonce.saturating_add(1);
            return Some(KeepaliveDecision::SendPing { nonce });
        }
        None
    }
}
