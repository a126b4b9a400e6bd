//! Receive-side gap buffering and contiguity enforcement.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::core::Limits;

/// Inclusive range of sequence numbers to request again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NakRange {
    pub from: u64,
    pub to: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GapReject {
    Overflow { max_messages: usize },
    Timeout { open_ms: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestDecision {
    /// In-order run ready for the upper layer. A NAK is attached when the
    /// run stopped at another hole.
    Deliver {
        messages: Vec<Bytes>,
        nak: Option<NakRange>,
    },
    Buffered {
        nak: Option<NakRange>,
    },
    Duplicate,
    Reject(GapReject),
}

#[derive(Clone, Debug)]
pub struct ReceiveBuffer {
    delivered: u64,
    buffered: BTreeMap<u64, Bytes>,
    gap_started_at_ms: Option<u64>,
    /// Highest sequence number already covered by a NAK.
    nak_high: u64,
    last_nak_ms: u64,
    max_messages: usize,
    timeout_ms: u64,
}

impl ReceiveBuffer {
    pub fn new(limits: &Limits) -> Self {
        Self {
            delivered: 0,
            buffered: BTreeMap::new(),
            gap_started_at_ms: None,
            nak_high: 0,
            last_nak_ms: 0,
            max_messages: limits.channel_max_gap_messages,
            timeout_ms: limits.channel_gap_timeout_ms,
        }
    }

    /// Highest sequence number delivered contiguously.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn next_expected(&self) -> u64 {
        self.delivered + 1
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn has_gap(&self) -> bool {
        !self.buffered.is_empty()
    }

    pub fn ingest(&mut self, seq: u64, payload: Bytes, now_ms: u64) -> IngestDecision {
        if seq <= self.delivered || self.buffered.contains_key(&seq) {
            return IngestDecision::Duplicate;
        }

        if seq != self.delivered + 1 {
            return self.buffer_gap(seq, payload, now_ms);
        }

        let mut messages = vec![payload];
        self.delivered = seq;
        while let Some(next) = self.buffered.remove(&(self.delivered + 1)) {
            messages.push(next);
            self.delivered += 1;
        }

        let nak = match self.buffered.keys().next().copied() {
            None => {
                self.gap_started_at_ms = None;
                None
            }
            Some(first) => {
                self.gap_started_at_ms = Some(now_ms);
                self.request(self.delivered + 1, first - 1, now_ms)
            }
        };
        IngestDecision::Deliver { messages, nak }
    }

    fn buffer_gap(&mut self, seq: u64, payload: Bytes, now_ms: u64) -> IngestDecision {
        match self.gap_started_at_ms {
            Some(start) => {
                let open_ms = now_ms.saturating_sub(start);
                if open_ms > self.timeout_ms {
                    return IngestDecision::Reject(GapReject::Timeout { open_ms });
                }
            }
            None => self.gap_started_at_ms = Some(now_ms),
        }

        if self.buffered.len() >= self.max_messages {
            return IngestDecision::Reject(GapReject::Overflow {
                max_messages: self.max_messages,
            });
        }

        let below = self
            .buffered
            .range(..seq)
            .next_back()
            .map(|(k, _)| *k)
            .unwrap_or(self.delivered);
        self.buffered.insert(seq, payload);
        let nak = self.request(below + 1, seq - 1, now_ms);
        IngestDecision::Buffered { nak }
    }

    fn request(&mut self, from: u64, to: u64, now_ms: u64) -> Option<NakRange> {
        let from = from.max(self.nak_high + 1);
        if from > to {
            return None;
        }
        self.nak_high = to;
        self.last_nak_ms = now_ms;
        Some(NakRange { from, to })
    }

    /// Checks the open gap against the timeout.
    pub fn poll(&self, now_ms: u64) -> Option<GapReject> {
        let start = self.gap_started_at_ms?;
        let open_ms = now_ms.saturating_sub(start);
        (open_ms > self.timeout_ms).then_some(GapReject::Timeout { open_ms })
    }

    /// Re-requests every hole once `interval_ms` has passed since the last
    /// NAK, for when a NAK or its retransmission was itself lost.
    pub fn renak(&mut self, now_ms: u64, interval_ms: u64) -> Vec<NakRange> {
        if self.buffered.is_empty() || now_ms.saturating_sub(self.last_nak_ms) < interval_ms {
            return Vec::new();
        }
        let mut ranges = Vec::new();
        let mut cursor = self.delivered;
        for seq in self.buffered.keys() {
            if *seq > cursor + 1 {
                ranges.push(NakRange {
                    from: cursor + 1,
                    to: seq - 1,
                });
            }
            cursor = *seq;
        }
        if let Some(last) = ranges.last() {
            self.nak_high = self.nak_high.max(last.to);
            self.last_nak_ms = now_ms;
        }
        ranges
    }
}
