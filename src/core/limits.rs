//! Safety limits and protocol timers.

use serde::{Deserialize, Serialize};

/// Hard limits applied to every connection.
///
/// Units are spelled out in the field names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_frame_bytes: usize,

    pub max_cbor_depth: usize,
    pub max_cbor_map_entries: usize,
    pub max_cbor_array_entries: usize,
    pub max_cbor_bytes_string_len: usize,
    pub max_cbor_text_string_len: usize,

    /// Sent-but-unacknowledged messages before `send` applies backpressure.
    pub channel_max_unacked: usize,
    /// Out-of-order messages buffered while waiting for a gap to fill.
    pub channel_max_gap_messages: usize,
    pub channel_gap_timeout_ms: u64,
    pub channel_retransmit_ms: u64,
    pub channel_ack_delay_ms: u64,
    pub channel_ack_every: usize,

    pub keepalive_ms: u64,
    pub dead_ms: u64,
    /// How long a paused server session waits for the client to resume.
    pub reconnect_window_ms: u64,
    /// Server messages queued per connection while its channel cannot take
    /// them. Overflowing closes the connection.
    pub outbound_queue_capacity: usize,

    pub max_txns_per_batch: usize,
    pub max_deltas_per_txn: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,

            max_cbor_depth: 16,
            max_cbor_map_entries: 10_000,
            max_cbor_array_entries: 100_000,
            max_cbor_bytes_string_len: 8 * 1024 * 1024,
            max_cbor_text_string_len: 64 * 1024,

            channel_max_unacked: 1_024,
            channel_max_gap_messages: 4_096,
            channel_gap_timeout_ms: 30_000,
            channel_retransmit_ms: 1_000,
            channel_ack_delay_ms: 20,
            channel_ack_every: 32,

            keepalive_ms: 5_000,
            dead_ms: 30_000,
            reconnect_window_ms: 60_000,
            outbound_queue_capacity: 8_192,

            max_txns_per_batch: 1_000,
            max_deltas_per_txn: 10_000,
        }
    }
}
