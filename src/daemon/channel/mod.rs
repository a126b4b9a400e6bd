//! Sequenced channel: reliable, ordered, exactly-once delivery of opaque
//! messages over a replaceable byte transport.
//!
//! Layering, bottom up:
//! - `frame`: length + crc32c framing on a byte stream
//! - `packet`: channel control/data packets (CBOR)
//! - `send_window` / `gap_buffer` / `keepalive`: pure bookkeeping
//! - `sequenced`: the sans-IO state machine
//! - `handle`: thread-safe wrapper with blocking backpressure

pub mod frame;
pub mod gap_buffer;
pub mod handle;
pub mod keepalive;
pub mod packet;
pub mod send_window;
pub mod sequenced;

use std::io;

use thiserror::Error;

use crate::core::{ErrorPayload, ProtocolErrorCode};
use crate::daemon::cbor::{ProtoDecodeError, ProtoEncodeError};
use crate::error::{Effect, Transience};

pub use frame::{FrameError, FrameReader, FrameWriter, encode_frame};
pub use handle::{ChannelEvent, ChannelHandle, FramedPacketWriter, PacketSink};
pub use packet::{CHANNEL_PROTOCOL_VERSION, Data, Open, Packet, decode_packet, encode_packet};
pub use sequenced::{ChannelAction, ChannelRole, ChannelState, SequencedChannel};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("send window full with {unacked} unacknowledged messages")]
    WindowFull { unacked: usize },
    #[error("ack {ack} is beyond highest sent sequence {highest_sent}")]
    AckBeyondSent { ack: u64, highest_sent: u64 },
    #[error("nak up to {to} is beyond highest sent sequence {highest_sent}")]
    NakBeyondSent { to: u64, highest_sent: u64 },
    #[error("timed out waiting for send window")]
    SendTimeout,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Encode(#[from] ProtoEncodeError),
    #[error(transparent)]
    Decode(#[from] ProtoDecodeError),
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    pub fn transience(&self) -> Transience {
        match self {
            ChannelError::WindowFull { .. } | ChannelError::SendTimeout => Transience::Retryable,
            ChannelError::Io(_) => Transience::Retryable,
            ChannelError::Frame(FrameError::Io(_)) => Transience::Retryable,
            ChannelError::Closed
            | ChannelError::AckBeyondSent { .. }
            | ChannelError::NakBeyondSent { .. }
            | ChannelError::Frame(_)
            | ChannelError::Encode(_)
            | ChannelError::Decode(_) => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ChannelError::Io(_) | ChannelError::Frame(FrameError::Io(_)) => Effect::Unknown,
            _ => Effect::None,
        }
    }

    pub fn as_error_payload(&self) -> ErrorPayload {
        match self {
            ChannelError::Frame(err) => err.as_error_payload().unwrap_or_else(|| {
                ErrorPayload::new(ProtocolErrorCode::Internal, err.to_string(), true)
            }),
            ChannelError::Decode(err) => err.as_error_payload(),
            ChannelError::WindowFull { .. } | ChannelError::SendTimeout => {
                ErrorPayload::new(ProtocolErrorCode::Overloaded, self.to_string(), true)
            }
            ChannelError::AckBeyondSent { .. } | ChannelError::NakBeyondSent { .. } => {
                ErrorPayload::new(ProtocolErrorCode::SequenceViolation, self.to_string(), false)
            }
            ChannelError::Closed => {
                ErrorPayload::new(ProtocolErrorCode::Shutdown, self.to_string(), false)
            }
            ChannelError::Encode(_) | ChannelError::Io(_) => {
                ErrorPayload::new(ProtocolErrorCode::Internal, self.to_string(), false)
            }
        }
    }
}

/// Milliseconds on the process-wide monotonic clock.
pub fn now_ms() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}
