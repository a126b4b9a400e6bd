use thiserror::Error;

use crate::config::ConfigError;
use crate::daemon::apply::{ApplyError, StoreError};
use crate::daemon::channel::{ChannelError, FrameError};
use crate::daemon::handshake::HandshakeError;
use crate::daemon::locks::LockError;
use crate::daemon::server::ServerError;
use crate::daemon::{ProtoDecodeError, ProtoEncodeError};
use crate::telemetry::TelemetryError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the per-subsystem errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Decode(#[from] ProtoDecodeError),

    #[error(transparent)]
    Encode(#[from] ProtoEncodeError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Config(e) => e.transience(),
            Error::Telemetry(_) => Transience::Permanent,
            Error::Channel(e) => e.transience(),
            Error::Frame(FrameError::Io(_)) => Transience::Retryable,
            Error::Frame(_) | Error::Decode(_) | Error::Encode(_) => Transience::Permanent,
            Error::Handshake(e) => e.transience(),
            Error::Apply(e) => e.transience(),
            Error::Store(e) => e.transience(),
            Error::Lock(e) => e.transience(),
            Error::Server(e) => e.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Config(e) => e.effect(),
            Error::Telemetry(_) => Effect::None,
            Error::Channel(e) => e.effect(),
            Error::Frame(FrameError::Io(_)) => Effect::Unknown,
            Error::Frame(_) | Error::Decode(_) | Error::Encode(_) => Effect::None,
            Error::Handshake(e) => e.effect(),
            Error::Apply(e) => e.effect(),
            Error::Store(e) => e.effect(),
            Error::Lock(e) => e.effect(),
            Error::Server(e) => e.effect(),
        }
    }
}
