#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
mod paths;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    ClientId, ConnectionId, ErrorPayload, GlobalTransactionId, Limits, LockId, LockLevel,
    ObjectId, ProtocolErrorCode, SequenceId, ThreadId, TransactionId,
};
