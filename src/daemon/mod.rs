//! The coordination server.
//!
//! Provides:
//! - Sequenced channels over replaceable TCP transports
//! - Client handshake and resynchronisation after reconnects
//! - The staged transaction apply pipeline
//! - Distributed locks with wait/notify
//! - Lifecycle events and operator logging

pub mod apply;
pub mod broadcast;
pub(crate) mod cbor;
pub mod channel;
pub mod core;
pub mod events;
pub mod handshake;
pub mod locks;
pub mod metrics;
pub mod object_ids;
pub mod proto;
pub mod server;

pub use apply::{
    ApplyError, InMemoryObjectStore, ObjectStore, PersistenceTransaction, PipelineConfig,
    StoreError, TransactionApplyPipeline,
};
pub use broadcast::{InterestRegistry, OutboundError, OutboundSink};
pub use cbor::{ProtoDecodeError, ProtoEncodeError};
pub use channel::{ChannelError, ChannelHandle, SequencedChannel};
pub use core::{Coordinator, CoordinatorDeps, Disposition};
pub use events::{CoordinatorEvent, EventBus, EventHandler};
pub use handshake::{HandshakeCoordinator, HandshakeError};
pub use locks::{LockCoordinator, LockError};
pub use object_ids::{ObjectIdAllocator, ObjectIdConfig, ObjectIdsExhausted};
pub use proto::{ClientMessage, ServerMessage};
pub use server::{Server, ServerError, ServerHandle};
