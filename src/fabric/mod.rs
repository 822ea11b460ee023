//! The fabric transport core: context bootstrap, memory registration, the
//! message-type registry, per-peer endpoints, the completion-polling loop,
//! and remote-region gossip over the TCP bootstrap channel.

/// Process-wide fabric/domain/passive-endpoint bootstrap.
pub mod context;

/// Local memory registration and remote-region descriptors.
pub mod mr;

/// The shared completion queue.
pub mod cq;

/// The message-type registry and packed work-request context.
pub mod message_type;

/// Per-peer reliable endpoints and the connect protocol.
pub mod endpoint;

/// The background completion-polling task.
pub mod polling;

/// Pairwise remote-memory-region gossip over the TCP bootstrap.
pub mod remote_exchange;

/// Placeholder batched work-request surface.
pub mod task;

pub use context::FabricContext;
pub use cq::CompletionQueue;
pub use endpoint::{Endpoint, Role};
pub use message_type::{MessageType, MessageTypeRegistry};
pub use mr::{MemoryRegion, RemoteMemoryRegion};
pub use remote_exchange::RemoteRegionExchange;
pub use task::Task;
