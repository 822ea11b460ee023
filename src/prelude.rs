//! The fabric transport prelude.
//!
//! The purpose of this module is to alleviate imports of the common
//! transport types.

pub use crate::bootstrap::{NodeId, TcpBootstrap};
pub use crate::config::Config;
pub use crate::error::TransportError;
pub use crate::fabric::{
    CompletionQueue, Endpoint, FabricContext, MemoryRegion, MessageType, MessageTypeRegistry,
    RemoteMemoryRegion, RemoteRegionExchange, Role, Task,
};
