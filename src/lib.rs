//! A transport helper for group-communication runtimes, built on libfabric.
//!
//! [`fabric::FabricContext`] bootstraps a process's fabric/domain/passive
//! endpoint and a background completion-polling task; [`fabric::Endpoint`]
//! runs the connection-manager handshake to a peer and posts send/recv/RMA
//! work requests against it; [`fabric::MessageTypeRegistry`] dispatches
//! completions to per-category handlers without a per-endpoint routing
//! table. [`bootstrap::TcpBootstrap`] supplies the out-of-band TCP
//! side-channel every other component bootstraps itself over.
//!
//! **WARNING: the interfaces are unstable and subject to change.**

#[cfg(not(target_os = "linux"))]
compile_error!("`fabric_transport` currently only supports Linux");

/// Bindings of C interfaces.
pub mod bindings;

/// Shared utility functions.
#[macro_use]
mod utils;

/// Error taxonomy and the `fatal!` abort macro.
pub mod error;

/// TOML-backed runtime configuration.
pub mod config;

/// Out-of-band TCP bootstrap channel.
pub mod bootstrap;

/// Fabric transport core: context bootstrap, memory registration, the
/// message-type registry, endpoints, completion polling, and remote-region
/// gossip.
/// Not to be publicly exposed as a whole; instead `pub use` the necessary
/// items.
mod fabric;

pub use fabric::{
    CompletionQueue, Endpoint, FabricContext, MemoryRegion, MessageType, MessageTypeRegistry,
    RemoteMemoryRegion, RemoteRegionExchange, Role, Task,
};

pub use config::Config;
pub use error::TransportError;

/// Re-exports of the common transport types.
pub mod prelude;
