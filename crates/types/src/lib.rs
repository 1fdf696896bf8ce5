//! Shared type definitions for the MCP Anywhere gateway.
//!
//! These types describe configured backends and the lifecycle states of the
//! sandboxed sessions that run them. They carry no I/O so every crate in the
//! workspace (and the binaries) can depend on them freely.

mod descriptor;
mod session;

pub use descriptor::{BackendDescriptor, EndpointTransport, EnvBinding, RemoteEndpoint, RuntimeKind, WireTransport};
pub use session::SessionState;

/// Separator placed between a backend id and a native capability name.
pub const NAMESPACE_SEPARATOR: char = '_';
