//! Routing and execution core of the MCP Anywhere gateway.
//!
//! The gateway presents many backend MCP servers as one. Clients first see
//! only the gateway's own discovery tools; naming a `provider` reveals that
//! backend's catalog, and calls carrying it are rewritten to the backend's
//! namespaced name and forwarded. Backends run in sandboxed sessions that are
//! started on first use, reused while warm and evicted when idle.

pub mod config;
pub mod gateway;
pub mod logging;
pub mod protocol;
pub mod proxy;
pub mod sandbox;
pub mod server;
pub mod transport;

pub use config::{ConfigError, DescriptorStore, FileDescriptorStore, GatewaySettings, StaticDescriptorStore};
pub use gateway::{GatewayError, GatewayRouter, RoutingError};
pub use logging::LogManager;
pub use sandbox::{ExecutionManager, LifecycleError, SandboxRuntime};
pub use transport::TransportError;
