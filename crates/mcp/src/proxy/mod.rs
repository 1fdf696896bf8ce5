//! Backend proxies: one transport plus the catalog learned at handshake.

mod backend;
mod pool;

pub use backend::{BackendProxy, ProxyError};
pub use pool::{ProxyHandle, ProxyOptions, ProxyPool};

/// Name and version the gateway announces to backends.
pub const CLIENT_NAME: &str = "mcp-anywhere-gateway";
