//! JSON-RPC envelopes and capability catalogs spoken on both sides of the gateway.

mod catalog;
mod error;
mod message;

pub use catalog::{BackendCatalog, CapabilityKind, entry_name};
pub(crate) use catalog::list_result;
pub use error::{ErrorObject, codes};
pub use message::{JSONRPC_VERSION, Message, Notification, Request, RequestId, Response};

/// Protocol revision the gateway speaks by default.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol revisions a client may request and get echoed back.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];
