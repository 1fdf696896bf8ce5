//! Client-facing routing: discovery, namespacing and gateway-local tools.

mod errors;
mod local;
pub mod middleware;
mod router;
mod snapshot;

pub use errors::{GatewayError, RoutingError};
pub use local::{LOCAL_TOOL_NAMES, LocalTool, LocalTools, PythonSandbox, RunStatus, SandboxRun};
pub use middleware::ListPlan;
pub use router::{GatewayRouter, INSTRUCTIONS, RefreshSummary, SERVER_NAME};
pub use snapshot::{Route, RoutingSnapshot};
