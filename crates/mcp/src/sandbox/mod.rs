//! Sandboxed execution sessions and their lifecycle.

mod docker;
mod errors;
mod local;
mod manager;
mod pool;
mod runtime;
mod session;

use std::sync::Arc;

pub use docker::DockerRuntime;
pub use errors::{LifecycleError, RuntimeError, StartPhase};
pub use local::LocalRuntime;
pub use manager::{ExecutionManager, SessionLease, SessionSummary};
pub use pool::WorkerPool;
pub use runtime::{
    ChildControl, Environment, ExecOutcome, LaunchSpec, LaunchedProcess, ProcessControl, SandboxRuntime, stop_process,
    tail_lines,
};
pub use session::{SandboxSession, SessionIo};

use crate::config::{RuntimeBackend, SandboxSettings};

/// Builds the runtime selected in `settings`.
pub fn runtime_from_settings(settings: &SandboxSettings) -> Arc<dyn SandboxRuntime> {
    match settings.runtime {
        RuntimeBackend::Docker => Arc::new(DockerRuntime::new(settings.clone())),
        RuntimeBackend::Local => Arc::new(LocalRuntime::new(settings.work_dir.clone())),
    }
}
