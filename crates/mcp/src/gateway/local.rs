//! Tools the gateway answers itself.

use std::sync::Arc;
use std::time::Duration;

use anywhere_types::{RuntimeKind, SessionState};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewaySettings;
use crate::gateway::{GatewayError, RoutingSnapshot};
use crate::sandbox::{Environment, ExecOutcome, ExecutionManager, LaunchSpec, LifecycleError, SandboxRuntime, SessionSummary, StartPhase, WorkerPool};

/// Names reserved by gateway-local tools; backend ids may not shadow them.
pub const LOCAL_TOOL_NAMES: [&str; 2] = ["list_providers", "python_sandbox"];

/// Libraries baked into the sandbox image.
const PREINSTALLED_LIBRARIES: [&str; 5] = ["pandas", "numpy", "matplotlib", "seaborn", "scipy"];

const SANDBOX_ID: &str = "python-sandbox";

static LIBRARY_SPEC_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*(\[[A-Za-z0-9_,.-]+\])?([<>=!~]=?[A-Za-z0-9.*+!-]+(,[<>=!~]=?[A-Za-z0-9.*+!-]+)*)?$")
        .expect("valid library spec regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTool {
    ListProviders,
    PythonSandbox,
}

impl LocalTool {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "list_providers" => Some(LocalTool::ListProviders),
            "python_sandbox" => Some(LocalTool::PythonSandbox),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LocalTool::ListProviders => LOCAL_TOOL_NAMES[0],
            LocalTool::PythonSandbox => LOCAL_TOOL_NAMES[1],
        }
    }

    /// The `tools/list` entry for this tool.
    pub fn descriptor(self) -> Value {
        match self {
            LocalTool::ListProviders => json!({
                "name": self.name(),
                "description": "List the ids of all available MCP servers. Pass one as `provider` to tools/list and tools/call.",
                "inputSchema": { "type": "object", "properties": {} }
            }),
            LocalTool::PythonSandbox => json!({
                "name": self.name(),
                "description": "Run Python code in an isolated sandbox and return its stdout, stderr and exit code. \
                                pandas, numpy, matplotlib, seaborn and scipy are preinstalled.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "code": { "type": "string", "description": "Python source to execute" },
                        "libraries": {
                            "type": "array",
                            "items": { "type": "string" },
                            "description": "Extra pip packages to install before running"
                        }
                    },
                    "required": ["code"]
                }
            }),
        }
    }
}

/// Outcome of one sandbox run as returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxRun {
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
    Timeout,
}

impl SandboxRun {
    fn finished(outcome: ExecOutcome) -> Self {
        Self {
            status: if outcome.success() { RunStatus::Success } else { RunStatus::Error },
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: Some(outcome.exit_code),
        }
    }

    fn timed_out(limit: Duration) -> Self {
        Self {
            status: RunStatus::Timeout,
            stdout: String::new(),
            stderr: format!("Execution exceeded {}s", limit.as_secs()),
            exit_code: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status != RunStatus::Success
    }
}

/// Runs untrusted Python in a throwaway environment per call.
pub struct PythonSandbox {
    runtime: Arc<dyn SandboxRuntime>,
    pool: WorkerPool,
    image: Option<String>,
    timeout: Duration,
}

impl PythonSandbox {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, pool: WorkerPool, image: Option<String>, timeout: Duration) -> Self {
        Self {
            runtime,
            pool,
            image,
            timeout,
        }
    }

    /// Libraries from `requested` that still need installing.
    pub fn missing_libraries(requested: &[String]) -> Result<Vec<String>, GatewayError> {
        let mut missing = Vec::new();
        for library in requested {
            let library = library.trim();
            if !LIBRARY_SPEC_REGEX.is_match(library) {
                return Err(GatewayError::invalid_params(format!("invalid library name '{library}'")));
            }
            let base = library
                .split(|c: char| matches!(c, '[' | '<' | '>' | '=' | '!' | '~'))
                .next()
                .unwrap_or(library)
                .to_ascii_lowercase();
            if !PREINSTALLED_LIBRARIES.contains(&base.as_str()) && !missing.iter().any(|known: &String| known == library) {
                missing.push(library.to_string());
            }
        }
        Ok(missing)
    }

    pub async fn run(&self, code: &str, libraries: &[String], cancel: &CancellationToken) -> Result<SandboxRun, GatewayError> {
        let missing = Self::missing_libraries(libraries)?;
        let environment = self.provision().await?;

        let result = tokio::select! {
            outcome = tokio::time::timeout(self.timeout, self.execute(&environment, code, missing)) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(target: "sandbox", "python_sandbox run exceeded {}s", self.timeout.as_secs());
                    Ok(SandboxRun::timed_out(self.timeout))
                }
            },
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        };

        let runtime = Arc::clone(&self.runtime);
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let reference = environment.reference.clone();
            match pool.run(move || runtime.teardown(&environment)).await {
                Ok(Ok(())) => debug!(target: "sandbox", "Removed sandbox environment {}", reference),
                Ok(Err(error)) => warn!(target: "sandbox", "Failed to remove sandbox environment {}: {}", reference, error),
                Err(error) => warn!(target: "sandbox", "Sandbox teardown was not scheduled: {}", error),
            }
        });
        result
    }

    async fn provision(&self) -> Result<Environment, GatewayError> {
        let mut images = vec![self.image.clone()];
        if self.image.is_some() {
            images.push(None);
        }
        let mut last_error = String::new();
        for image in images {
            let spec = LaunchSpec {
                backend_id: SANDBOX_ID.to_string(),
                runtime: RuntimeKind::ProcessPy,
                image: image.clone(),
                env: IndexMap::new(),
                ephemeral: true,
            };
            let runtime = Arc::clone(&self.runtime);
            match self.pool.run(move || runtime.provision(&spec)).await? {
                Ok(environment) => return Ok(environment),
                Err(error) => {
                    warn!(
                        target: "sandbox",
                        "Sandbox image {} unavailable: {}",
                        image.as_deref().unwrap_or("(default)"),
                        error
                    );
                    last_error = error.to_string();
                }
            }
        }
        Err(LifecycleError::backend_start(SANDBOX_ID, StartPhase::Provision, last_error, "").into())
    }

    async fn execute(&self, environment: &Environment, code: &str, missing: Vec<String>) -> Result<SandboxRun, GatewayError> {
        if !missing.is_empty() {
            info!(target: "sandbox", "Installing sandbox libraries: {}", missing.join(", "));
            let command = format!(
                "pip install --no-cache-dir {}",
                missing.iter().map(|library| format!("'{library}'")).collect::<Vec<_>>().join(" ")
            );
            let install = self.exec(environment, command, None).await?;
            if !install.success() {
                return Ok(SandboxRun {
                    status: RunStatus::Error,
                    stdout: install.stdout,
                    stderr: format!("Failed to install libraries: {}", install.stderr),
                    exit_code: Some(install.exit_code),
                });
            }
        }
        let outcome = self.exec(environment, "python3 -".to_string(), Some(code.to_string())).await?;
        Ok(SandboxRun::finished(outcome))
    }

    async fn exec(&self, environment: &Environment, command: String, stdin: Option<String>) -> Result<ExecOutcome, GatewayError> {
        let runtime = Arc::clone(&self.runtime);
        let environment = environment.clone();
        self.pool
            .run(move || runtime.execute(&environment, &command, stdin.as_deref()))
            .await?
            .map_err(|error| GatewayError::internal(format!("sandbox execution failed: {error}")))
    }
}

/// Dispatches calls to gateway-local tools.
pub struct LocalTools {
    python: PythonSandbox,
}

impl LocalTools {
    pub fn new(manager: &ExecutionManager, settings: &GatewaySettings) -> Self {
        Self {
            python: PythonSandbox::new(
                manager.runtime(),
                manager.pool().clone(),
                settings.sandbox.sandbox_image.clone(),
                settings.python_sandbox_timeout,
            ),
        }
    }

    pub fn catalog(&self) -> Vec<Value> {
        [LocalTool::ListProviders, LocalTool::PythonSandbox]
            .into_iter()
            .map(LocalTool::descriptor)
            .collect()
    }

    pub async fn call(
        &self,
        tool: LocalTool,
        arguments: Option<&Value>,
        snapshot: &RoutingSnapshot,
        sessions: &[SessionSummary],
        cancel: &CancellationToken,
    ) -> Result<Value, GatewayError> {
        match tool {
            LocalTool::ListProviders => Ok(list_providers(snapshot, sessions)),
            LocalTool::PythonSandbox => {
                let arguments = arguments.cloned().unwrap_or(Value::Null);
                let code = arguments
                    .get("code")
                    .and_then(Value::as_str)
                    .filter(|code| !code.trim().is_empty())
                    .ok_or_else(|| GatewayError::invalid_params("python_sandbox requires a non-empty 'code' string"))?;
                let libraries: Vec<String> = match arguments.get("libraries") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(value) => serde_json::from_value(value.clone())
                        .map_err(|_| GatewayError::invalid_params("'libraries' must be an array of strings"))?,
                };
                let run = self.python.run(code, &libraries, cancel).await?;
                let structured = serde_json::to_value(&run).map_err(|error| GatewayError::internal(error.to_string()))?;
                Ok(json!({
                    "content": [{ "type": "text", "text": structured.to_string() }],
                    "structuredContent": structured,
                    "isError": run.is_error(),
                }))
            }
        }
    }
}

fn list_providers(snapshot: &RoutingSnapshot, sessions: &[SessionSummary]) -> Value {
    let ids: Vec<&str> = snapshot.ids().collect();
    let details: Vec<Value> = snapshot
        .descriptors()
        .iter()
        .map(|descriptor| {
            let state = sessions
                .iter()
                .find(|summary| summary.backend_id == descriptor.id)
                .map_or(SessionState::Stopped, |summary| summary.state);
            json!({
                "id": descriptor.id,
                "name": descriptor.name,
                "description": descriptor.description,
                "state": state.display(),
            })
        })
        .collect();
    json!({
        "content": [
            { "type": "text", "text": Value::from(ids.clone()).to_string() },
            { "type": "text", "text": Value::Array(details).to_string() },
        ],
        "structuredContent": { "result": ids },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anywhere_types::BackendDescriptor;

    #[test]
    fn local_tool_names_round_trip() {
        for name in LOCAL_TOOL_NAMES {
            assert_eq!(LocalTool::from_name(name).map(LocalTool::name), Some(name));
        }
        assert_eq!(LocalTool::from_name("alpha_echo"), None);
    }

    #[test]
    fn preinstalled_libraries_are_skipped() {
        let requested = vec!["pandas".to_string(), "NumPy==1.26".to_string(), "requests>=2.31".to_string(), "requests>=2.31".to_string()];
        assert_eq!(PythonSandbox::missing_libraries(&requested).unwrap(), vec!["requests>=2.31".to_string()]);
    }

    #[test]
    fn shell_metacharacters_are_rejected() {
        let requested = vec!["requests; rm -rf /".to_string()];
        assert!(matches!(
            PythonSandbox::missing_libraries(&requested),
            Err(GatewayError::InvalidParams { .. })
        ));
        assert!(PythonSandbox::missing_libraries(&["'quoted'".to_string()]).is_err());
    }

    #[test]
    fn list_providers_reports_ids_in_order() {
        let mut beta = BackendDescriptor::new("beta", RuntimeKind::ProcessPy, "b");
        beta.description = Some("Python tools".into());
        let snapshot = RoutingSnapshot::new(1, vec![BackendDescriptor::new("alpha", RuntimeKind::ProcessJs, "a"), beta]);
        let sessions = vec![SessionSummary {
            backend_id: "beta".into(),
            session_id: 1,
            state: SessionState::Idle,
            leases: 0,
            idle_for: Duration::from_secs(3),
        }];

        let result = list_providers(&snapshot, &sessions);
        assert_eq!(result["structuredContent"]["result"], json!(["alpha", "beta"]));
        let details: Value = serde_json::from_str(result["content"][1]["text"].as_str().unwrap()).unwrap();
        assert_eq!(details[0]["state"], "Stopped");
        assert_eq!(details[1]["state"], "Idle");
        assert_eq!(details[1]["description"], "Python tools");
    }

    #[test]
    fn run_status_serializes_lowercase() {
        let run = SandboxRun::timed_out(Duration::from_secs(60));
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["status"], "timeout");
        assert_eq!(value["exit_code"], Value::Null);
        assert!(run.is_error());
    }
}
