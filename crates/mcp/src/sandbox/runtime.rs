//! The isolated-execution capability the lifecycle manager consumes.

use std::time::Duration;

use anywhere_types::RuntimeKind;
use indexmap::IndexMap;
use tokio::process::Child;

use crate::sandbox::RuntimeError;
use crate::transport::{BoxedReader, BoxedWriter};

/// What to provision for one backend.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub backend_id: String,
    pub runtime: RuntimeKind,
    /// Image override; the runtime picks a default per kind otherwise.
    pub image: Option<String>,
    pub env: IndexMap<String, String>,
    /// Throwaway environments get a unique name and are always removed.
    pub ephemeral: bool,
}

/// A provisioned isolated environment.
#[derive(Debug, Clone)]
pub struct Environment {
    pub backend_id: String,
    pub runtime: RuntimeKind,
    /// Runtime-specific handle: container name or working directory.
    pub reference: String,
    pub image: Option<String>,
    pub env: IndexMap<String, String>,
    /// False when an existing environment was adopted; teardown leaves it alone.
    pub owned: bool,
    pub ephemeral: bool,
}

/// Result of a command run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Liveness and termination of a launched server process.
pub trait ProcessControl: Send {
    fn is_alive(&mut self) -> bool;

    fn pid(&self) -> Option<u32>;

    /// Asks the process to exit.
    fn terminate(&mut self) -> Result<(), RuntimeError>;

    /// Forces the process to exit.
    fn kill(&mut self) -> Result<(), RuntimeError>;
}

/// A started server with its pipes.
pub struct LaunchedProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub control: Box<dyn ProcessControl>,
}

impl std::fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("pid", &self.control.pid())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Synchronous sandbox API. Calls are submitted to the manager's worker pool.
pub trait SandboxRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    fn provision(&self, spec: &LaunchSpec) -> Result<Environment, RuntimeError>;

    /// Runs `command` through a shell inside the environment, feeding `stdin`.
    fn execute(&self, environment: &Environment, command: &str, stdin: Option<&str>) -> Result<ExecOutcome, RuntimeError>;

    /// Clears package-manager caches after a failed install.
    fn clear_cache(&self, environment: &Environment) -> Result<(), RuntimeError>;

    fn launch(&self, environment: &Environment, start_command: &str) -> Result<LaunchedProcess, RuntimeError>;

    fn teardown(&self, environment: &Environment) -> Result<(), RuntimeError>;

    /// Reports whether the runtime is usable, with a version string.
    fn health(&self) -> Result<String, RuntimeError>;
}

/// [`ProcessControl`] over a tokio child process.
pub struct ChildControl {
    child: Child,
}

impl ChildControl {
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    /// Splits a freshly spawned child into a [`LaunchedProcess`].
    pub fn launched(mut child: Child) -> Result<LaunchedProcess, RuntimeError> {
        let stdin = child.stdin.take().ok_or(RuntimeError::MissingPipe { stream: "stdin" })?;
        let stdout = child.stdout.take().ok_or(RuntimeError::MissingPipe { stream: "stdout" })?;
        let stderr = child.stderr.take().map(|stderr| Box::new(stderr) as BoxedReader);
        Ok(LaunchedProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            control: Box::new(ChildControl::new(child)),
        })
    }
}

impl ProcessControl for ChildControl {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<(), RuntimeError> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        // SAFETY: signalling a pid we spawned and have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(RuntimeError::io("sending SIGTERM", std::io::Error::last_os_error()))
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<(), RuntimeError> {
        self.kill()
    }

    fn kill(&mut self) -> Result<(), RuntimeError> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(error) => Err(RuntimeError::io("killing process", error)),
        }
    }
}

/// Terminates gracefully, waiting up to `grace` before killing. Blocking.
pub fn stop_process(control: &mut dyn ProcessControl, grace: Duration) {
    if !control.is_alive() {
        return;
    }
    if let Err(error) = control.terminate() {
        tracing::debug!(target: "sandbox", "Graceful terminate failed: {}", error);
    }
    let deadline = std::time::Instant::now() + grace;
    while std::time::Instant::now() < deadline {
        if !control.is_alive() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    if let Err(error) = control.kill() {
        tracing::warn!(target: "sandbox", "Failed to kill process: {}", error);
    }
}

/// Runs a blocking command to completion, feeding `stdin` from a helper thread.
pub(crate) fn capture(mut command: std::process::Command, stdin: Option<&str>, label: &str) -> Result<ExecOutcome, RuntimeError> {
    use std::io::Write;
    use std::process::Stdio;

    command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|error| RuntimeError::io(format!("spawning {label}"), error))?;

    let writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_string();
            Some(std::thread::spawn(move || {
                let _ = pipe.write_all(input.as_bytes());
            }))
        }
        _ => None,
    };

    let output = child
        .wait_with_output()
        .map_err(|error| RuntimeError::io(format!("waiting for {label}"), error))?;
    if let Some(writer) = writer {
        let _ = writer.join();
    }

    Ok(ExecOutcome {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Last `max_lines` lines of `text`.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
