//! Host-process sandbox for development. Provides no isolation.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use anywhere_types::RuntimeKind;
use tracing::debug;

use crate::sandbox::runtime::capture;
use crate::sandbox::{ChildControl, Environment, ExecOutcome, LaunchSpec, LaunchedProcess, RuntimeError, SandboxRuntime};

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct LocalRuntime {
    work_dir: PathBuf,
}

impl LocalRuntime {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

#[cfg(unix)]
fn shell_args(command: &str) -> (&'static str, [&str; 2]) {
    ("sh", ["-c", command])
}

#[cfg(windows)]
fn shell_args(command: &str) -> (&'static str, [&str; 2]) {
    ("cmd", ["/C", command])
}

fn shell(environment: &Environment, command: &str) -> std::process::Command {
    let (program, args) = shell_args(command);
    let mut process = std::process::Command::new(program);
    process.args(args).current_dir(&environment.reference).envs(&environment.env);
    process
}

impl SandboxRuntime for LocalRuntime {
    fn name(&self) -> &'static str {
        "local"
    }

    fn provision(&self, spec: &LaunchSpec) -> Result<Environment, RuntimeError> {
        if !matches!(spec.runtime, RuntimeKind::ProcessJs | RuntimeKind::ProcessPy) {
            return Err(RuntimeError::Unsupported {
                runtime: spec.runtime.to_string(),
                sandbox: "local",
            });
        }

        let dir = if spec.ephemeral {
            let unique = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
            self.work_dir
                .join(format!("{}-{}-{}", spec.backend_id, std::process::id(), unique))
        } else {
            self.work_dir.join(&spec.backend_id)
        };
        std::fs::create_dir_all(&dir).map_err(|error| RuntimeError::io(format!("creating {}", dir.display()), error))?;

        Ok(Environment {
            backend_id: spec.backend_id.clone(),
            runtime: spec.runtime.clone(),
            reference: dir.display().to_string(),
            image: None,
            env: spec.env.clone(),
            owned: true,
            ephemeral: spec.ephemeral,
        })
    }

    fn execute(&self, environment: &Environment, command: &str, stdin: Option<&str>) -> Result<ExecOutcome, RuntimeError> {
        capture(shell(environment, command), stdin, command)
    }

    fn clear_cache(&self, environment: &Environment) -> Result<(), RuntimeError> {
        let command = match environment.runtime {
            RuntimeKind::ProcessJs => "npm cache clean --force",
            RuntimeKind::ProcessPy => "pip cache purge",
            _ => return Ok(()),
        };
        let outcome = self.execute(environment, command, None)?;
        debug!(target: "sandbox", backend = %environment.backend_id, "Cache clear exited with {}", outcome.exit_code);
        Ok(())
    }

    fn launch(&self, environment: &Environment, start_command: &str) -> Result<LaunchedProcess, RuntimeError> {
        let (program, args) = shell_args(start_command);
        let child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&environment.reference)
            .envs(&environment.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| RuntimeError::io(format!("spawning '{start_command}'"), error))?;
        ChildControl::launched(child)
    }

    fn teardown(&self, environment: &Environment) -> Result<(), RuntimeError> {
        if environment.ephemeral {
            std::fs::remove_dir_all(&environment.reference)
                .map_err(|error| RuntimeError::io(format!("removing {}", environment.reference), error))?;
        }
        Ok(())
    }

    fn health(&self) -> Result<String, RuntimeError> {
        Ok(format!("local processes under {}", self.work_dir.display()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn spec(ephemeral: bool) -> LaunchSpec {
        let mut env = IndexMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());
        LaunchSpec {
            backend_id: "alpha".to_string(),
            runtime: RuntimeKind::ProcessPy,
            image: None,
            env,
            ephemeral,
        }
    }

    #[test]
    fn execute_sees_injected_env_and_stdin() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        let environment = runtime.provision(&spec(false)).unwrap();

        let outcome = runtime
            .execute(&environment, "printf '%s ' \"$GREETING\"; cat", Some("world"))
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout, "hello world");
    }

    #[test]
    fn container_kind_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        let mut container = spec(false);
        container.runtime = RuntimeKind::Container;
        assert!(matches!(runtime.provision(&container), Err(RuntimeError::Unsupported { .. })));
    }

    #[test]
    fn ephemeral_environments_are_removed() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        let environment = runtime.provision(&spec(true)).unwrap();
        assert!(std::path::Path::new(&environment.reference).exists());
        runtime.teardown(&environment).unwrap();
        assert!(!std::path::Path::new(&environment.reference).exists());
    }

    #[tokio::test]
    async fn launched_process_is_piped() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = LocalRuntime::new(dir.path());
        let environment = runtime.provision(&spec(false)).unwrap();
        let mut launched = runtime.launch(&environment, "cat").unwrap();

        launched.stdin.write_all(b"ping\n").await.unwrap();
        launched.stdin.flush().await.unwrap();
        let mut lines = BufReader::new(launched.stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ping"));

        assert!(launched.control.is_alive());
        launched.control.kill().unwrap();
    }
}
