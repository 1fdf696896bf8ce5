//! Docker CLI sandbox.
//!
//! Process runtimes (`process-js`, `process-py`) get one long-running
//! container per backend named `{prefix}{id}`; installs and the server itself
//! run inside it through `docker exec`. A container that is already running
//! under that name is adopted without ownership and never removed by this
//! gateway. The `container` runtime runs the image's own entrypoint with
//! `docker run -i --rm`.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use anywhere_types::RuntimeKind;
use anywhere_util::split_command_line;
use indexmap::IndexMap;
use tracing::{debug, info};

use crate::config::SandboxSettings;
use crate::sandbox::runtime::capture;
use crate::sandbox::{ChildControl, Environment, ExecOutcome, LaunchSpec, LaunchedProcess, RuntimeError, SandboxRuntime};

static EPHEMERAL_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    settings: SandboxSettings,
}

impl DockerRuntime {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }

    fn command(&self) -> std::process::Command {
        let mut command = std::process::Command::new(&self.settings.docker_binary);
        if let Some(host) = &self.settings.docker_host {
            command.env("DOCKER_HOST", host);
        }
        command
    }

    fn async_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.settings.docker_binary);
        if let Some(host) = &self.settings.docker_host {
            command.env("DOCKER_HOST", host);
        }
        command
    }

    fn docker(&self, args: &[String], stdin: Option<&str>) -> Result<ExecOutcome, RuntimeError> {
        let mut command = self.command();
        command.args(args);
        capture(command, stdin, "docker")
    }

    fn docker_checked(&self, args: &[String]) -> Result<ExecOutcome, RuntimeError> {
        let outcome = self.docker(args, None)?;
        if outcome.success() {
            Ok(outcome)
        } else {
            Err(RuntimeError::CommandFailed {
                command: format!("docker {}", args.first().map(String::as_str).unwrap_or_default()),
                exit_code: Some(outcome.exit_code),
                stderr: outcome.stderr.trim().to_string(),
            })
        }
    }

    fn container_name(&self, spec: &LaunchSpec) -> String {
        if spec.ephemeral {
            let unique = EPHEMERAL_COUNTER.fetch_add(1, Ordering::Relaxed);
            format!(
                "{}{}-{}-{}",
                self.settings.container_prefix,
                spec.backend_id,
                std::process::id(),
                unique
            )
        } else {
            format!("{}{}", self.settings.container_prefix, spec.backend_id)
        }
    }

    fn default_image(&self, runtime: &RuntimeKind) -> Option<String> {
        match runtime {
            RuntimeKind::ProcessJs => Some(self.settings.node_image.clone()),
            RuntimeKind::ProcessPy => Some(self.settings.python_image.clone()),
            RuntimeKind::Container | RuntimeKind::Unsupported(_) => None,
        }
    }

    fn is_running(&self, name: &str) -> bool {
        let args = ["inspect", "-f", "{{.State.Running}}", name].map(String::from);
        self.docker(&args, None)
            .is_ok_and(|outcome| outcome.success() && outcome.stdout.trim() == "true")
    }

    fn limit_args(&self) -> Vec<String> {
        vec![
            "--memory".to_string(),
            self.settings.memory_limit.clone(),
            "--cpus".to_string(),
            self.settings.cpu_limit.clone(),
        ]
    }
}

fn env_args(env: &IndexMap<String, String>) -> Vec<String> {
    env.iter()
        .flat_map(|(key, value)| ["-e".to_string(), format!("{key}={value}")])
        .collect()
}

impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn provision(&self, spec: &LaunchSpec) -> Result<Environment, RuntimeError> {
        let name = self.container_name(spec);
        let image = spec.image.clone().or_else(|| self.default_image(&spec.runtime));
        let mut environment = Environment {
            backend_id: spec.backend_id.clone(),
            runtime: spec.runtime.clone(),
            reference: name.clone(),
            image: image.clone(),
            env: spec.env.clone(),
            owned: true,
            ephemeral: spec.ephemeral,
        };

        match &spec.runtime {
            RuntimeKind::Container => return Ok(environment),
            RuntimeKind::Unsupported(runtime) => {
                return Err(RuntimeError::Unsupported {
                    runtime: runtime.clone(),
                    sandbox: "docker",
                });
            }
            RuntimeKind::ProcessJs | RuntimeKind::ProcessPy => {}
        }

        if !spec.ephemeral && self.is_running(&name) {
            info!(target: "sandbox", backend = %spec.backend_id, "Adopting running container {}", name);
            environment.owned = false;
            return Ok(environment);
        }

        // A stopped container with the same name would block `docker run`.
        let _ = self.docker(&["rm".to_string(), "-f".to_string(), name.clone()], None);

        let mut args = vec!["run".to_string(), "-d".to_string(), "--name".to_string(), name.clone()];
        args.extend(self.limit_args());
        args.extend(env_args(&spec.env));
        args.push(image.unwrap_or_default());
        args.extend(["sleep", "infinity"].map(String::from));
        self.docker_checked(&args)?;
        debug!(target: "sandbox", backend = %spec.backend_id, "Created container {}", name);
        Ok(environment)
    }

    fn execute(&self, environment: &Environment, command: &str, stdin: Option<&str>) -> Result<ExecOutcome, RuntimeError> {
        if environment.runtime == RuntimeKind::Container {
            return Err(RuntimeError::Unsupported {
                runtime: "container (exec)".to_string(),
                sandbox: "docker",
            });
        }
        let mut args = vec!["exec".to_string()];
        if stdin.is_some() {
            args.push("-i".to_string());
        }
        args.extend(env_args(&environment.env));
        args.push(environment.reference.clone());
        args.extend(["sh".to_string(), "-c".to_string(), command.to_string()]);
        self.docker(&args, stdin)
    }

    fn clear_cache(&self, environment: &Environment) -> Result<(), RuntimeError> {
        let command = match environment.runtime {
            RuntimeKind::ProcessJs => "npm cache clean --force",
            RuntimeKind::ProcessPy => "pip cache purge",
            _ => return Ok(()),
        };
        let outcome = self.execute(environment, command, None)?;
        if !outcome.success() {
            debug!(target: "sandbox", backend = %environment.backend_id, "Cache clear exited with {}", outcome.exit_code);
        }
        Ok(())
    }

    fn launch(&self, environment: &Environment, start_command: &str) -> Result<LaunchedProcess, RuntimeError> {
        let mut command = self.async_command();
        if environment.runtime == RuntimeKind::Container {
            let mut argv = split_command_line(start_command).unwrap_or_default();
            let image = match environment.image.clone() {
                Some(image) => image,
                None if !argv.is_empty() => argv.remove(0),
                None => return Err(RuntimeError::CommandLine(anywhere_util::CommandLineError::Empty)),
            };
            command
                .args(["run", "-i", "--rm", "--name", environment.reference.as_str()])
                .args(self.limit_args())
                .args(env_args(&environment.env))
                .arg(image)
                .args(argv);
        } else {
            command
                .args(["exec", "-i"])
                .args(env_args(&environment.env))
                .arg(&environment.reference)
                .args(["sh", "-c", start_command]);
        }

        let child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| RuntimeError::io("spawning docker", error))?;
        ChildControl::launched(child)
    }

    fn teardown(&self, environment: &Environment) -> Result<(), RuntimeError> {
        if !environment.owned {
            debug!(target: "sandbox", "Leaving adopted container {} running", environment.reference);
            return Ok(());
        }
        let outcome = self.docker(&["rm".to_string(), "-f".to_string(), environment.reference.clone()], None)?;
        if !outcome.success() && !outcome.stderr.contains("No such container") {
            return Err(RuntimeError::CommandFailed {
                command: "docker rm".to_string(),
                exit_code: Some(outcome.exit_code),
                stderr: outcome.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn health(&self) -> Result<String, RuntimeError> {
        let args = ["version", "--format", "{{.Server.Version}}"].map(String::from);
        let outcome = self.docker_checked(&args)?;
        Ok(format!("docker {}", outcome.stdout.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(ephemeral: bool) -> LaunchSpec {
        LaunchSpec {
            backend_id: "alpha".to_string(),
            runtime: RuntimeKind::ProcessJs,
            image: None,
            env: IndexMap::new(),
            ephemeral,
        }
    }

    #[test]
    fn shared_containers_use_the_stable_name() {
        let runtime = DockerRuntime::new(SandboxSettings::default());
        assert_eq!(runtime.container_name(&spec(false)), "mcp-alpha");
    }

    #[test]
    fn ephemeral_containers_get_unique_names() {
        let runtime = DockerRuntime::new(SandboxSettings::default());
        let first = runtime.container_name(&spec(true));
        let second = runtime.container_name(&spec(true));
        assert_ne!(first, second);
        assert!(first.starts_with("mcp-alpha-"));
    }

    #[test]
    fn env_is_passed_as_flags() {
        let mut env = IndexMap::new();
        env.insert("API_KEY".to_string(), "secret".to_string());
        assert_eq!(env_args(&env), vec!["-e".to_string(), "API_KEY=secret".to_string()]);
    }

    #[test]
    fn default_images_follow_runtime_kind() {
        let runtime = DockerRuntime::new(SandboxSettings::default());
        assert_eq!(runtime.default_image(&RuntimeKind::ProcessJs).as_deref(), Some("node:20-slim"));
        assert_eq!(runtime.default_image(&RuntimeKind::ProcessPy).as_deref(), Some("python:3.11-slim"));
        assert_eq!(runtime.default_image(&RuntimeKind::Container), None);
    }
}
