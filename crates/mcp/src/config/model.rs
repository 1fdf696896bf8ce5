//! Data models for descriptor files and gateway settings.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anywhere_types::BackendDescriptor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{InterpolationError, ValidationError};

/// Top-level shape of a descriptor file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DescriptorFile {
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,
}

/// Which sandbox implementation executes backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeBackend {
    /// Docker containers with resource limits.
    #[default]
    Docker,
    /// Plain host processes; development only.
    Local,
}

impl FromStr for RuntimeBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(RuntimeBackend::Docker),
            "local" => Ok(RuntimeBackend::Local),
            other => Err(ConfigError::Invalid {
                message: format!("unknown sandbox runtime '{other}' (expected docker or local)"),
            }),
        }
    }
}

impl std::fmt::Display for RuntimeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeBackend::Docker => write!(f, "docker"),
            RuntimeBackend::Local => write!(f, "local"),
        }
    }
}

/// Settings for the sandbox runtime.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub runtime: RuntimeBackend,
    pub docker_binary: String,
    pub docker_host: Option<String>,
    pub node_image: String,
    pub python_image: String,
    /// Image for the `python_sandbox` tool; falls back to `python_image`.
    pub sandbox_image: Option<String>,
    pub memory_limit: String,
    pub cpu_limit: String,
    pub container_prefix: String,
    /// Root for per-backend working directories of the local runtime.
    pub work_dir: PathBuf,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            runtime: RuntimeBackend::Docker,
            docker_binary: "docker".to_string(),
            docker_host: None,
            node_image: "node:20-slim".to_string(),
            python_image: "python:3.11-slim".to_string(),
            sandbox_image: Some("mcp-router-python-sandbox".to_string()),
            memory_limit: "512m".to_string(),
            cpu_limit: "0.5".to_string(),
            container_prefix: "mcp-".to_string(),
            work_dir: std::env::temp_dir().join("mcp-anywhere"),
        }
    }
}

/// Settings for the execution lifecycle manager.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub idle_timeout: Duration,
    pub housekeeping_interval: Duration,
    pub shutdown_grace: Duration,
    pub max_sessions: Option<usize>,
    pub worker_threads: usize,
    pub reuse_sessions: bool,
    pub stderr_tail_lines: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            housekeeping_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            max_sessions: None,
            worker_threads: 4,
            reuse_sessions: true,
            stderr_tail_lines: 20,
        }
    }
}

/// Everything the router needs beyond the descriptor store.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Per-call timeout enforced by every transport adapter.
    pub call_timeout: Duration,
    /// Bound on session start plus backend handshake.
    pub startup_timeout: Duration,
    /// Wall-clock limit for one `python_sandbox` run.
    pub python_sandbox_timeout: Duration,
    pub lifecycle: LifecycleSettings,
    pub sandbox: SandboxSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(60),
            startup_timeout: Duration::from_secs(120),
            python_sandbox_timeout: Duration::from_secs(60),
            lifecycle: LifecycleSettings::default(),
            sandbox: SandboxSettings::default(),
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Interpolation error: {0}")]
    Interpolation(#[from] InterpolationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {message}")]
    Invalid { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_backend_parses_case_insensitively() {
        assert_eq!("Docker".parse::<RuntimeBackend>().unwrap(), RuntimeBackend::Docker);
        assert_eq!("local".parse::<RuntimeBackend>().unwrap(), RuntimeBackend::Local);
        assert!("podman".parse::<RuntimeBackend>().is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.call_timeout, Duration::from_secs(60));
        assert_eq!(settings.lifecycle.idle_timeout, Duration::from_secs(300));
        assert_eq!(settings.sandbox.memory_limit, "512m");
        assert_eq!(settings.sandbox.node_image, "node:20-slim");
    }
}
