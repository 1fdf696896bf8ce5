//! Shared wiring for the `mcp-anywhere` binaries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use anywhere_mcp::config::{
    FileDescriptorStore, GatewaySettings, LifecycleSettings, RuntimeBackend, SandboxSettings, default_descriptor_path,
};
use anywhere_mcp::gateway::GatewayRouter;
use anywhere_mcp::logging::{AuditLogger, LogManager, default_audit_log_path};
use anywhere_mcp::sandbox::runtime_from_settings;
use anywhere_util::expand_tilde;
use clap::Args;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "MCP_ANYWHERE_LOG";

/// Installs the global subscriber. Output always goes to stderr so stdout
/// stays reserved for protocol envelopes.
pub fn init_tracing(log_level: Option<&str>, default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.unwrap_or(default_level)))
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Options shared by every gateway binary.
#[derive(Args, Debug, Clone)]
pub struct GatewayArgs {
    /// Backend descriptor file (JSON or YAML)
    #[arg(long, env = "MCP_ANYWHERE_DESCRIPTORS")]
    pub descriptors: Option<String>,

    /// Sandbox runtime: docker or local
    #[arg(long, env = "MCP_ANYWHERE_RUNTIME", default_value = "docker")]
    pub runtime: RuntimeBackend,

    /// Docker daemon to talk to
    #[arg(long, env = "DOCKER_HOST")]
    pub docker_host: Option<String>,

    #[arg(long, env = "MCP_ANYWHERE_NODE_IMAGE", default_value = "node:20-slim")]
    pub node_image: String,

    #[arg(long, env = "MCP_ANYWHERE_PYTHON_IMAGE", default_value = "python:3.11-slim")]
    pub python_image: String,

    /// Image for the python_sandbox tool; falls back to the python image
    #[arg(long, env = "MCP_ANYWHERE_SANDBOX_IMAGE", default_value = "mcp-router-python-sandbox")]
    pub sandbox_image: String,

    #[arg(long, env = "MCP_ANYWHERE_MEMORY_LIMIT", default_value = "512m")]
    pub memory_limit: String,

    #[arg(long, env = "MCP_ANYWHERE_CPU_LIMIT", default_value = "0.5")]
    pub cpu_limit: String,

    #[arg(long, env = "MCP_ANYWHERE_CONTAINER_PREFIX", default_value = "mcp-")]
    pub container_prefix: String,

    /// Working directories of the local runtime
    #[arg(long, env = "MCP_ANYWHERE_DATA_DIR")]
    pub data_dir: Option<String>,

    /// Per-call timeout in seconds
    #[arg(long, env = "MCP_ANYWHERE_CALL_TIMEOUT", default_value_t = 60)]
    pub call_timeout: u64,

    /// Seconds allowed for session start plus backend handshake
    #[arg(long, env = "MCP_ANYWHERE_STARTUP_TIMEOUT", default_value_t = 120)]
    pub startup_timeout: u64,

    #[arg(long, env = "MCP_ANYWHERE_SANDBOX_TIMEOUT", default_value_t = 60)]
    pub python_sandbox_timeout: u64,

    /// Seconds an idle session is kept for reuse
    #[arg(long, env = "MCP_ANYWHERE_IDLE_TIMEOUT", default_value_t = 300)]
    pub idle_timeout: u64,

    #[arg(long, env = "MCP_ANYWHERE_HOUSEKEEPING_INTERVAL", default_value_t = 30)]
    pub housekeeping_interval: u64,

    #[arg(long, env = "MCP_ANYWHERE_SHUTDOWN_GRACE", default_value_t = 5)]
    pub shutdown_grace: u64,

    /// Upper bound on live sessions; the least recently used idle one is evicted
    #[arg(long, env = "MCP_ANYWHERE_MAX_SESSIONS")]
    pub max_sessions: Option<usize>,

    /// Threads available for blocking sandbox operations
    #[arg(long, env = "MCP_ANYWHERE_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Stop each session as soon as its call completes
    #[arg(long, env = "MCP_ANYWHERE_NO_REUSE")]
    pub no_reuse: bool,

    /// Append session transitions and call failures to a JSONL audit file
    #[arg(long, env = "MCP_ANYWHERE_AUDIT_LOG")]
    pub audit_log: Option<Option<String>>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = LOG_LEVEL_ENV)]
    pub log_level: Option<String>,
}

impl GatewayArgs {
    pub fn descriptor_path(&self) -> PathBuf {
        match self.descriptors.as_deref() {
            Some(path) if !path.trim().is_empty() => expand_tilde(path),
            _ => default_descriptor_path(),
        }
    }

    pub fn settings(&self) -> GatewaySettings {
        let defaults = SandboxSettings::default();
        GatewaySettings {
            call_timeout: Duration::from_secs(self.call_timeout),
            startup_timeout: Duration::from_secs(self.startup_timeout),
            python_sandbox_timeout: Duration::from_secs(self.python_sandbox_timeout),
            lifecycle: LifecycleSettings {
                idle_timeout: Duration::from_secs(self.idle_timeout),
                housekeeping_interval: Duration::from_secs(self.housekeeping_interval.max(1)),
                shutdown_grace: Duration::from_secs(self.shutdown_grace),
                max_sessions: self.max_sessions.filter(|max| *max > 0),
                worker_threads: self.workers.max(1),
                reuse_sessions: !self.no_reuse,
                ..LifecycleSettings::default()
            },
            sandbox: SandboxSettings {
                runtime: self.runtime,
                docker_host: self.docker_host.clone().filter(|host| !host.is_empty()),
                node_image: self.node_image.clone(),
                python_image: self.python_image.clone(),
                sandbox_image: Some(self.sandbox_image.clone()).filter(|image| !image.is_empty()),
                memory_limit: self.memory_limit.clone(),
                cpu_limit: self.cpu_limit.clone(),
                container_prefix: self.container_prefix.clone(),
                work_dir: self.data_dir.as_deref().map(expand_tilde).unwrap_or(defaults.work_dir.clone()),
                ..defaults
            },
        }
    }

    fn diagnostics(&self) -> LogManager {
        match &self.audit_log {
            None => LogManager::new(),
            Some(path) => {
                let path = path
                    .as_deref()
                    .map(expand_tilde)
                    .unwrap_or_else(default_audit_log_path);
                LogManager::new().with_audit(AuditLogger::spawn(path))
            }
        }
    }
}

/// Builds the router over the descriptor file and the configured runtime.
pub async fn build_gateway(args: &GatewayArgs) -> Result<Arc<GatewayRouter>> {
    let settings = args.settings();
    let store = Arc::new(FileDescriptorStore::new(args.descriptor_path()));
    let runtime = runtime_from_settings(&settings.sandbox);
    info!("Using {} sandbox runtime", runtime.name());

    GatewayRouter::build(store, runtime, settings, Arc::new(args.diagnostics()))
        .await
        .with_context(|| format!("failed to load backend descriptors from {}", args.descriptor_path().display()))
}

/// Resolves when the process is asked to stop (Ctrl-C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        gateway: GatewayArgs,
    }

    #[test]
    fn flags_map_onto_settings() {
        let cli = TestCli::parse_from([
            "test",
            "--runtime",
            "local",
            "--idle-timeout",
            "10",
            "--max-sessions",
            "0",
            "--no-reuse",
            "--sandbox-image",
            "",
        ]);
        let settings = cli.gateway.settings();
        assert_eq!(settings.sandbox.runtime, RuntimeBackend::Local);
        assert_eq!(settings.lifecycle.idle_timeout, Duration::from_secs(10));
        assert_eq!(settings.lifecycle.max_sessions, None);
        assert!(!settings.lifecycle.reuse_sessions);
        assert_eq!(settings.sandbox.sandbox_image, None);
        assert_eq!(settings.call_timeout, Duration::from_secs(60));
    }

    #[test]
    fn descriptor_path_prefers_the_flag() {
        temp_env::with_var("MCP_ANYWHERE_DESCRIPTORS", Some("/etc/mcp/backends.yaml"), || {
            let cli = TestCli::parse_from(["test"]);
            assert_eq!(cli.gateway.descriptor_path(), PathBuf::from("/etc/mcp/backends.yaml"));

            let cli = TestCli::parse_from(["test", "--descriptors", "/tmp/other.json"]);
            assert_eq!(cli.gateway.descriptor_path(), PathBuf::from("/tmp/other.json"));
        });
    }
}
