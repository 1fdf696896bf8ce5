use std::fmt;

use thiserror::Error;

/// Step of session construction that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPhase {
    Provision,
    Install,
    Launch,
    Handshake,
}

impl StartPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StartPhase::Provision => "provision",
            StartPhase::Install => "install",
            StartPhase::Launch => "launch",
            StartPhase::Handshake => "handshake",
        }
    }
}

impl fmt::Display for StartPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the execution lifecycle manager.
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    /// The descriptor cannot be turned into a session; never retried.
    #[error("Configuration error for backend '{backend_id}': {reason}")]
    Configuration { backend_id: String, reason: String },

    /// Install, launch or handshake failed.
    #[error("Backend '{backend_id}' failed during {phase}: {detail}")]
    BackendStart {
        backend_id: String,
        phase: StartPhase,
        detail: String,
        stderr_tail: String,
    },

    #[error("Worker pool error: {message}")]
    Worker { message: String },

    #[error("Execution manager is shut down")]
    ShutDown,
}

impl LifecycleError {
    pub fn configuration(backend_id: &str, reason: impl Into<String>) -> Self {
        LifecycleError::Configuration {
            backend_id: backend_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn backend_start(backend_id: &str, phase: StartPhase, detail: impl Into<String>, stderr_tail: impl Into<String>) -> Self {
        LifecycleError::BackendStart {
            backend_id: backend_id.to_string(),
            phase,
            detail: detail.into(),
            stderr_tail: stderr_tail.into(),
        }
    }
}

/// Errors reported by a sandbox runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Runtime kind '{runtime}' is not supported by the {sandbox} sandbox")]
    Unsupported { runtime: String, sandbox: &'static str },

    #[error("Command '{command}' failed (exit code {}): {stderr}", exit_code.map_or_else(|| "none".to_string(), |code| code.to_string()))]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Invalid command line: {0}")]
    CommandLine(#[from] anywhere_util::CommandLineError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process is missing its {stream} pipe")]
    MissingPipe { stream: &'static str },
}

impl RuntimeError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        RuntimeError::Io {
            context: context.into(),
            source,
        }
    }
}
