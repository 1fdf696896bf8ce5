//! Append-only JSONL audit trail of session lifecycle events and call failures.

use std::path::{Path, PathBuf};

use anywhere_util::redact_sensitive;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_MAX_AUDIT_BYTES: u64 = 10 * 1024 * 1024;

/// Handle used to queue audit entries for the background writer.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    sender: mpsc::UnboundedSender<AuditEntry>,
    log_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub backend_id: String,
    pub action: AuditAction,
    pub metadata: Map<String, Value>,
    pub result: AuditResult,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditAction {
    SessionTransition,
    CallFailed,
    Refresh,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditResult {
    Success,
    Failure,
}

impl AuditEntry {
    pub fn session_transition(backend_id: &str, session_id: u64, from: &str, to: &str) -> Self {
        let mut metadata = Map::new();
        metadata.insert("session".to_string(), Value::from(session_id));
        metadata.insert("from".to_string(), Value::from(from));
        metadata.insert("to".to_string(), Value::from(to));
        Self {
            timestamp: Utc::now(),
            backend_id: backend_id.to_string(),
            action: AuditAction::SessionTransition,
            metadata,
            result: if to == "Failed" { AuditResult::Failure } else { AuditResult::Success },
        }
    }

    pub fn call_failed(backend_id: &str, method: &str, detail: &str) -> Self {
        let mut metadata = Map::new();
        metadata.insert("method".to_string(), Value::from(method));
        metadata.insert("detail".to_string(), Value::from(redact_sensitive(detail)));
        Self {
            timestamp: Utc::now(),
            backend_id: backend_id.to_string(),
            action: AuditAction::CallFailed,
            metadata,
            result: AuditResult::Failure,
        }
    }
}

impl AuditLogger {
    /// Spawns the background writer. Must be called inside a Tokio runtime.
    pub fn spawn(log_path: PathBuf) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<AuditEntry>();
        let path = log_path.clone();
        tokio::spawn(async move {
            while let Some(entry) = receiver.recv().await {
                if let Err(error) = append_entry(&path, &entry).await {
                    debug!(target: "audit", "audit write to {} failed: {error}", path.display());
                }
            }
        });
        Self { sender, log_path }
    }

    /// Queues an entry. Never blocks and never fails the caller.
    pub fn log(&self, entry: AuditEntry) {
        let _ = self.sender.send(entry);
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

async fn append_entry(path: &Path, entry: &AuditEntry) -> Result<(), AuditError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    rotate_if_large(path).await?;

    let mut line = serde_json::to_string(entry).map_err(|error| AuditError::Serialization(error.to_string()))?;
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

async fn rotate_if_large(path: &Path) -> Result<(), AuditError> {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return Ok(());
    };
    if metadata.len() <= DEFAULT_MAX_AUDIT_BYTES {
        return Ok(());
    }
    let rotated = path.with_extension(format!("{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S")));
    tokio::fs::rename(path, &rotated).await?;
    debug!(target: "audit", "rotated audit log to {}", rotated.display());
    Ok(())
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
