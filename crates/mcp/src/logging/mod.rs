//! Diagnostic sink for backend output, session transitions and call failures.
//!
//! Everything recorded here is redacted, kept in a bounded per-backend ring
//! buffer, mirrored to `tracing` (which the binaries route to stderr) and,
//! when configured, appended to a JSONL audit file. Recording is synchronous,
//! never awaits, and swallows every failure so diagnostics cannot stall
//! routing.

mod audit;
mod entry;
mod formatter;
mod ring_buffer;

pub use audit::{AuditAction, AuditEntry, AuditLogger, AuditResult};
pub use entry::{LogEntry, LogLevel, LogSource};
pub use formatter::{LogFormatter, RedactionRules};
pub use ring_buffer::LogRingBuffer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anywhere_types::SessionState;
use chrono::{DateTime, Utc};
use dirs_next::data_dir;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_LOG_ENTRIES_PER_BACKEND: usize = 1000;

/// Stores and forwards diagnostics for every backend.
#[derive(Debug)]
pub struct LogManager {
    buffers: Mutex<HashMap<String, LogRingBuffer>>,
    formatter: LogFormatter,
    audit_logger: Option<AuditLogger>,
    max_entries_per_backend: usize,
}

impl LogManager {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            formatter: LogFormatter::new(),
            audit_logger: None,
            max_entries_per_backend: DEFAULT_MAX_LOG_ENTRIES_PER_BACKEND,
        }
    }

    /// Attaches a JSONL audit trail.
    pub fn with_audit(mut self, audit_logger: AuditLogger) -> Self {
        self.audit_logger = Some(audit_logger);
        self
    }

    /// Records one line for `backend_id`.
    pub fn record(&self, backend_id: &str, level: LogLevel, source: LogSource, message: impl AsRef<str>) {
        let message = self.formatter.redact_message(message.as_ref());
        match level {
            LogLevel::Debug => debug!(target: "diagnostics", backend = backend_id, %source, "{message}"),
            LogLevel::Info => info!(target: "diagnostics", backend = backend_id, %source, "{message}"),
            LogLevel::Warn => warn!(target: "diagnostics", backend = backend_id, %source, "{message}"),
            LogLevel::Error => error!(target: "diagnostics", backend = backend_id, %source, "{message}"),
        }

        let entry = LogEntry::new(level, source, backend_id, message);
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers
                .entry(backend_id.to_string())
                .or_insert_with(|| LogRingBuffer::new(self.max_entries_per_backend))
                .add_entry(entry);
        }
    }

    /// Records a session state transition.
    pub fn session_transition(&self, backend_id: &str, session_id: u64, from: SessionState, to: SessionState) {
        let level = if to == SessionState::Failed { LogLevel::Warn } else { LogLevel::Info };
        self.record(
            backend_id,
            level,
            LogSource::Gateway,
            format!("session {session_id}: {from} -> {to}"),
        );
        if let Some(audit_logger) = &self.audit_logger {
            audit_logger.log(AuditEntry::session_transition(backend_id, session_id, from.display(), to.display()));
        }
    }

    /// Records a failed backend call.
    pub fn call_failed(&self, backend_id: &str, method: &str, detail: &str) {
        self.record(backend_id, LogLevel::Warn, LogSource::Gateway, format!("{method} failed: {detail}"));
        if let Some(audit_logger) = &self.audit_logger {
            audit_logger.log(AuditEntry::call_failed(backend_id, method, detail));
        }
    }

    pub fn recent(&self, backend_id: &str, count: usize) -> Vec<LogEntry> {
        self.buffers
            .lock()
            .ok()
            .and_then(|buffers| buffers.get(backend_id).map(|buffer| buffer.get_recent(count)))
            .unwrap_or_default()
    }

    /// Last `max_lines` stderr lines of `backend_id` recorded since `since`.
    pub fn stderr_tail(&self, backend_id: &str, since: DateTime<Utc>, max_lines: usize) -> String {
        self.buffers
            .lock()
            .ok()
            .and_then(|buffers| {
                buffers
                    .get(backend_id)
                    .map(|buffer| buffer.tail_since(LogSource::Stderr, since, max_lines).join("\n"))
            })
            .unwrap_or_default()
    }

    /// Renders every buffered entry of `backend_id`, one per line.
    pub fn export(&self, backend_id: &str) -> String {
        self.recent(backend_id, self.max_entries_per_backend)
            .iter()
            .map(|entry| self.formatter.format(entry))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&self, backend_id: &str) {
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.remove(backend_id);
        }
    }
}

impl Default for LogManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Default location of the audit trail.
pub fn default_audit_log_path() -> PathBuf {
    data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mcp-anywhere")
        .join("audit.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_redacted_and_buffered() {
        let manager = LogManager::new();
        manager.record("alpha", LogLevel::Info, LogSource::Stderr, "GITHUB_TOKEN=ghp_secret started");

        let logs = manager.recent("alpha", 10);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "GITHUB_TOKEN=[REDACTED] started");
        assert!(manager.recent("beta", 10).is_empty());
    }

    #[test]
    fn stderr_tail_only_contains_stderr_lines() {
        let manager = LogManager::new();
        let since = Utc::now() - chrono::Duration::seconds(1);
        manager.session_transition("alpha", 1, SessionState::Starting, SessionState::Running);
        manager.record("alpha", LogLevel::Warn, LogSource::Stderr, "Error: Cannot find module 'x'");

        assert_eq!(manager.stderr_tail("alpha", since, 20), "Error: Cannot find module 'x'");
        assert!(manager.export("alpha").contains("session 1: Starting -> Running"));
    }
}
