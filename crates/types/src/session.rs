//! Lifecycle states of a sandboxed execution session.

use serde::{Deserialize, Serialize};

/// State of a sandboxed execution session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Environment is being provisioned, installed or launched.
    Starting,
    /// At least one caller holds the session.
    Running,
    /// No caller holds the session; it is kept for reuse.
    Idle,
    /// Termination is in progress.
    Stopping,
    /// Process and environment have been released.
    Stopped,
    /// Start failed or the process died; never reused.
    Failed,
}

impl SessionState {
    /// Get the display text for this state.
    pub fn display(&self) -> &'static str {
        match self {
            SessionState::Starting => "Starting",
            SessionState::Running => "Running",
            SessionState::Idle => "Idle",
            SessionState::Stopping => "Stopping",
            SessionState::Stopped => "Stopped",
            SessionState::Failed => "Failed",
        }
    }

    /// Whether a caller may be handed this session.
    pub fn is_reusable(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::Idle)
    }

    /// Whether the session is in a transitional state.
    pub fn is_transitional(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Stopping)
    }

    /// Whether a stop sequence may begin from this state.
    pub fn can_stop(&self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Running | SessionState::Idle | SessionState::Failed
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_and_idle_are_reusable() {
        assert!(SessionState::Running.is_reusable());
        assert!(SessionState::Idle.is_reusable());
        assert!(!SessionState::Failed.is_reusable());
        assert!(!SessionState::Starting.is_reusable());
    }

    #[test]
    fn stopped_and_stopping_cannot_stop_again() {
        assert!(!SessionState::Stopped.can_stop());
        assert!(!SessionState::Stopping.can_stop());
        assert!(SessionState::Failed.can_stop());
    }
}
