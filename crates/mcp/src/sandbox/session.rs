//! A live sandboxed execution session.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anywhere_types::{RuntimeKind, SessionState};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tokio::task::JoinHandle;

use crate::sandbox::{Environment, ProcessControl};
use crate::transport::{BoxedReader, BoxedWriter};

/// The pipes a pipe adapter binds to. Taken exactly once.
pub struct SessionIo {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
}

struct Activity {
    state: SessionState,
    last_activity: Instant,
    leases: usize,
}

/// One isolated process or container backing a backend.
///
/// Shared as `Arc<SandboxSession>` between the manager and every caller that
/// currently holds a lease on it. The state is `Running` while any lease is
/// out and `Idle` once the last one is released.
pub struct SandboxSession {
    id: u64,
    backend_id: String,
    runtime: RuntimeKind,
    resolved_env: IndexMap<String, String>,
    environment: Environment,
    started_at: DateTime<Utc>,
    activity: Mutex<Activity>,
    control: Mutex<Option<Box<dyn ProcessControl>>>,
    io: Mutex<Option<SessionIo>>,
    stderr_pump: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SandboxSession {
    pub(crate) fn new(
        id: u64,
        environment: Environment,
        control: Box<dyn ProcessControl>,
        io: SessionIo,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            backend_id: environment.backend_id.clone(),
            runtime: environment.runtime.clone(),
            resolved_env: environment.env.clone(),
            environment,
            started_at,
            activity: Mutex::new(Activity {
                state: SessionState::Starting,
                last_activity: Instant::now(),
                leases: 0,
            }),
            control: Mutex::new(Some(control)),
            io: Mutex::new(Some(io)),
            stderr_pump: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn runtime(&self) -> &RuntimeKind {
        &self.runtime
    }

    pub fn resolved_env(&self) -> &IndexMap<String, String> {
        &self.resolved_env
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        lock(&self.activity).state
    }

    pub fn leases(&self) -> usize {
        lock(&self.activity).leases
    }

    pub fn last_activity(&self) -> Instant {
        lock(&self.activity).last_activity
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Idle with no lease out for longer than `threshold`.
    pub fn is_idle_expired(&self, threshold: Duration) -> bool {
        let activity = lock(&self.activity);
        activity.state == SessionState::Idle && activity.leases == 0 && activity.last_activity.elapsed() > threshold
    }

    /// Health probe: whether the server process is still running.
    pub fn probe_alive(&self) -> bool {
        lock(&self.control).as_mut().is_some_and(|control| control.is_alive())
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.control).as_ref().and_then(|control| control.pid())
    }

    /// Hands the server's stdin/stdout to a pipe adapter.
    pub fn take_io(&self) -> Option<SessionIo> {
        lock(&self.io).take()
    }

    pub(crate) fn attach_stderr_pump(&self, handle: JoinHandle<()>) {
        *lock(&self.stderr_pump) = Some(handle);
    }

    /// Takes a lease; returns the state before the transition.
    pub(crate) fn begin_use(&self) -> SessionState {
        let mut activity = lock(&self.activity);
        let previous = activity.state;
        activity.leases += 1;
        activity.state = SessionState::Running;
        activity.last_activity = Instant::now();
        previous
    }

    /// Returns a lease; the session becomes `Idle` once none are left.
    pub(crate) fn end_use(&self) -> SessionState {
        let mut activity = lock(&self.activity);
        activity.leases = activity.leases.saturating_sub(1);
        activity.last_activity = Instant::now();
        if activity.leases == 0 && activity.state == SessionState::Running {
            activity.state = SessionState::Idle;
        }
        activity.state
    }

    pub(crate) fn mark(&self, state: SessionState) -> SessionState {
        let mut activity = lock(&self.activity);
        std::mem::replace(&mut activity.state, state)
    }

    /// Moves to `Stopping` unless a stop is already underway or done.
    pub(crate) fn begin_stop(&self) -> Option<SessionState> {
        let mut activity = lock(&self.activity);
        if !activity.state.can_stop() {
            return None;
        }
        Some(std::mem::replace(&mut activity.state, SessionState::Stopping))
    }

    pub(crate) fn take_control(&self) -> Option<Box<dyn ProcessControl>> {
        lock(&self.control).take()
    }

    pub(crate) fn abort_stderr_pump(&self) {
        if let Some(handle) = lock(&self.stderr_pump).take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSession")
            .field("id", &self.id)
            .field("backend_id", &self.backend_id)
            .field("runtime", &self.runtime)
            .field("state", &self.state())
            .field("leases", &self.leases())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::RuntimeError;

    struct AlwaysAlive;

    impl ProcessControl for AlwaysAlive {
        fn is_alive(&mut self) -> bool {
            true
        }
        fn pid(&self) -> Option<u32> {
            None
        }
        fn terminate(&mut self) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn kill(&mut self) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    fn session() -> SandboxSession {
        let environment = Environment {
            backend_id: "alpha".into(),
            runtime: RuntimeKind::ProcessJs,
            reference: "mcp-alpha".into(),
            image: None,
            env: IndexMap::new(),
            owned: true,
            ephemeral: false,
        };
        let (a, b) = tokio::io::duplex(16);
        SandboxSession::new(
            1,
            environment,
            Box::new(AlwaysAlive),
            SessionIo {
                stdin: Box::new(a),
                stdout: Box::new(b),
            },
            Utc::now(),
        )
    }

    #[test]
    fn leases_drive_running_and_idle() {
        let session = session();
        assert_eq!(session.begin_use(), SessionState::Starting);
        assert_eq!(session.begin_use(), SessionState::Running);
        assert_eq!(session.end_use(), SessionState::Running);
        assert_eq!(session.end_use(), SessionState::Idle);
        assert!(!session.is_idle_expired(Duration::from_secs(60)));
        assert!(session.is_idle_expired(Duration::ZERO));
    }

    #[test]
    fn stop_is_entered_once() {
        let session = session();
        session.begin_use();
        assert_eq!(session.begin_stop(), Some(SessionState::Running));
        assert_eq!(session.begin_stop(), None);
    }

    #[test]
    fn io_is_taken_once() {
        let session = session();
        assert!(session.take_io().is_some());
        assert!(session.take_io().is_none());
    }
}
