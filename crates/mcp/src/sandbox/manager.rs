//! Execution lifecycle manager.
//!
//! Turns descriptors into running sessions, reuses them while they are
//! healthy and not idle-expired, and guarantees every session reaches
//! `Stopped`. `acquire`, `shutdown` and `refresh` are serialized per backend
//! id through one async mutex per backend, so concurrent callers of a cold
//! backend share a single start while other backends proceed in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anywhere_types::{BackendDescriptor, SessionState};
use chrono::Utc;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LifecycleSettings, resolve_env_bindings};
use crate::logging::{LogLevel, LogManager, LogSource};
use crate::sandbox::runtime::{stop_process, tail_lines};
use crate::sandbox::{
    Environment, LaunchSpec, LifecycleError, SandboxRuntime, SandboxSession, SessionIo, StartPhase, WorkerPool,
};
use crate::transport::spawn_stderr_pump;

#[derive(Default)]
struct Slot {
    session: Option<Arc<SandboxSession>>,
}

type SlotHandle = Arc<tokio::sync::Mutex<Slot>>;

struct ManagerInner {
    runtime: Arc<dyn SandboxRuntime>,
    pool: WorkerPool,
    settings: LifecycleSettings,
    diagnostics: Arc<LogManager>,
    slots: Mutex<HashMap<String, SlotHandle>>,
    next_session_id: AtomicU64,
    shut_down: AtomicBool,
}

/// Point-in-time view of one live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub backend_id: String,
    pub session_id: u64,
    pub state: SessionState,
    pub leases: usize,
    pub idle_for: Duration,
}

/// Owns every sandboxed session of the gateway. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionManager {
    inner: Arc<ManagerInner>,
}

impl ExecutionManager {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, settings: LifecycleSettings, diagnostics: Arc<LogManager>) -> Self {
        let pool = WorkerPool::new(settings.worker_threads);
        Self {
            inner: Arc::new(ManagerInner {
                runtime,
                pool,
                settings,
                diagnostics,
                slots: Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn runtime(&self) -> Arc<dyn SandboxRuntime> {
        Arc::clone(&self.inner.runtime)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.inner.settings
    }

    pub fn diagnostics(&self) -> &Arc<LogManager> {
        &self.inner.diagnostics
    }

    fn slot(&self, backend_id: &str) -> SlotHandle {
        let mut slots = self.inner.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(slots.entry(backend_id.to_string()).or_default())
    }

    fn existing_slots(&self) -> Vec<(String, SlotHandle)> {
        let slots = self.inner.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.iter().map(|(id, slot)| (id.clone(), Arc::clone(slot))).collect()
    }

    fn transition(&self, session: &SandboxSession, from: SessionState, to: SessionState) {
        if from != to {
            self.inner
                .diagnostics
                .session_transition(session.backend_id(), session.id(), from, to);
        }
    }

    /// Returns a running session for `descriptor`, starting one if needed.
    ///
    /// The caller holds a lease until it calls [`ExecutionManager::release`].
    pub async fn acquire(&self, descriptor: &BackendDescriptor) -> Result<Arc<SandboxSession>, LifecycleError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(LifecycleError::ShutDown);
        }

        let slot = self.slot(&descriptor.id);
        let mut guard = slot.lock().await;

        if let Some(session) = guard.session.clone() {
            let expired = session.is_idle_expired(self.inner.settings.idle_timeout);
            if session.state().is_reusable() && !expired && session.probe_alive() {
                let previous = session.begin_use();
                self.transition(&session, previous, SessionState::Running);
                return Ok(session);
            }

            guard.session = None;
            if expired {
                debug!(target: "sandbox", backend = %descriptor.id, "Idle session expired; starting a fresh one");
            } else {
                warn!(target: "sandbox", backend = %descriptor.id, "Session {} is not healthy; replacing it", session.id());
                let previous = session.mark(SessionState::Failed);
                self.transition(&session, previous, SessionState::Failed);
            }
            self.stop_session(&session).await;
        }

        self.ensure_capacity(&descriptor.id).await;

        let session = self.start_session(descriptor).await?;
        let previous = session.begin_use();
        self.transition(&session, previous, SessionState::Running);
        guard.session = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Returns a lease. The session stays alive for reuse.
    pub fn release(&self, session: &Arc<SandboxSession>) {
        let before = session.state();
        let after = session.end_use();
        self.transition(session, before, after);

        if after == SessionState::Idle && !self.inner.settings.reuse_sessions {
            let manager = self.clone();
            let session = Arc::clone(session);
            tokio::spawn(async move { manager.shutdown(&session).await });
        }
    }

    /// Acquires a session wrapped in a guard that releases it on drop.
    pub async fn lease(&self, descriptor: &BackendDescriptor) -> Result<SessionLease, LifecycleError> {
        let session = self.acquire(descriptor).await?;
        Ok(SessionLease {
            manager: self.clone(),
            session,
        })
    }

    /// Stops `session` and forgets it. Idempotent.
    pub async fn shutdown(&self, session: &Arc<SandboxSession>) {
        let slot = self.slot(session.backend_id());
        {
            let mut guard = slot.lock().await;
            if guard
                .session
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                guard.session = None;
            }
        }
        self.stop_session(session).await;
    }

    /// Marks a session whose process died or whose pipes broke; it is stopped
    /// and the next `acquire` builds a replacement.
    pub async fn mark_failed(&self, session: &Arc<SandboxSession>) {
        let previous = session.mark(SessionState::Failed);
        if previous != SessionState::Failed && previous != SessionState::Stopped && previous != SessionState::Stopping {
            self.transition(session, previous, SessionState::Failed);
        }
        self.shutdown(session).await;
    }

    /// Stops every session whose backend is not in `active`.
    pub async fn refresh(&self, active: &[BackendDescriptor]) -> usize {
        let active_ids: HashSet<&str> = active.iter().map(|descriptor| descriptor.id.as_str()).collect();
        let stale: Vec<String> = self
            .existing_slots()
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| !active_ids.contains(id.as_str()))
            .collect();

        let stopped = join_all(stale.iter().map(|id| self.stop_backend(id))).await;
        let count = stopped.into_iter().filter(|stopped| *stopped).count();
        if count > 0 {
            info!(target: "sandbox", "Refresh stopped {} session(s)", count);
        }
        count
    }

    /// Stops the session of `backend_id`, letting in-flight leases drain for
    /// up to the shutdown grace period. Returns whether a session was stopped.
    pub async fn stop_backend(&self, backend_id: &str) -> bool {
        let slot = self.slot(backend_id);
        let session = {
            let mut guard = slot.lock().await;
            guard.session.take()
        };

        let Some(session) = session else {
            return false;
        };

        let deadline = Instant::now() + self.inner.settings.shutdown_grace;
        while session.leases() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        self.stop_session(&session).await;
        true
    }

    /// Evicts idle-expired and dead sessions. Returns how many were stopped.
    pub async fn housekeeping(&self) -> usize {
        let mut evicted = 0;
        for (backend_id, slot) in self.existing_slots() {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            let Some(session) = guard.session.clone() else {
                continue;
            };

            let expired = session.is_idle_expired(self.inner.settings.idle_timeout);
            let dead = session.state().is_reusable() && !session.probe_alive();
            if !expired && !dead {
                continue;
            }

            guard.session = None;
            drop(guard);
            if dead {
                warn!(target: "sandbox", backend = %backend_id, "Session {} exited unexpectedly", session.id());
                let previous = session.mark(SessionState::Failed);
                self.transition(&session, previous, SessionState::Failed);
            } else {
                debug!(target: "sandbox", backend = %backend_id, "Evicting idle session {}", session.id());
            }
            self.stop_session(&session).await;
            evicted += 1;
        }
        evicted
    }

    /// Runs [`ExecutionManager::housekeeping`] every `interval` until `token` fires.
    pub fn spawn_housekeeper(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.housekeeping().await;
                    }
                }
            }
        })
    }

    /// Stops every session and refuses further work.
    pub async fn shutdown_all(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<String> = self.existing_slots().into_iter().map(|(id, _)| id).collect();
        join_all(ids.iter().map(|id| self.stop_backend(id))).await;
        self.inner.pool.close();
        info!(target: "sandbox", "All sessions stopped");
    }

    pub fn sessions_snapshot(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .existing_slots()
            .into_iter()
            .filter_map(|(_, slot)| {
                let guard = slot.try_lock().ok()?;
                let session = guard.session.as_ref()?;
                Some(SessionSummary {
                    backend_id: session.backend_id().to_string(),
                    session_id: session.id(),
                    state: session.state(),
                    leases: session.leases(),
                    idle_for: session.idle_for(),
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        summaries
    }

    /// Current session of `backend_id`, without taking a lease.
    pub async fn current_session(&self, backend_id: &str) -> Option<Arc<SandboxSession>> {
        let slot = self.slot(backend_id);
        let guard = slot.lock().await;
        guard.session.clone()
    }

    async fn ensure_capacity(&self, acquiring: &str) {
        let Some(max_sessions) = self.inner.settings.max_sessions else {
            return;
        };

        let mut live = 0;
        let mut candidate: Option<(SlotHandle, Arc<SandboxSession>)> = None;
        for (backend_id, slot) in self.existing_slots() {
            if backend_id == acquiring {
                continue;
            }
            let Ok(guard) = slot.try_lock() else {
                live += 1;
                continue;
            };
            let Some(session) = guard.session.clone() else {
                continue;
            };
            live += 1;
            if session.state() == SessionState::Idle
                && session.leases() == 0
                && candidate
                    .as_ref()
                    .is_none_or(|(_, current)| session.last_activity() < current.last_activity())
            {
                drop(guard);
                candidate = Some((slot, session));
            }
        }

        if live < max_sessions {
            return;
        }
        let Some((slot, session)) = candidate else {
            warn!(target: "sandbox", "Session limit {} reached with no idle session to evict", max_sessions);
            return;
        };

        {
            let mut guard = slot.lock().await;
            if !guard
                .session
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &session) && current.leases() == 0)
            {
                return;
            }
            guard.session = None;
        }
        info!(target: "sandbox", backend = %session.backend_id(), "Evicting least recently used session for capacity");
        self.stop_session(&session).await;
    }

    async fn start_session(&self, descriptor: &BackendDescriptor) -> Result<Arc<SandboxSession>, LifecycleError> {
        let backend_id = descriptor.id.as_str();
        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        let started_at = Utc::now();
        let diagnostics = &self.inner.diagnostics;
        diagnostics.session_transition(backend_id, session_id, SessionState::Stopped, SessionState::Starting);

        let outcome = self.construct(descriptor, session_id, started_at).await;
        match outcome {
            Ok(session) => Ok(session),
            Err(error) => {
                diagnostics.session_transition(backend_id, session_id, SessionState::Starting, SessionState::Failed);
                diagnostics.call_failed(backend_id, "acquire", &error.to_string());
                Err(error)
            }
        }
    }

    async fn construct(
        &self,
        descriptor: &BackendDescriptor,
        session_id: u64,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<Arc<SandboxSession>, LifecycleError> {
        let backend_id = descriptor.id.as_str();
        let env = resolve_env_bindings(&descriptor.env)
            .map_err(|error| LifecycleError::configuration(backend_id, error.to_string()))?;
        if !descriptor.runtime.is_supported() {
            return Err(LifecycleError::configuration(
                backend_id,
                format!("unknown runtime kind '{}'", descriptor.runtime),
            ));
        }
        let Some(start_command) = descriptor.start_command.clone() else {
            return Err(LifecycleError::configuration(backend_id, "no start command"));
        };

        let spec = LaunchSpec {
            backend_id: backend_id.to_string(),
            runtime: descriptor.runtime.clone(),
            image: descriptor.image.clone(),
            env,
            ephemeral: false,
        };
        let runtime = self.runtime();
        let environment = self
            .inner
            .pool
            .run(move || runtime.provision(&spec))
            .await?
            .map_err(|error| LifecycleError::backend_start(backend_id, StartPhase::Provision, error.to_string(), ""))?;

        if let Some(install_command) = descriptor.install_command.as_deref().filter(|command| !command.trim().is_empty())
            && let Err(error) = self.install(&environment, install_command).await
        {
            self.teardown(&environment).await;
            return Err(error);
        }

        let runtime = self.runtime();
        let launch_environment = environment.clone();
        let launched = match self
            .inner
            .pool
            .run(move || runtime.launch(&launch_environment, &start_command))
            .await
        {
            Ok(Ok(launched)) => launched,
            Ok(Err(error)) => {
                self.teardown(&environment).await;
                return Err(LifecycleError::backend_start(backend_id, StartPhase::Launch, error.to_string(), ""));
            }
            Err(error) => {
                self.teardown(&environment).await;
                return Err(error);
            }
        };

        let session = Arc::new(SandboxSession::new(
            session_id,
            environment,
            launched.control,
            SessionIo {
                stdin: launched.stdin,
                stdout: launched.stdout,
            },
            started_at,
        ));
        if let Some(stderr) = launched.stderr {
            let pump = spawn_stderr_pump(backend_id.to_string(), stderr, Arc::clone(&self.inner.diagnostics));
            session.attach_stderr_pump(pump);
        }
        info!(target: "sandbox", backend = %backend_id, "Started session {} ({})", session_id, self.inner.runtime.name());
        Ok(session)
    }

    /// Runs the install command; after a failure clears the package cache and
    /// tries exactly once more.
    async fn install(&self, environment: &Environment, install_command: &str) -> Result<(), LifecycleError> {
        let backend_id = environment.backend_id.clone();
        let tail = self.inner.settings.stderr_tail_lines;

        let first = self.execute(environment, install_command).await?;
        let first_error = match first {
            Ok(outcome) if outcome.success() => return Ok(()),
            Ok(outcome) => format!("exit code {}: {}", outcome.exit_code, tail_lines(&outcome.stderr, tail)),
            Err(error) => error.to_string(),
        };
        warn!(target: "sandbox", backend = %backend_id, "Install failed ({}); clearing cache and retrying", first_error);
        self.inner
            .diagnostics
            .record(&backend_id, LogLevel::Warn, LogSource::Gateway, format!("install failed: {first_error}"));

        let runtime = self.runtime();
        let cache_environment = environment.clone();
        if let Err(error) = self.inner.pool.run(move || runtime.clear_cache(&cache_environment)).await? {
            debug!(target: "sandbox", backend = %backend_id, "Cache clear failed: {}", error);
        }

        match self.execute(environment, install_command).await? {
            Ok(outcome) if outcome.success() => Ok(()),
            Ok(outcome) => Err(LifecycleError::backend_start(
                &backend_id,
                StartPhase::Install,
                format!("install command exited with code {}", outcome.exit_code),
                tail_lines(&outcome.stderr, tail),
            )),
            Err(error) => Err(LifecycleError::backend_start(
                &backend_id,
                StartPhase::Install,
                error.to_string(),
                "",
            )),
        }
    }

    async fn execute(
        &self,
        environment: &Environment,
        command: &str,
    ) -> Result<Result<crate::sandbox::ExecOutcome, crate::sandbox::RuntimeError>, LifecycleError> {
        let runtime = self.runtime();
        let environment = environment.clone();
        let command = command.to_string();
        self.inner
            .pool
            .run(move || runtime.execute(&environment, &command, None))
            .await
    }

    async fn teardown(&self, environment: &Environment) {
        let runtime = self.runtime();
        let environment = environment.clone();
        match self.inner.pool.run(move || runtime.teardown(&environment)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(target: "sandbox", "Teardown failed: {}", error),
            Err(error) => warn!(target: "sandbox", "Teardown not run: {}", error),
        }
    }

    /// Stopping → Stopped for one session. Idempotent.
    async fn stop_session(&self, session: &Arc<SandboxSession>) {
        let Some(previous) = session.begin_stop() else {
            return;
        };
        self.transition(session, previous, SessionState::Stopping);

        let control = session.take_control();
        let grace = self.inner.settings.shutdown_grace;
        let runtime = self.runtime();
        let environment = session.environment().clone();
        let outcome = self
            .inner
            .pool
            .run(move || {
                if let Some(mut control) = control {
                    stop_process(control.as_mut(), grace);
                }
                runtime.teardown(&environment)
            })
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(target: "sandbox", backend = %session.backend_id(), "Teardown failed: {}", error),
            Err(LifecycleError::ShutDown) => {
                debug!(target: "sandbox", backend = %session.backend_id(), "Worker pool closed; process dropped without teardown");
            }
            Err(error) => warn!(target: "sandbox", backend = %session.backend_id(), "Stop failed: {}", error),
        }

        session.abort_stderr_pump();
        session.mark(SessionState::Stopped);
        self.transition(session, SessionState::Stopping, SessionState::Stopped);
        info!(target: "sandbox", backend = %session.backend_id(), "Stopped session {}", session.id());
    }
}

/// A held session, released when dropped.
pub struct SessionLease {
    manager: ExecutionManager,
    session: Arc<SandboxSession>,
}

impl SessionLease {
    pub fn session(&self) -> &Arc<SandboxSession> {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.manager.release(&self.session);
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease").field("session", &self.session).finish()
    }
}
