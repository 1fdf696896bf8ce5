//! Live proxies keyed by backend id.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anywhere_types::BackendDescriptor;
use tracing::{debug, warn};

use crate::logging::LogManager;
use crate::proxy::{BackendProxy, ProxyError};
use crate::sandbox::{ExecutionManager, LifecycleError, SandboxSession, SessionLease, StartPhase};
use crate::transport::{TransportError, TransportOptions};

type ProxySlot = Arc<tokio::sync::Mutex<Option<Arc<BackendProxy>>>>;

#[derive(Clone)]
pub struct ProxyOptions {
    pub call_timeout: Duration,
    /// Bound on connecting an adapter and completing the handshake.
    pub startup_timeout: Duration,
    /// How long a retired proxy waits for in-flight calls before closing.
    pub drain_grace: Duration,
    pub stderr_tail_lines: usize,
    pub diagnostics: Arc<LogManager>,
}

/// A proxy checked out for one call, holding the session lease if any.
pub struct ProxyHandle {
    proxy: Arc<BackendProxy>,
    lease: Option<SessionLease>,
}

impl ProxyHandle {
    pub fn proxy(&self) -> &Arc<BackendProxy> {
        &self.proxy
    }

    pub fn session(&self) -> Option<&Arc<SandboxSession>> {
        self.lease.as_ref().map(SessionLease::session)
    }
}

impl Deref for ProxyHandle {
    type Target = BackendProxy;

    fn deref(&self) -> &Self::Target {
        &self.proxy
    }
}

/// Builds proxies on demand and keeps at most one per backend.
///
/// A proxy is bound to the session it was built on; when the manager hands
/// out a different session the proxy is rebuilt. Lock order is proxy slot
/// first, then the manager's backend slot.
pub struct ProxyPool {
    manager: ExecutionManager,
    slots: Mutex<HashMap<String, ProxySlot>>,
    options: ProxyOptions,
}

impl ProxyPool {
    pub fn new(manager: ExecutionManager, options: ProxyOptions) -> Self {
        Self {
            manager,
            slots: Mutex::new(HashMap::new()),
            options,
        }
    }

    pub fn manager(&self) -> &ExecutionManager {
        &self.manager
    }

    fn slot(&self, backend_id: &str) -> ProxySlot {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(slots.entry(backend_id.to_string()).or_default())
    }

    /// Returns a live proxy for `descriptor`, starting its session if needed.
    pub async fn checkout(&self, descriptor: &Arc<BackendDescriptor>) -> Result<ProxyHandle, LifecycleError> {
        let slot = self.slot(&descriptor.id);
        let mut guard = slot.lock().await;

        if !descriptor.needs_session() {
            if let Some(proxy) = guard.as_ref().filter(|proxy| proxy.is_open()) {
                return Ok(ProxyHandle {
                    proxy: Arc::clone(proxy),
                    lease: None,
                });
            }
            if let Some(stale) = guard.take() {
                self.retire(stale);
            }
            let proxy = self.connect(descriptor, None).await?;
            *guard = Some(Arc::clone(&proxy));
            return Ok(ProxyHandle { proxy, lease: None });
        }

        for _ in 0..2 {
            let lease = self.manager.lease(descriptor).await?;
            let session = Arc::clone(lease.session());

            if let Some(proxy) = guard.as_ref() {
                if proxy.session_id() == Some(session.id()) {
                    if proxy.is_open() {
                        return Ok(ProxyHandle {
                            proxy: Arc::clone(proxy),
                            lease: Some(lease),
                        });
                    }
                    warn!(backend = %descriptor.id, "Transport closed while session {} is alive; restarting", session.id());
                    if let Some(stale) = guard.take() {
                        self.retire(stale);
                    }
                    self.manager.mark_failed(&session).await;
                    continue;
                }
                if let Some(stale) = guard.take() {
                    self.retire(stale);
                }
            }

            return match self.connect(descriptor, Some(&session)).await {
                Ok(proxy) => {
                    *guard = Some(Arc::clone(&proxy));
                    Ok(ProxyHandle {
                        proxy,
                        lease: Some(lease),
                    })
                }
                Err(error) => {
                    self.manager.mark_failed(&session).await;
                    Err(error)
                }
            };
        }

        Err(LifecycleError::backend_start(
            &descriptor.id,
            StartPhase::Handshake,
            "session pipes closed repeatedly",
            "",
        ))
    }

    async fn connect(
        &self,
        descriptor: &Arc<BackendDescriptor>,
        session: Option<&Arc<SandboxSession>>,
    ) -> Result<Arc<BackendProxy>, LifecycleError> {
        let transport_options = TransportOptions {
            call_timeout: self.options.call_timeout,
            diagnostics: Some(Arc::clone(&self.options.diagnostics)),
        };
        let connecting = BackendProxy::connect(Arc::clone(descriptor), session.map(|session| &**session), &transport_options);
        let outcome = tokio::time::timeout(self.options.startup_timeout, connecting).await;

        let stderr_tail = || {
            session
                .map(|session| {
                    self.options
                        .diagnostics
                        .stderr_tail(&descriptor.id, session.started_at(), self.options.stderr_tail_lines)
                })
                .unwrap_or_default()
        };
        let error = match outcome {
            Ok(Ok(proxy)) => return Ok(Arc::new(proxy)),
            Ok(Err(ProxyError::Headers(error))) => LifecycleError::configuration(&descriptor.id, error.to_string()),
            Ok(Err(error)) => LifecycleError::backend_start(&descriptor.id, StartPhase::Handshake, error.to_string(), stderr_tail()),
            Err(_) => LifecycleError::backend_start(
                &descriptor.id,
                StartPhase::Handshake,
                format!("handshake did not finish within {}s", self.options.startup_timeout.as_secs()),
                stderr_tail(),
            ),
        };
        self.options.diagnostics.call_failed(&descriptor.id, "initialize", &error.to_string());
        Err(error)
    }

    /// Closes `proxy` once in-flight calls have finished or the grace ends.
    fn retire(&self, proxy: Arc<BackendProxy>) {
        let grace = self.options.drain_grace;
        tokio::spawn(async move {
            let deadline = Instant::now() + grace;
            while Arc::strong_count(&proxy) > 1 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            debug!(backend = %proxy.descriptor().id, "Closing retired proxy");
            proxy.close().await;
        });
    }

    /// Drops the proxy of `backend_id`; in-flight calls keep their handle.
    pub async fn evict(&self, backend_id: &str) {
        let slot = self.slot(backend_id);
        let stale = slot.lock().await.take();
        if let Some(stale) = stale {
            self.retire(stale);
        }
    }

    /// Drops `proxy` if it is still the current one for its backend.
    pub async fn invalidate(&self, proxy: &Arc<BackendProxy>) {
        let slot = self.slot(&proxy.descriptor().id);
        let mut guard = slot.lock().await;
        if guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, proxy)) {
            if let Some(stale) = guard.take() {
                self.retire(stale);
            }
        }
    }

    /// Handles an adapter failure: when the process is confirmed dead or the
    /// transport closed, the proxy and session are discarded.
    pub async fn report_failure(&self, handle: &ProxyHandle, error: &TransportError) {
        if !matches!(
            error,
            TransportError::Timeout { .. } | TransportError::Io { .. } | TransportError::Closed
        ) {
            return;
        }
        let dead = handle.session().is_some_and(|session| !session.probe_alive());
        if !dead && handle.proxy.is_open() {
            return;
        }

        warn!(backend = %handle.proxy.descriptor().id, "Backend is gone ({}); discarding proxy", error);
        self.invalidate(&handle.proxy).await;
        if let Some(session) = handle.session() {
            self.manager.mark_failed(session).await;
        }
    }

    /// Closes every proxy immediately.
    pub async fn close_all(&self) {
        let slots: Vec<ProxySlot> = {
            let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            if let Some(proxy) = slot.lock().await.take() {
                proxy.close().await;
            }
        }
    }
}
