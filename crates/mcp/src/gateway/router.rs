//! The gateway router: one MCP server in front of many backends.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anywhere_types::BackendDescriptor;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, DescriptorStore, GatewaySettings};
use crate::gateway::middleware::{self, ListPlan};
use crate::gateway::{GatewayError, LocalTools, Route, RoutingError, RoutingSnapshot};
use crate::logging::LogManager;
use crate::protocol::{
    CapabilityKind, LATEST_PROTOCOL_VERSION, Notification, Request, Response, SUPPORTED_PROTOCOL_VERSIONS, list_result,
};
use crate::proxy::{ProxyHandle, ProxyOptions, ProxyPool};
use crate::sandbox::{ExecutionManager, SandboxRuntime};
use crate::transport::TransportError;

pub const SERVER_NAME: &str = "mcp-anywhere";

pub const INSTRUCTIONS: &str = "Use 'list_providers' to see available servers, then use tools/list with a provider \
                                parameter to see tools for a specific server. Call tools with their name and include \
                                the provider argument.";

/// What a refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub generation: u64,
    pub active: usize,
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

/// Routes client requests to backend proxies or gateway-local tools.
pub struct GatewayRouter {
    store: Arc<dyn DescriptorStore>,
    snapshot: RwLock<Arc<RoutingSnapshot>>,
    generation: AtomicU64,
    refresh_lock: tokio::sync::Mutex<()>,
    proxies: Arc<ProxyPool>,
    local: LocalTools,
    diagnostics: Arc<LogManager>,
    settings: GatewaySettings,
}

impl GatewayRouter {
    /// Builds the router and loads the first snapshot from `store`.
    pub async fn build(
        store: Arc<dyn DescriptorStore>,
        runtime: Arc<dyn SandboxRuntime>,
        settings: GatewaySettings,
        diagnostics: Arc<LogManager>,
    ) -> Result<Arc<Self>, ConfigError> {
        let manager = ExecutionManager::new(runtime, settings.lifecycle.clone(), Arc::clone(&diagnostics));
        let proxies = Arc::new(ProxyPool::new(
            manager.clone(),
            ProxyOptions {
                call_timeout: settings.call_timeout,
                startup_timeout: settings.startup_timeout,
                drain_grace: settings.lifecycle.shutdown_grace,
                stderr_tail_lines: settings.lifecycle.stderr_tail_lines,
                diagnostics: Arc::clone(&diagnostics),
            },
        ));
        let local = LocalTools::new(&manager, &settings);

        let router = Arc::new(Self {
            store,
            snapshot: RwLock::new(Arc::new(RoutingSnapshot::default())),
            generation: AtomicU64::new(0),
            refresh_lock: tokio::sync::Mutex::new(()),
            proxies,
            local,
            diagnostics,
            settings,
        });
        router.refresh().await?;
        Ok(router)
    }

    /// The routing table every decision in flight reads.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        let guard = self.snapshot.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn manager(&self) -> &ExecutionManager {
        self.proxies.manager()
    }

    pub fn diagnostics(&self) -> &Arc<LogManager> {
        &self.diagnostics
    }

    pub fn store_description(&self) -> String {
        self.store.describe()
    }

    /// Re-reads the store and swaps in a new snapshot.
    ///
    /// Proxies of removed or changed backends are dropped right away; their
    /// sessions are stopped after in-flight calls drain. New calls already
    /// see the new snapshot while that happens.
    pub async fn refresh(&self) -> Result<RefreshSummary, ConfigError> {
        let _refreshing = self.refresh_lock.lock().await;
        let descriptors = self.store.active_descriptors().await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let next = Arc::new(RoutingSnapshot::new(generation, descriptors.clone()));
        let previous = {
            let mut guard = self.snapshot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *guard, Arc::clone(&next))
        };

        let mut summary = RefreshSummary {
            generation,
            active: next.len(),
            ..RefreshSummary::default()
        };
        let previous_ids: HashSet<&str> = previous.ids().collect();
        for descriptor in next.descriptors() {
            match previous.get(&descriptor.id) {
                None => summary.added.push(descriptor.id.clone()),
                Some(old) if old != descriptor => summary.changed.push(descriptor.id.clone()),
                Some(_) => {}
            }
        }
        summary.removed = previous_ids
            .into_iter()
            .filter(|id| next.get(id).is_none())
            .map(str::to_string)
            .collect();
        summary.removed.sort();

        for id in summary.removed.iter().chain(&summary.changed) {
            self.proxies.evict(id).await;
        }
        let manager = self.manager();
        manager.refresh(&descriptors).await;
        for id in &summary.changed {
            manager.stop_backend(id).await;
        }

        if generation == 1 || !summary.added.is_empty() || !summary.changed.is_empty() || !summary.removed.is_empty() {
            info!(
                "Routing snapshot {}: {} active backend(s) from {} (added {:?}, changed {:?}, removed {:?})",
                generation,
                summary.active,
                self.store.describe(),
                summary.added,
                summary.changed,
                summary.removed
            );
        }
        Ok(summary)
    }

    /// Answers one client request. Never fails; errors become error responses.
    pub async fn handle_request(&self, request: Request, cancel: CancellationToken) -> Response {
        let Request { id, method, params, .. } = request;
        debug!("-> {} ({})", method, id);
        match self.dispatch(&method, params, &cancel).await {
            Ok(result) => Response::success(id, result),
            Err(error) => {
                if !matches!(error, GatewayError::Cancelled | GatewayError::MethodNotFound { .. }) {
                    warn!("{} ({}) failed: {}", method, id, error);
                }
                Response::failure(Some(id), error.to_error_object())
            }
        }
    }

    /// Accepts a client notification. Cancellation is handled by the server
    /// that owns the request tokens.
    pub async fn handle_notification(&self, notification: Notification) {
        match notification.method.as_str() {
            "notifications/initialized" => debug!("Client finished initialization"),
            "notifications/cancelled" => {}
            other => debug!("Ignoring client notification {}", other),
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>, cancel: &CancellationToken) -> Result<Value, GatewayError> {
        if let Some(kind) = CapabilityKind::ALL.into_iter().find(|kind| kind.list_method() == method) {
            return self.list(kind, params, cancel).await;
        }
        match method {
            "initialize" => Ok(initialize_result(params.as_ref())),
            "ping" | "logging/setLevel" => Ok(json!({})),
            "tools/call" => self.call(method, CapabilityKind::Tools, params, cancel).await,
            "resources/read" => self.call(method, CapabilityKind::Resources, params, cancel).await,
            "prompts/get" => self.call(method, CapabilityKind::Prompts, params, cancel).await,
            _ => Err(GatewayError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }

    async fn list(&self, kind: CapabilityKind, params: Option<Value>, cancel: &CancellationToken) -> Result<Value, GatewayError> {
        let mut params = params.unwrap_or(Value::Null);
        let provider = middleware::extract_provider(&mut params);
        let snapshot = self.snapshot();

        let entries = match middleware::plan_list(&snapshot, provider.as_deref()) {
            ListPlan::Local if kind == CapabilityKind::Tools => self.local.catalog(),
            ListPlan::Local | ListPlan::Empty => Vec::new(),
            ListPlan::Backend(descriptor) => match self.checkout(&descriptor, cancel).await {
                Ok(handle) => middleware::hide_disabled(
                    &descriptor,
                    kind,
                    middleware::strip_namespace(&descriptor.namespace_prefix(), kind, handle.namespaced_entries(kind)),
                ),
                Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
                Err(error) => {
                    warn!(backend = %descriptor.id, "Listing {} failed: {}", kind.items_key(), error);
                    Vec::new()
                }
            },
        };
        Ok(list_result(kind, entries))
    }

    async fn call(
        &self,
        method: &str,
        kind: CapabilityKind,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, GatewayError> {
        let mut params = match params {
            Some(params @ Value::Object(_)) => params,
            _ => return Err(GatewayError::invalid_params(format!("{method} requires an object of params"))),
        };
        let provider = middleware::extract_provider(&mut params);
        let name_key = kind.name_key();
        let name = params
            .get(name_key)
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::invalid_params(format!("{method} requires a '{name_key}' string")))?;
        let target = middleware::target_name(provider.as_deref(), name);

        let snapshot = self.snapshot();
        if let Some(provider) = provider.as_deref()
            && snapshot.get(provider).is_none()
        {
            return Err(RoutingError::UnknownProvider {
                provider: provider.to_string(),
            }
            .into());
        }

        match snapshot.route(&target) {
            Some(Route::Backend { descriptor, native }) => {
                if kind == CapabilityKind::Tools && descriptor.is_tool_disabled(&native) {
                    return Err(RoutingError::DisabledTool {
                        provider: descriptor.id.clone(),
                        name: native,
                    }
                    .into());
                }
                params[name_key] = Value::String(native);
                let handle = self.checkout(&descriptor, cancel).await?;
                match handle.forward(method, Some(params), cancel).await {
                    Ok(result) => Ok(result),
                    Err(error) => {
                        if !matches!(error, TransportError::Cancelled | TransportError::Remote(_)) {
                            self.diagnostics.call_failed(&descriptor.id, method, &error.to_string());
                        }
                        self.proxies.report_failure(&handle, &error).await;
                        Err(GatewayError::transport(&descriptor.id, error))
                    }
                }
            }
            Some(Route::Local(tool)) if kind == CapabilityKind::Tools => {
                let sessions = self.manager().sessions_snapshot();
                self.local
                    .call(tool, params.get("arguments"), &snapshot, &sessions, cancel)
                    .await
            }
            Some(Route::Local(_)) | None => Err(RoutingError::UnknownTarget { name: target }.into()),
        }
    }

    /// Checks out a proxy on a separate task so a cancelled caller never
    /// interrupts a session start other callers may be waiting on.
    async fn checkout(&self, descriptor: &Arc<BackendDescriptor>, cancel: &CancellationToken) -> Result<ProxyHandle, GatewayError> {
        let proxies = Arc::clone(&self.proxies);
        let descriptor = Arc::clone(descriptor);
        let checkout = tokio::spawn(async move { proxies.checkout(&descriptor).await });
        tokio::select! {
            joined = checkout => joined
                .map_err(|error| GatewayError::internal(format!("checkout task failed: {error}")))?
                .map_err(GatewayError::from),
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        }
    }

    /// Runs housekeeping and, when `refresh_interval` is set, periodic
    /// refreshes until `token` fires.
    pub fn spawn_maintenance(self: &Arc<Self>, refresh_interval: Option<Duration>, token: CancellationToken) -> JoinHandle<()> {
        let housekeeper = self
            .manager()
            .spawn_housekeeper(self.settings.lifecycle.housekeeping_interval, token.clone());
        let router = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(interval) = refresh_interval {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(error) = router.refresh().await {
                                warn!("Refresh failed, keeping snapshot {}: {}", router.snapshot().generation(), error);
                            }
                        }
                    }
                }
            }
            let _ = housekeeper.await;
        })
    }

    /// Closes every proxy and stops every session.
    pub async fn shutdown(&self) {
        info!("Shutting down gateway");
        self.proxies.close_all().await;
        self.manager().shutdown_all().await;
    }
}

fn initialize_result(params: Option<&Value>) -> Value {
    let requested = params
        .and_then(|params| params.get("protocolVersion"))
        .and_then(Value::as_str);
    let protocol_version = requested
        .filter(|version| SUPPORTED_PROTOCOL_VERSIONS.contains(version))
        .unwrap_or(LATEST_PROTOCOL_VERSION);
    json!({
        "protocolVersion": protocol_version,
        "capabilities": {
            "tools": { "listChanged": false },
            "resources": { "listChanged": false },
            "prompts": { "listChanged": false },
            "logging": {},
        },
        "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
        "instructions": INSTRUCTIONS,
    })
}
