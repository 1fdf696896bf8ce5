//! HTTP host for the gateway.
//!
//! Clients are told apart by `Mcp-Session-Id`, issued in reply to
//! `initialize`. Cancellation notices only reach requests of the same
//! session; a request without a session id sits in a scope of its own.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::gateway::GatewayRouter;
use crate::server::{InFlight, handle_payload};

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8000";
pub const DEFAULT_MOUNT_PATH: &str = "/mcp";

const SESSION_HEADER: &str = "mcp-session-id";

/// Host configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct HttpServerOptions {
    pub bind_address: SocketAddr,
    pub mount_path: String,
    /// When set, requests must carry it as a bearer token or `X-API-Key`.
    pub api_key: Option<String>,
}

#[derive(Clone)]
struct AppState {
    router: Arc<GatewayRouter>,
    clients: Arc<ClientScopes>,
    api_key: Option<Arc<str>>,
    shutdown: CancellationToken,
}

pub struct GatewayHttpServer {
    router: Arc<GatewayRouter>,
    options: HttpServerOptions,
}

impl GatewayHttpServer {
    pub fn new(router: Arc<GatewayRouter>, options: HttpServerOptions) -> Self {
        Self { router, options }
    }

    /// Binds the listener and serves in the background.
    pub async fn start(self) -> Result<RunningGatewayHttpServer> {
        let cancellation_token = CancellationToken::new();
        let state = AppState {
            router: Arc::clone(&self.router),
            clients: Arc::new(ClientScopes::default()),
            api_key: self.options.api_key.as_deref().map(Arc::from),
            shutdown: cancellation_token.child_token(),
        };

        let mount = normalize_mount_path(&self.options.mount_path);
        let mut app = Router::new().route("/health", get(handle_health));
        app = if mount == "/" {
            app.route("/", post(handle_post))
        } else {
            app.route(&mount, post(handle_post))
                .route(&format!("{mount}/"), post(handle_post))
        };
        let app = app.with_state(state);

        let listener = tokio::net::TcpListener::bind(self.options.bind_address).await?;
        let bound_address = listener.local_addr()?;
        info!("Gateway listening on http://{}{}", bound_address, mount);

        let server_handle = tokio::spawn({
            let shutdown = cancellation_token.child_token();
            async move {
                if let Err(error) = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        shutdown.cancelled().await;
                    })
                    .await
                {
                    warn!("HTTP server stopped with error: {}", error);
                }
            }
        });

        Ok(RunningGatewayHttpServer {
            bind_address: bound_address,
            cancellation_token,
            server_handle,
        })
    }
}

/// Runtime handle for a running HTTP server.
#[derive(Debug)]
pub struct RunningGatewayHttpServer {
    bind_address: SocketAddr,
    cancellation_token: CancellationToken,
    server_handle: JoinHandle<()>,
}

impl RunningGatewayHttpServer {
    pub fn bound_address(&self) -> SocketAddr {
        self.bind_address
    }

    /// Cancels in-flight requests, stops accepting and waits for the server task.
    pub async fn stop(self) -> Result<()> {
        self.cancellation_token.cancel();
        self.server_handle
            .await
            .map_err(|error| anyhow!("HTTP server task failed: {error}"))?;
        Ok(())
    }
}

async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.router.snapshot();
    Json(json!({
        "status": "ok",
        "generation": snapshot.generation(),
        "backends": snapshot.len(),
        "sessions": state.router.manager().sessions_snapshot().len(),
        "inFlight": state.clients.in_flight(),
        "clientSessions": state.clients.len(),
    }))
}

async fn handle_post(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    if let Some(expected) = state.api_key.as_deref()
        && !is_authorized(&headers, expected)
    {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing or invalid API key" })),
        )
            .into_response();
    }

    let session = headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let issued = match session {
        None if requests_initialize(&body) => Some(state.clients.issue()),
        _ => None,
    };
    let scope = state.clients.enter(session.as_deref().or(issued.as_deref()));

    // The handler future is dropped when the client disconnects; the guard
    // then cancels the spawned work so backends see the cancellation.
    let request_token = state.shutdown.child_token();
    let _disconnect = request_token.clone().drop_guard();
    let task = tokio::spawn({
        let router = Arc::clone(&state.router);
        async move { handle_payload(&router, &scope.in_flight, &body, &request_token).await }
    });

    let mut response = match task.await {
        Ok(Some(reply)) => (StatusCode::OK, Json(reply)).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(error) => {
            warn!("Request task failed: {}", error);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if let Some(session) = issued
        && let Ok(value) = HeaderValue::from_str(&session)
    {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn requests_initialize(body: &str) -> bool {
    let is_initialize = |message: &Value| message.get("method").and_then(Value::as_str) == Some("initialize");
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => items.iter().any(is_initialize),
        Ok(message) => is_initialize(&message),
        Err(_) => false,
    }
}

/// In-flight requests grouped per client session.
#[derive(Debug, Default)]
struct ClientScopes {
    scopes: Mutex<HashMap<String, (Arc<InFlight>, usize)>>,
    issued: AtomicU64,
}

impl ClientScopes {
    /// Mints a new session id.
    fn issue(&self) -> String {
        let sequence = self.issued.fetch_add(1, Ordering::Relaxed);
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("{nanos:x}-{sequence:x}")
    }

    /// Joins the scope of `session`, or a fresh anonymous scope without one.
    /// The scope lives while any request holds it.
    fn enter(self: &Arc<Self>, session: Option<&str>) -> ClientScope {
        let key = match session {
            Some(session) => format!("session:{session}"),
            None => format!("anonymous:{}", self.issue()),
        };
        let mut scopes = self.scopes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (in_flight, holders) = scopes.entry(key.clone()).or_insert_with(|| (InFlight::new(), 0));
        *holders += 1;
        ClientScope {
            in_flight: Arc::clone(in_flight),
            owner: Arc::clone(self),
            key,
        }
    }

    fn leave(&self, key: &str) {
        let mut scopes = self.scopes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((_, holders)) = scopes.get_mut(key) {
            *holders -= 1;
            if *holders == 0 {
                scopes.remove(key);
            }
        }
    }

    fn len(&self) -> usize {
        self.scopes.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    fn in_flight(&self) -> usize {
        let scopes = self.scopes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        scopes.values().map(|(in_flight, _)| in_flight.len()).sum()
    }
}

struct ClientScope {
    in_flight: Arc<InFlight>,
    owner: Arc<ClientScopes>,
    key: String,
}

impl Drop for ClientScope {
    fn drop(&mut self) {
        self.owner.leave(&self.key);
    }
}

fn is_authorized(headers: &HeaderMap, expected: &str) -> bool {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim);
    bearer == Some(expected) || api_key == Some(expected)
}

fn normalize_mount_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Resolves the bind address; non-loopback addresses need `allow_remote`.
pub fn resolve_bind_address(bind_address: Option<&str>, allow_remote: bool) -> Result<SocketAddr> {
    let address = bind_address.unwrap_or(DEFAULT_BIND_ADDRESS);
    let parsed: SocketAddr = address
        .parse()
        .map_err(|error| anyhow!("invalid bind address '{address}': {error}"))?;
    if !allow_remote && !is_loopback(parsed.ip()) {
        return Err(anyhow!(
            "refusing to bind to non-loopback address {parsed} without --allow-remote"
        ));
    }
    Ok(parsed)
}

fn is_loopback(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(ip) => ip.is_loopback(),
        IpAddr::V6(ip) => ip.is_loopback(),
    }
}
