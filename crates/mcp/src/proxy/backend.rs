use std::sync::Arc;

use anywhere_types::{BackendDescriptor, WireTransport};
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{InterpolationError, resolve_headers};
use crate::protocol::{BackendCatalog, CapabilityKind, LATEST_PROTOCOL_VERSION};
use crate::proxy::CLIENT_NAME;
use crate::sandbox::SandboxSession;
use crate::transport::{
    HttpTransport, SseTransport, StdioTransport, Transport, TransportError, TransportOptions, build_headers,
    call_with_retry,
};

/// Upper bound on pages fetched per capability family.
const MAX_LIST_PAGES: usize = 100;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Handshake failed: {0}")]
    Handshake(#[from] TransportError),

    #[error("Header interpolation failed: {0}")]
    Headers(#[from] InterpolationError),

    #[error("{message}")]
    Setup { message: String },
}

/// Wraps one adapter and the capability catalog obtained at construction.
///
/// The catalog is cached for the proxy's lifetime; a new session means a new
/// proxy.
pub struct BackendProxy {
    descriptor: Arc<BackendDescriptor>,
    transport: Box<dyn Transport>,
    catalog: BackendCatalog,
    server_info: Value,
    session_id: Option<u64>,
}

impl BackendProxy {
    /// Connects the adapter matching the descriptor and performs the handshake.
    pub async fn connect(
        descriptor: Arc<BackendDescriptor>,
        session: Option<&SandboxSession>,
        options: &TransportOptions,
    ) -> Result<Self, ProxyError> {
        let transport = open_transport(&descriptor, session, options).await?;
        let cancel = CancellationToken::new();

        match handshake(transport.as_ref(), &cancel).await {
            Ok((server_info, catalog)) => {
                info!(
                    backend = %descriptor.id,
                    "Connected over {} with {} tool(s)",
                    transport.kind(),
                    catalog.len(CapabilityKind::Tools)
                );
                Ok(Self {
                    descriptor,
                    transport,
                    catalog,
                    server_info,
                    session_id: session.map(SandboxSession::id),
                })
            }
            Err(error) => {
                transport.close().await;
                Err(error.into())
            }
        }
    }

    pub fn descriptor(&self) -> &Arc<BackendDescriptor> {
        &self.descriptor
    }

    pub fn catalog(&self) -> &BackendCatalog {
        &self.catalog
    }

    /// The backend's `initialize` result.
    pub fn server_info(&self) -> &Value {
        &self.server_info
    }

    /// Id of the session this proxy is bound to; `None` for remote backends.
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Catalog entries of one family with names carrying the namespace prefix.
    pub fn namespaced_entries(&self, kind: CapabilityKind) -> Vec<Value> {
        self.catalog.namespaced(kind, &self.descriptor.namespace_prefix())
    }

    /// Forwards a call unchanged.
    pub async fn forward(&self, method: &str, params: Option<Value>, cancel: &CancellationToken) -> Result<Value, TransportError> {
        self.transport.call(method, params, cancel).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.transport.notify(method, params).await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }
}

async fn open_transport(
    descriptor: &BackendDescriptor,
    session: Option<&SandboxSession>,
    options: &TransportOptions,
) -> Result<Box<dyn Transport>, ProxyError> {
    match (descriptor.wire_transport(), &descriptor.endpoint) {
        (WireTransport::Pipe, _) => {
            let session = session.ok_or_else(|| ProxyError::Setup {
                message: "pipe transport requires a running session".to_string(),
            })?;
            let io = session.take_io().ok_or_else(|| ProxyError::Setup {
                message: format!("pipes of session {} are already bound", session.id()),
            })?;
            Ok(Box::new(StdioTransport::connect(
                descriptor.id.clone(),
                io.stdout,
                io.stdin,
                options.clone(),
            )))
        }
        (WireTransport::Http, Some(endpoint)) => {
            let headers = build_headers(&resolve_headers(&endpoint.headers)?);
            let transport = HttpTransport::new(descriptor.id.clone(), endpoint.url.clone(), headers, options.clone())?;
            Ok(Box::new(transport))
        }
        (WireTransport::Sse, Some(endpoint)) => {
            let headers = build_headers(&resolve_headers(&endpoint.headers)?);
            let transport = SseTransport::connect(
                descriptor.id.clone(),
                endpoint.url.clone(),
                endpoint.events_url.clone(),
                headers,
                options.clone(),
            )
            .await?;
            Ok(Box::new(transport))
        }
        (_, None) => Err(ProxyError::Setup {
            message: "remote transport requires an endpoint".to_string(),
        }),
    }
}

async fn handshake(transport: &dyn Transport, cancel: &CancellationToken) -> Result<(Value, BackendCatalog), TransportError> {
    let params = json!({
        "protocolVersion": LATEST_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": { "name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION") },
    });
    let server_info = call_with_retry(transport, "initialize", Some(params), cancel).await?;
    transport.notify("notifications/initialized", None).await?;

    let capabilities = server_info.get("capabilities");
    let mut catalog = BackendCatalog::default();
    for kind in CapabilityKind::ALL {
        if !advertises(capabilities, kind) {
            continue;
        }
        for entry in list_all(transport, kind, cancel).await? {
            if !catalog.insert(kind, entry) {
                debug!("Dropping unnamed {} entry", kind.items_key());
            }
        }
    }
    Ok((server_info, catalog))
}

/// Servers that omit `capabilities` are assumed to offer tools only.
fn advertises(capabilities: Option<&Value>, kind: CapabilityKind) -> bool {
    match capabilities.and_then(Value::as_object) {
        Some(map) => map.contains_key(kind.capability_key()),
        None => kind == CapabilityKind::Tools,
    }
}

async fn list_all(transport: &dyn Transport, kind: CapabilityKind, cancel: &CancellationToken) -> Result<Vec<Value>, TransportError> {
    let mut entries = Vec::new();
    let mut cursor: Option<String> = None;
    for _ in 0..MAX_LIST_PAGES {
        let params = cursor.as_ref().map(|cursor| json!({ "cursor": cursor }));
        let page = match transport.call(kind.list_method(), params, cancel).await {
            Ok(page) => page,
            Err(error) if error.is_method_not_found() => return Ok(entries),
            Err(error) => return Err(error),
        };
        if let Some(items) = page.get(kind.items_key()).and_then(Value::as_array) {
            entries.extend(items.iter().cloned());
        }
        cursor = page.get("nextCursor").and_then(Value::as_str).map(str::to_string);
        if cursor.is_none() {
            break;
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_capabilities() {
        let capabilities = json!({"tools": {}, "resources": {"subscribe": true}});
        assert!(advertises(Some(&capabilities), CapabilityKind::Tools));
        assert!(advertises(Some(&capabilities), CapabilityKind::ResourceTemplates));
        assert!(!advertises(Some(&capabilities), CapabilityKind::Prompts));
        assert!(advertises(None, CapabilityKind::Tools));
        assert!(!advertises(None, CapabilityKind::Resources));
    }
}
