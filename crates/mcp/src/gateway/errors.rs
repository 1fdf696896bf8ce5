//! Gateway error taxonomy and its JSON-RPC mapping.

use serde_json::{Value, json};
use thiserror::Error;

use crate::protocol::{ErrorObject, codes};
use crate::sandbox::LifecycleError;
use crate::transport::TransportError;

/// A name or provider that resolves to nothing in the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("Unknown provider '{provider}'")]
    UnknownProvider { provider: String },

    #[error("No backend or gateway tool matches '{name}'")]
    UnknownTarget { name: String },

    #[error("Tool '{name}' is disabled for provider '{provider}'")]
    DisabledTool { provider: String, name: String },
}

/// Everything a request can fail with once it reaches the router.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Backend '{backend_id}': {source}")]
    Transport {
        backend_id: String,
        #[source]
        source: TransportError,
    },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        GatewayError::InvalidParams { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        GatewayError::Internal { message: message.into() }
    }

    pub fn transport(backend_id: &str, source: TransportError) -> Self {
        GatewayError::Transport {
            backend_id: backend_id.to_string(),
            source,
        }
    }

    /// Stable kind string carried in `error.data.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Routing(_) => "routing",
            GatewayError::Lifecycle(LifecycleError::Configuration { .. }) => "configuration",
            GatewayError::Lifecycle(LifecycleError::BackendStart { .. }) => "backend_start",
            GatewayError::Lifecycle(_) => "internal",
            GatewayError::Transport { source, .. } => match source {
                TransportError::Timeout { .. } => "timeout",
                TransportError::Cancelled => "cancelled",
                TransportError::Remote(_) => "backend",
                _ => "transport",
            },
            GatewayError::InvalidParams { .. } => "invalid_params",
            GatewayError::MethodNotFound { .. } => "method_not_found",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Internal { .. } => "internal",
        }
    }

    /// Maps the error onto a response `error` object.
    ///
    /// Errors a backend returned itself pass through untouched.
    pub fn to_error_object(&self) -> ErrorObject {
        let kind = self.kind();
        match self {
            GatewayError::Routing(_) => ErrorObject::new(codes::ROUTING_ERROR, self.to_string()).with_data(json!({ "kind": kind })),
            GatewayError::Lifecycle(LifecycleError::Configuration { backend_id, .. }) => {
                ErrorObject::new(codes::CONFIGURATION_ERROR, self.to_string())
                    .with_data(json!({ "kind": kind, "backend": backend_id }))
            }
            GatewayError::Lifecycle(LifecycleError::BackendStart {
                backend_id,
                phase,
                stderr_tail,
                ..
            }) => {
                let mut data = json!({ "kind": kind, "backend": backend_id, "phase": phase.as_str() });
                if !stderr_tail.is_empty() {
                    data["stderrTail"] = Value::String(stderr_tail.clone());
                }
                ErrorObject::new(codes::BACKEND_START_ERROR, self.to_string()).with_data(data)
            }
            GatewayError::Lifecycle(_) => ErrorObject::internal(self.to_string()).with_data(json!({ "kind": kind })),
            GatewayError::Transport { backend_id, source } => {
                let code = match source {
                    TransportError::Remote(remote) => return remote.clone(),
                    TransportError::Timeout { .. } => codes::TRANSPORT_TIMEOUT,
                    TransportError::Cancelled => codes::REQUEST_CANCELLED,
                    _ => codes::TRANSPORT_IO,
                };
                ErrorObject::new(code, self.to_string()).with_data(json!({ "kind": kind, "backend": backend_id }))
            }
            GatewayError::InvalidParams { message } => ErrorObject::invalid_params(message.clone()),
            GatewayError::MethodNotFound { method } => ErrorObject::method_not_found(method),
            GatewayError::Cancelled => ErrorObject::new(codes::REQUEST_CANCELLED, self.to_string()).with_data(json!({ "kind": kind })),
            GatewayError::Internal { .. } => ErrorObject::internal(self.to_string()).with_data(json!({ "kind": kind })),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sandbox::StartPhase;

    #[test]
    fn routing_errors_use_the_routing_code() {
        let error = GatewayError::from(RoutingError::UnknownProvider {
            provider: "nonexistent".into(),
        });
        let object = error.to_error_object();
        assert_eq!(object.code, codes::ROUTING_ERROR);
        assert!(object.message.contains("nonexistent"));
        assert_eq!(object.data.unwrap()["kind"], "routing");
    }

    #[test]
    fn backend_start_carries_phase_and_stderr() {
        let error = GatewayError::from(LifecycleError::backend_start(
            "alpha",
            StartPhase::Install,
            "npm install exited with 1",
            "npm ERR! 404",
        ));
        let object = error.to_error_object();
        assert_eq!(object.code, codes::BACKEND_START_ERROR);
        let data = object.data.unwrap();
        assert_eq!(data["backend"], "alpha");
        assert_eq!(data["phase"], "install");
        assert_eq!(data["stderrTail"], "npm ERR! 404");
    }

    #[test]
    fn transport_errors_map_by_variant() {
        let timeout = GatewayError::transport(
            "alpha",
            TransportError::Timeout {
                method: "tools/call".into(),
                timeout: Duration::from_secs(60),
            },
        );
        assert_eq!(timeout.to_error_object().code, codes::TRANSPORT_TIMEOUT);
        assert_eq!(GatewayError::transport("alpha", TransportError::Closed).to_error_object().code, codes::TRANSPORT_IO);
        assert_eq!(
            GatewayError::transport("alpha", TransportError::Cancelled).to_error_object().code,
            codes::REQUEST_CANCELLED
        );
    }

    #[test]
    fn remote_errors_pass_through() {
        let remote = ErrorObject::new(-32000, "disk full").with_data(json!({"path": "/tmp"}));
        let error = GatewayError::transport("alpha", TransportError::Remote(remote.clone()));
        assert_eq!(error.to_error_object(), remote);
    }

    #[test]
    fn configuration_errors_name_the_backend() {
        let error = GatewayError::from(LifecycleError::configuration("alpha", "missing variable API_TOKEN"));
        let object = error.to_error_object();
        assert_eq!(object.code, codes::CONFIGURATION_ERROR);
        assert_eq!(object.data.unwrap()["backend"], "alpha");
    }
}
