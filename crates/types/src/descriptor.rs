//! Backend descriptors as read from the descriptor store.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::NAMESPACE_SEPARATOR;

/// Immutable description of one configured backend tool server.
///
/// A descriptor is a snapshot: the gateway reads it when building its routing
/// table and on refresh, and never writes it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackendDescriptor {
    /// Short unique identifier, also used as the namespace prefix.
    pub id: String,
    /// Human label, unique among active backends.
    pub name: String,
    /// Selects how the sandboxed session is constructed.
    #[serde(alias = "runtimeKind", alias = "runtimeType")]
    pub runtime: RuntimeKind,
    /// Optional command run once inside the environment before start.
    #[serde(default)]
    pub install_command: Option<String>,
    /// Command that starts the backend server.
    #[serde(default)]
    pub start_command: Option<String>,
    /// Ordered environment bindings injected into the session.
    #[serde(default, deserialize_with = "deserialize_env_bindings")]
    pub env: Vec<EnvBinding>,
    /// Inactive descriptors are excluded from routing on the next refresh.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Remote endpoint for HTTP or event-stream backends.
    #[serde(default)]
    pub endpoint: Option<RemoteEndpoint>,
    /// Optional free-form description shown by `list_providers`.
    #[serde(default)]
    pub description: Option<String>,
    /// Overrides the runtime kind's default image.
    #[serde(default)]
    pub image: Option<String>,
    /// Native tool names hidden from listings and refused when called.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_tools: Vec<String>,
}

fn default_active() -> bool {
    true
}

impl BackendDescriptor {
    /// Creates an active descriptor with no install step, bindings or endpoint.
    pub fn new(id: impl Into<String>, runtime: RuntimeKind, start_command: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            runtime,
            install_command: None,
            start_command: Some(start_command.into()),
            env: Vec::new(),
            active: true,
            endpoint: None,
            description: None,
            image: None,
            disabled_tools: Vec::new(),
        }
    }

    /// The prefix every capability of this backend carries at the gateway.
    pub fn namespace_prefix(&self) -> String {
        format!("{}{}", self.id, NAMESPACE_SEPARATOR)
    }

    /// Joins a native capability name onto this backend's namespace.
    pub fn namespaced(&self, native: &str) -> String {
        format!("{}{}", self.namespace_prefix(), native)
    }

    pub fn is_tool_disabled(&self, native: &str) -> bool {
        self.disabled_tools.iter().any(|tool| tool == native)
    }

    /// Whether a sandboxed session has to be started for this backend.
    pub fn needs_session(&self) -> bool {
        self.start_command.is_some()
    }

    /// Which adapter carries protocol traffic to this backend.
    pub fn wire_transport(&self) -> WireTransport {
        match &self.endpoint {
            None => WireTransport::Pipe,
            Some(endpoint) => match endpoint.transport {
                EndpointTransport::Http => WireTransport::Http,
                EndpointTransport::Sse => WireTransport::Sse,
            },
        }
    }
}

/// How a sandboxed session is constructed for a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuntimeKind {
    /// A Node.js process (`npx`, `node`).
    ProcessJs,
    /// A Python process (`uvx`, `python`).
    ProcessPy,
    /// A prebuilt container image whose entrypoint is the server.
    Container,
    /// A runtime name this build does not know how to run.
    Unsupported(String),
}

impl RuntimeKind {
    /// Canonical name used in configuration files and diagnostics.
    pub fn as_str(&self) -> &str {
        match self {
            RuntimeKind::ProcessJs => "process-js",
            RuntimeKind::ProcessPy => "process-py",
            RuntimeKind::Container => "container",
            RuntimeKind::Unsupported(name) => name,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, RuntimeKind::Unsupported(_))
    }
}

impl FromStr for RuntimeKind {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.trim().to_ascii_lowercase().as_str() {
            "process-js" | "npx" | "node" => RuntimeKind::ProcessJs,
            "process-py" | "uvx" | "python" => RuntimeKind::ProcessPy,
            "container" | "docker" => RuntimeKind::Container,
            _ => RuntimeKind::Unsupported(value.to_string()),
        })
    }
}

impl From<String> for RuntimeKind {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

impl From<RuntimeKind> for String {
    fn from(kind: RuntimeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One environment variable binding on a descriptor.
///
/// `value` may hold `${env:NAME}` placeholders that are resolved against the
/// gateway's environment when a session is acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnvBinding {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub required: bool,
}

impl EnvBinding {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            required: false,
        }
    }

    /// Marks the binding as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EnvBindingCollection {
    Sequence(Vec<EnvBinding>),
    Map(IndexMap<String, Option<String>>),
}

fn deserialize_env_bindings<'de, D>(deserializer: D) -> Result<Vec<EnvBinding>, D::Error>
where
    D: Deserializer<'de>,
{
    let maybe_collection = Option::<EnvBindingCollection>::deserialize(deserializer)?;
    let bindings = match maybe_collection {
        None => Vec::new(),
        Some(EnvBindingCollection::Sequence(items)) => items,
        Some(EnvBindingCollection::Map(map)) => map
            .into_iter()
            .map(|(key, value)| EnvBinding {
                key,
                value,
                required: false,
            })
            .collect(),
    };
    Ok(bindings)
}

/// Wire carrier for a remote backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointTransport {
    /// One POST per call.
    #[default]
    Http,
    /// POST for requests, responses pushed over a long-lived event stream.
    Sse,
}

/// Network location of a backend that speaks HTTP or SSE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RemoteEndpoint {
    pub url: Url,
    #[serde(default)]
    pub transport: EndpointTransport,
    /// Extra headers sent with every request; values may use `${env:NAME}`.
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// Event-stream subscription URL; defaults to `{url}/events`.
    #[serde(default)]
    pub events_url: Option<Url>,
}

/// Adapter variant chosen for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireTransport {
    Pipe,
    Http,
    Sse,
}

impl fmt::Display for WireTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireTransport::Pipe => write!(f, "stdio"),
            WireTransport::Http => write!(f, "http"),
            WireTransport::Sse => write!(f, "sse"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_descriptor_with_map_env() {
        let json = r#"{
            "id": "github",
            "name": "GitHub",
            "runtime": "npx",
            "startCommand": "npx -y @modelcontextprotocol/server-github",
            "env": { "GITHUB_TOKEN": "${env:GITHUB_TOKEN}", "EMPTY": null }
        }"#;

        let descriptor: BackendDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.runtime, RuntimeKind::ProcessJs);
        assert!(descriptor.active);
        assert_eq!(descriptor.env.len(), 2);
        assert_eq!(descriptor.env[0].key, "GITHUB_TOKEN");
        assert_eq!(descriptor.env[1].value, None);
        assert_eq!(descriptor.wire_transport(), WireTransport::Pipe);
    }

    #[test]
    fn deserializes_sequence_env_with_required_flag() {
        let yaml = r#"
id: search
name: Search
runtime: uvx
startCommand: uvx mcp-server-search
env:
  - key: API_KEY
    value: "${env:SEARCH_KEY}"
    required: true
"#;
        let descriptor: BackendDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(descriptor.runtime, RuntimeKind::ProcessPy);
        assert!(descriptor.env[0].required);
    }

    #[test]
    fn unknown_runtime_is_preserved_not_rejected() {
        let kind: RuntimeKind = "deno".parse().unwrap();
        assert_eq!(kind, RuntimeKind::Unsupported("deno".to_string()));
        assert!(!kind.is_supported());
        assert_eq!(String::from(RuntimeKind::Container), "container");
    }

    #[test]
    fn remote_endpoint_selects_transport() {
        let json = r#"{
            "id": "remote",
            "name": "Remote",
            "runtime": "container",
            "endpoint": { "url": "https://mcp.example.com/rpc", "transport": "sse" }
        }"#;
        let descriptor: BackendDescriptor = serde_json::from_str(json).unwrap();
        assert!(!descriptor.needs_session());
        assert_eq!(descriptor.wire_transport(), WireTransport::Sse);
    }

    #[test]
    fn disabled_tools_are_read_and_omitted_when_empty() {
        let json = r#"{"id":"a","name":"a","runtime":"npx","startCommand":"x","disabledTools":["delete_repo"]}"#;
        let descriptor: BackendDescriptor = serde_json::from_str(json).unwrap();
        assert!(descriptor.is_tool_disabled("delete_repo"));
        assert!(!descriptor.is_tool_disabled("create_issue"));

        let plain = BackendDescriptor::new("b", RuntimeKind::ProcessJs, "x");
        assert!(plain.disabled_tools.is_empty());
        assert!(!serde_json::to_string(&plain).unwrap().contains("disabledTools"));
    }

    #[test]
    fn namespacing_joins_with_single_underscore() {
        let descriptor = BackendDescriptor::new("alpha", RuntimeKind::ProcessJs, "node server.js");
        assert_eq!(descriptor.namespace_prefix(), "alpha_");
        assert_eq!(descriptor.namespaced("echo"), "alpha_echo");
    }

    #[test]
    fn rejects_unknown_fields() {
        let json = r#"{"id":"a","name":"a","runtime":"npx","startCommand":"x","bogus":1}"#;
        assert!(serde_json::from_str::<BackendDescriptor>(json).is_err());
    }
}
