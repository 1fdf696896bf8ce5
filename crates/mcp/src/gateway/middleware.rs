//! Discovery and routing policy.
//!
//! A pure function of the current snapshot and the incoming envelope:
//! `provider` is pulled out of the request, list calls are planned, and call
//! targets are rewritten to `{provider}_{name}` before dispatch.

use std::sync::Arc;

use anywhere_types::{BackendDescriptor, NAMESPACE_SEPARATOR};
use serde_json::Value;

use crate::gateway::RoutingSnapshot;
use crate::protocol::{CapabilityKind, entry_name};

const PROVIDER_KEY: &str = "provider";

/// Removes `provider` from `params` and from `params.arguments`.
///
/// A top-level value wins when both are present; both keys are always
/// removed so the backend never sees them.
pub fn extract_provider(params: &mut Value) -> Option<String> {
    let Value::Object(map) = params else {
        return None;
    };
    let top = map.remove(PROVIDER_KEY);
    let nested = match map.get_mut("arguments") {
        Some(Value::Object(arguments)) => arguments.remove(PROVIDER_KEY),
        _ => None,
    };
    top.or(nested)
        .and_then(|value| value.as_str().map(str::to_string))
        .filter(|provider| !provider.is_empty())
}

/// The name to dispatch: `{provider}_{name}` unless already prefixed.
pub fn target_name(provider: Option<&str>, name: &str) -> String {
    match provider {
        Some(provider) => {
            let prefix = format!("{provider}{NAMESPACE_SEPARATOR}");
            if name.starts_with(&prefix) {
                name.to_string()
            } else {
                format!("{prefix}{name}")
            }
        }
        None => name.to_string(),
    }
}

/// What a list call returns.
#[derive(Debug, Clone, PartialEq)]
pub enum ListPlan {
    /// No provider: gateway-local entries only.
    Local,
    /// The catalog of one active backend, unprefixed.
    Backend(Arc<BackendDescriptor>),
    /// Unknown or inactive provider.
    Empty,
}

pub fn plan_list(snapshot: &RoutingSnapshot, provider: Option<&str>) -> ListPlan {
    match provider {
        None => ListPlan::Local,
        Some(provider) => snapshot
            .get(provider)
            .map(|descriptor| ListPlan::Backend(Arc::clone(descriptor)))
            .unwrap_or(ListPlan::Empty),
    }
}

/// Strips `prefix` from every entry's name field.
pub fn strip_namespace(prefix: &str, kind: CapabilityKind, entries: Vec<Value>) -> Vec<Value> {
    entries
        .into_iter()
        .map(|mut entry| {
            let stripped = entry_name(kind, &entry)
                .and_then(|name| name.strip_prefix(prefix))
                .map(str::to_string);
            if let (Some(stripped), Value::Object(fields)) = (stripped, &mut entry) {
                fields.insert(kind.name_key().to_string(), Value::String(stripped));
            }
            entry
        })
        .collect()
}

/// Drops tools the descriptor disables. Entries must already be unprefixed.
pub fn hide_disabled(descriptor: &BackendDescriptor, kind: CapabilityKind, entries: Vec<Value>) -> Vec<Value> {
    if kind != CapabilityKind::Tools || descriptor.disabled_tools.is_empty() {
        return entries;
    }
    entries
        .into_iter()
        .filter(|entry| !entry_name(kind, entry).is_some_and(|name| descriptor.is_tool_disabled(name)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anywhere_types::RuntimeKind;
    use serde_json::json;

    #[test]
    fn disabled_tools_are_hidden_from_tool_listings_only() {
        let mut descriptor = BackendDescriptor::new("alpha", RuntimeKind::ProcessJs, "npx server");
        descriptor.disabled_tools = vec!["slow".to_string()];
        let tools = vec![json!({"name": "echo"}), json!({"name": "slow"})];
        assert_eq!(
            hide_disabled(&descriptor, CapabilityKind::Tools, tools),
            vec![json!({"name": "echo"})]
        );

        let prompts = vec![json!({"name": "slow"})];
        assert_eq!(hide_disabled(&descriptor, CapabilityKind::Prompts, prompts.clone()), prompts);
    }

    #[test]
    fn provider_is_removed_from_both_places() {
        let mut params = json!({"name": "echo", "provider": "alpha", "arguments": {"provider": "beta", "text": "hi"}});
        assert_eq!(extract_provider(&mut params).as_deref(), Some("alpha"));
        assert_eq!(params, json!({"name": "echo", "arguments": {"text": "hi"}}));

        let mut params = json!({"name": "echo", "arguments": {"provider": "alpha", "text": "hi"}});
        assert_eq!(extract_provider(&mut params).as_deref(), Some("alpha"));
        assert_eq!(params["arguments"], json!({"text": "hi"}));

        let mut params = json!({"name": "list_providers"});
        assert_eq!(extract_provider(&mut params), None);
    }

    #[test]
    fn target_is_prefixed_once() {
        assert_eq!(target_name(Some("alpha"), "echo"), "alpha_echo");
        assert_eq!(target_name(Some("alpha"), "alpha_echo"), "alpha_echo");
        assert_eq!(target_name(None, "python_sandbox"), "python_sandbox");
    }

    #[test]
    fn list_plans() {
        let snapshot = RoutingSnapshot::new(1, vec![BackendDescriptor::new("alpha", RuntimeKind::ProcessJs, "a")]);
        assert_eq!(plan_list(&snapshot, None), ListPlan::Local);
        assert!(matches!(plan_list(&snapshot, Some("alpha")), ListPlan::Backend(_)));
        assert_eq!(plan_list(&snapshot, Some("nonexistent")), ListPlan::Empty);
    }

    #[test]
    fn strips_resource_uris() {
        let entries = vec![json!({"uri": "alpha_file:///tmp/a", "name": "a"})];
        let stripped = strip_namespace("alpha_", CapabilityKind::Resources, entries);
        assert_eq!(stripped[0]["uri"], "file:///tmp/a");
        assert_eq!(stripped[0]["name"], "a");
    }
}
