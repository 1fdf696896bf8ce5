//! Capability catalogs discovered from a backend.

use indexmap::IndexMap;
use serde_json::{Map, Value};

/// The listable capability families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tools,
    Resources,
    ResourceTemplates,
    Prompts,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 4] = [
        CapabilityKind::Tools,
        CapabilityKind::Resources,
        CapabilityKind::ResourceTemplates,
        CapabilityKind::Prompts,
    ];

    /// Method used to list this family.
    pub fn list_method(self) -> &'static str {
        match self {
            CapabilityKind::Tools => "tools/list",
            CapabilityKind::Resources => "resources/list",
            CapabilityKind::ResourceTemplates => "resources/templates/list",
            CapabilityKind::Prompts => "prompts/list",
        }
    }

    /// Key of the array in a list result.
    pub fn items_key(self) -> &'static str {
        match self {
            CapabilityKind::Tools => "tools",
            CapabilityKind::Resources => "resources",
            CapabilityKind::ResourceTemplates => "resourceTemplates",
            CapabilityKind::Prompts => "prompts",
        }
    }

    /// Field holding an entry's identifying name.
    pub fn name_key(self) -> &'static str {
        match self {
            CapabilityKind::Tools | CapabilityKind::Prompts => "name",
            CapabilityKind::Resources => "uri",
            CapabilityKind::ResourceTemplates => "uriTemplate",
        }
    }

    /// Key under `capabilities` a server sets to advertise this family.
    pub fn capability_key(self) -> &'static str {
        match self {
            CapabilityKind::Tools => "tools",
            CapabilityKind::Resources | CapabilityKind::ResourceTemplates => "resources",
            CapabilityKind::Prompts => "prompts",
        }
    }
}

/// Returns the identifying name of a catalog entry.
pub fn entry_name(kind: CapabilityKind, entry: &Value) -> Option<&str> {
    entry.get(kind.name_key()).and_then(Value::as_str)
}

/// Tools, resources and prompts reported by one backend, keyed by the
/// unprefixed name the backend itself uses.
#[derive(Debug, Clone, Default)]
pub struct BackendCatalog {
    tools: IndexMap<String, Value>,
    resources: IndexMap<String, Value>,
    resource_templates: IndexMap<String, Value>,
    prompts: IndexMap<String, Value>,
}

impl BackendCatalog {
    fn family(&self, kind: CapabilityKind) -> &IndexMap<String, Value> {
        match kind {
            CapabilityKind::Tools => &self.tools,
            CapabilityKind::Resources => &self.resources,
            CapabilityKind::ResourceTemplates => &self.resource_templates,
            CapabilityKind::Prompts => &self.prompts,
        }
    }

    fn family_mut(&mut self, kind: CapabilityKind) -> &mut IndexMap<String, Value> {
        match kind {
            CapabilityKind::Tools => &mut self.tools,
            CapabilityKind::Resources => &mut self.resources,
            CapabilityKind::ResourceTemplates => &mut self.resource_templates,
            CapabilityKind::Prompts => &mut self.prompts,
        }
    }

    /// Adds an entry; entries without a name are dropped and reported back.
    pub fn insert(&mut self, kind: CapabilityKind, entry: Value) -> bool {
        let Some(name) = entry_name(kind, &entry).map(str::to_string) else {
            return false;
        };
        self.family_mut(kind).insert(name, entry);
        true
    }

    pub fn get(&self, kind: CapabilityKind, name: &str) -> Option<&Value> {
        self.family(kind).get(name)
    }

    pub fn names(&self, kind: CapabilityKind) -> impl Iterator<Item = &str> {
        self.family(kind).keys().map(String::as_str)
    }

    pub fn len(&self, kind: CapabilityKind) -> usize {
        self.family(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        CapabilityKind::ALL.iter().all(|kind| self.family(*kind).is_empty())
    }

    /// Entries of one family with their names joined onto `prefix`.
    pub fn namespaced(&self, kind: CapabilityKind, prefix: &str) -> Vec<Value> {
        self.family(kind)
            .iter()
            .map(|(name, entry)| {
                let mut entry = entry.clone();
                if let Value::Object(fields) = &mut entry {
                    fields.insert(kind.name_key().to_string(), Value::String(format!("{prefix}{name}")));
                }
                entry
            })
            .collect()
    }
}

/// Builds a list result object `{ "<items_key>": entries }`.
pub(crate) fn list_result(kind: CapabilityKind, entries: Vec<Value>) -> Value {
    let mut result = Map::new();
    result.insert(kind.items_key().to_string(), Value::Array(entries));
    Value::Object(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn namespacing_rewrites_only_the_name_field() {
        let mut catalog = BackendCatalog::default();
        catalog.insert(CapabilityKind::Tools, json!({"name": "echo", "description": "Echo"}));
        catalog.insert(CapabilityKind::Resources, json!({"uri": "file:///a", "name": "a"}));

        let tools = catalog.namespaced(CapabilityKind::Tools, "alpha_");
        assert_eq!(tools[0]["name"], "alpha_echo");
        assert_eq!(tools[0]["description"], "Echo");

        let resources = catalog.namespaced(CapabilityKind::Resources, "alpha_");
        assert_eq!(resources[0]["uri"], "alpha_file:///a");
        assert_eq!(resources[0]["name"], "a");
    }

    #[test]
    fn nameless_entries_are_rejected() {
        let mut catalog = BackendCatalog::default();
        assert!(!catalog.insert(CapabilityKind::Prompts, json!({"description": "no name"})));
        assert!(catalog.is_empty());
    }
}
