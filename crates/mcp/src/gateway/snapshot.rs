//! Immutable routing table built from one read of the descriptor store.

use std::collections::HashMap;
use std::sync::Arc;

use anywhere_types::{BackendDescriptor, NAMESPACE_SEPARATOR};

use crate::gateway::LocalTool;

/// Where a namespaced name resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// A backend capability; `native` is the name the backend itself uses.
    Backend {
        descriptor: Arc<BackendDescriptor>,
        native: String,
    },
    Local(LocalTool),
}

/// Active backends at one point in time.
///
/// Every routing decision reads one snapshot; a refresh swaps in a new one
/// while calls already dispatched keep the descriptor they resolved.
#[derive(Debug, Default)]
pub struct RoutingSnapshot {
    generation: u64,
    descriptors: Vec<Arc<BackendDescriptor>>,
    by_id: HashMap<String, Arc<BackendDescriptor>>,
}

impl RoutingSnapshot {
    pub fn new(generation: u64, descriptors: Vec<BackendDescriptor>) -> Self {
        let descriptors: Vec<Arc<BackendDescriptor>> = descriptors
            .into_iter()
            .filter(|descriptor| descriptor.active)
            .map(Arc::new)
            .collect();
        let by_id = descriptors
            .iter()
            .map(|descriptor| (descriptor.id.clone(), Arc::clone(descriptor)))
            .collect();
        Self {
            generation,
            descriptors,
            by_id,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Active descriptors in store order.
    pub fn descriptors(&self) -> &[Arc<BackendDescriptor>] {
        &self.descriptors
    }

    pub fn get(&self, backend_id: &str) -> Option<&Arc<BackendDescriptor>> {
        self.by_id.get(backend_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(|descriptor| descriptor.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Resolves a possibly-namespaced name. Backend prefixes win over local
    /// tools; backend ids never contain the separator, so the first
    /// separator splits id from native name.
    pub fn route(&self, name: &str) -> Option<Route> {
        if let Some((prefix, native)) = name.split_once(NAMESPACE_SEPARATOR)
            && !native.is_empty()
            && let Some(descriptor) = self.by_id.get(prefix)
        {
            return Some(Route::Backend {
                descriptor: Arc::clone(descriptor),
                native: native.to_string(),
            });
        }
        LocalTool::from_name(name).map(Route::Local)
    }
}
