//! Plugin Registry
//!
//! Authoritative map of plugin id to handle. Exactly one handle exists per
//! live id; the map lock is never held across plugin calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{PluginError, PluginResult};
use crate::plugin::handle::{PluginHandle, PluginSnapshot};
use crate::plugin::metadata::{Capabilities, PluginId};
use crate::plugin::state::PluginState;

/// Registry for loaded plugin handles
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<BTreeMap<PluginId, Arc<PluginHandle>>>,
}

impl PluginRegistry {
    /// Create a new plugin registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle; fails if the id is already present
    pub fn insert(&self, handle: Arc<PluginHandle>) -> PluginResult<()> {
        let mut plugins = self.plugins.write();
        let id = handle.id().to_string();
        if plugins.contains_key(&id) {
            return Err(PluginError::already_loaded(&id));
        }
        plugins.insert(id, handle);
        Ok(())
    }

    /// Swap the handle for an existing id, returning the previous one
    pub fn replace(&self, handle: Arc<PluginHandle>) -> Option<Arc<PluginHandle>> {
        self.plugins.write().insert(handle.id().to_string(), handle)
    }

    pub fn remove(&self, id: &str) -> PluginResult<Arc<PluginHandle>> {
        self.plugins
            .write()
            .remove(id)
            .ok_or_else(|| PluginError::not_loaded(id))
    }

    pub fn get(&self, id: &str) -> Option<Arc<PluginHandle>> {
        self.plugins.read().get(id).cloned()
    }

    /// Get a handle or fail with `NotLoaded`
    pub fn require(&self, id: &str) -> PluginResult<Arc<PluginHandle>> {
        self.get(id).ok_or_else(|| PluginError::not_loaded(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.read().contains_key(id)
    }

    /// Registered ids in sorted order
    pub fn ids(&self) -> Vec<PluginId> {
        self.plugins.read().keys().cloned().collect()
    }

    /// All handles in id order
    pub fn handles(&self) -> Vec<Arc<PluginHandle>> {
        self.plugins.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    /// Current state of a plugin, if registered
    pub fn state_of(&self, id: &str) -> Option<PluginState> {
        self.plugins.read().get(id).map(|h| h.state())
    }

    pub fn ids_in_state(&self, state: PluginState) -> Vec<PluginId> {
        self.plugins
            .read()
            .values()
            .filter(|h| h.state() == state)
            .map(|h| h.id().to_string())
            .collect()
    }

    /// Plugins declaring every bit in `capabilities`
    pub fn ids_with_capability(&self, capabilities: Capabilities) -> Vec<PluginId> {
        self.plugins
            .read()
            .values()
            .filter(|h| h.metadata().capabilities.contains(capabilities))
            .map(|h| h.id().to_string())
            .collect()
    }

    /// Registered plugins that declare `id` as a required dependency
    pub fn dependents_of(&self, id: &str) -> Vec<PluginId> {
        self.plugins
            .read()
            .values()
            .filter(|h| h.metadata().dependencies.iter().any(|d| d.id == id))
            .map(|h| h.id().to_string())
            .collect()
    }

    pub fn snapshot(&self, id: &str) -> Option<PluginSnapshot> {
        self.get(id).map(|h| h.snapshot())
    }

    /// Count of plugins per state
    pub fn state_counts(&self) -> BTreeMap<PluginState, usize> {
        let mut counts = BTreeMap::new();
        for handle in self.plugins.read().values() {
            *counts.entry(handle.state()).or_insert(0) += 1;
        }
        counts
    }
}

/// Thread-safe shared registry
pub type SharedPluginRegistry = Arc<PluginRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::plugin::tests::mock_plugins::{mock_handle, MockPlugin};

    #[test]
    fn test_insert_and_lookup() {
        let registry = PluginRegistry::new();
        registry.insert(mock_handle(MockPlugin::new("b"))).unwrap();
        registry.insert(mock_handle(MockPlugin::new("a"))).unwrap();
        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert!(registry.contains("a"));
        assert_eq!(registry.state_of("a"), Some(PluginState::Loaded));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = PluginRegistry::new();
        registry.insert(mock_handle(MockPlugin::new("a"))).unwrap();
        let err = registry.insert(mock_handle(MockPlugin::new("a"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyLoaded);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_unknown() {
        let registry = PluginRegistry::new();
        assert_eq!(registry.remove("ghost").unwrap_err().kind(), ErrorKind::NotLoaded);
        assert_eq!(registry.require("ghost").unwrap_err().kind(), ErrorKind::NotLoaded);
    }

    #[test]
    fn test_dependents_and_counts() {
        let registry = PluginRegistry::new();
        registry.insert(mock_handle(MockPlugin::new("a"))).unwrap();
        registry
            .insert(mock_handle(MockPlugin::new("b").with_dependency("a")))
            .unwrap();
        assert_eq!(registry.dependents_of("a"), vec!["b"]);
        assert_eq!(registry.state_counts().get(&PluginState::Loaded), Some(&2));
    }
}
