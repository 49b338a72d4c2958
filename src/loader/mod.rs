//! Plugin Loader
//!
//! Turns artifact paths into loaded plugin handles, serves cached descriptor
//! lookups, and keeps a bounded history of failures.

pub mod backend;
pub mod cache;
pub mod history;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::plugin::handle::{Artifact, PluginHandle};
use crate::plugin::metadata::{PluginId, PluginMetadata};
use crate::plugin::state::{PluginState, StateListener, StateMachine};

pub use backend::{
    CreateFn, DynamicLibraryBackend, ModuleBackend, PluginFactory, PluginModule, StaticBackend,
    CREATE_SYMBOL, METADATA_SYMBOL,
};
pub use cache::{CacheStats, MetadataCache};
pub use history::{ErrorHistory, ErrorRecord};

/// Extension used for host-assigned plugin wrappers
pub const PLUGIN_EXTENSION: &str = "plugin";

/// Loader settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub cache_enabled: bool,
    pub max_cache_size: usize,
    pub error_history_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            max_cache_size: 256,
            error_history_size: 128,
        }
    }
}

/// Approximate resources held by a loaded plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub approx_memory_bytes: u64,
    /// Live references to the opened module
    pub handle_count: usize,
    pub load_duration: Duration,
}

struct LoadRecord {
    path: PathBuf,
    module: Arc<dyn PluginModule>,
    state: Arc<StateMachine>,
    load_duration: Duration,
}

/// Whether `path` carries an extension this host can load
pub fn is_recognized_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| {
            ext.eq_ignore_ascii_case(std::env::consts::DLL_EXTENSION)
                || ext.eq_ignore_ascii_case(PLUGIN_EXTENSION)
        })
}

/// Resolve to a canonical absolute path, or `FileNotFound`
pub fn canonical_path(path: &Path) -> PluginResult<PathBuf> {
    std::fs::canonicalize(path).map_err(|_| PluginError::file_not_found(path))
}

/// Dynamic library loader with metadata cache
pub struct Loader {
    backends: RwLock<Vec<Arc<dyn ModuleBackend>>>,
    cache: MetadataCache,
    history: Arc<ErrorHistory>,
    records: RwLock<HashMap<PluginId, LoadRecord>>,
}

impl Loader {
    /// Loader with only the shared-library backend
    pub fn new(config: &LoaderConfig) -> Self {
        Self {
            backends: RwLock::new(vec![Arc::new(DynamicLibraryBackend::new())]),
            cache: MetadataCache::new(config.cache_enabled, config.max_cache_size),
            history: Arc::new(ErrorHistory::new(config.error_history_size)),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Add a backend consulted before the existing ones
    pub fn add_backend(&self, backend: Arc<dyn ModuleBackend>) {
        self.backends.write().insert(0, backend);
    }

    fn backend_for(&self, path: &Path) -> PluginResult<Arc<dyn ModuleBackend>> {
        self.backends
            .read()
            .iter()
            .find(|b| b.supports(path))
            .cloned()
            .ok_or_else(|| {
                PluginError::unsupported_format("No backend can open this artifact").with_path(path)
            })
    }

    /// Canonicalize and check the extension
    fn resolve(&self, path: &Path) -> PluginResult<PathBuf> {
        let canonical = canonical_path(path)?;
        if !is_recognized_extension(&canonical) {
            return Err(PluginError::unsupported_format(format!(
                "Unrecognized artifact extension: {}",
                canonical.display()
            ))
            .with_path(&canonical));
        }
        if !canonical.is_file() {
            return Err(PluginError::invalid_path(format!("Not a file: {}", canonical.display()))
                .with_path(&canonical));
        }
        Ok(canonical)
    }

    /// Descriptor for an open module, through the cache
    fn descriptor(&self, path: &Path, module: Option<&Arc<dyn PluginModule>>) -> PluginResult<(Artifact, PluginMetadata)> {
        if let Some(cached) = self.cache.lookup(path)? {
            return Ok(cached);
        }
        let artifact = Artifact::inspect(path)?;
        let json = match module {
            Some(module) => module.metadata_json()?,
            None => {
                // metadata-only open, released before returning
                let module = self.backend_for(path)?.open(path)?;
                module.metadata_json()?
            }
        };
        let metadata = PluginMetadata::from_json(&json).map_err(|e| e.with_path(path))?;
        metadata.validate().map_err(|e| e.with_path(path))?;
        self.cache.insert(artifact.clone(), metadata.clone());
        Ok((artifact, metadata))
    }

    /// Read and validate the descriptor of an artifact without instantiating it
    pub fn inspect(&self, path: &Path) -> PluginResult<(Artifact, PluginMetadata)> {
        let canonical = self.resolve(path)?;
        self.descriptor(&canonical, None)
    }

    /// Cheap predicate: recognized, readable and with a valid descriptor
    pub fn can_load(&self, path: &Path) -> bool {
        match self.inspect(path) {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Cannot load {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Open, validate and instantiate an artifact; the handle is in `Loaded`
    pub fn load(&self, path: &Path) -> PluginResult<PluginHandle> {
        self.load_with_listener(path, None)
    }

    /// As [`load`](Self::load), installing `listener` on the new state machine first
    pub fn load_with_listener(&self, path: &Path, listener: Option<StateListener>) -> PluginResult<PluginHandle> {
        let started = Instant::now();
        let result = self.load_inner(path, listener, started);
        if let Err(e) = &result {
            log::warn!("Failed to load {}: {}", path.display(), e);
            self.history.record("load", Some(path.to_path_buf()), None, e);
        }
        result
    }

    fn load_inner(
        &self,
        path: &Path,
        listener: Option<StateListener>,
        started: Instant,
    ) -> PluginResult<PluginHandle> {
        let canonical = self.resolve(path)?;
        let module = self.backend_for(&canonical)?.open(&canonical)?;
        let (artifact, metadata) = self.descriptor(&canonical, Some(&module))?;

        if self.records.read().contains_key(&metadata.id) {
            return Err(PluginError::already_loaded(&metadata.id).with_path(&canonical));
        }

        let state = Arc::new(StateMachine::new(&metadata.id));
        if let Some(listener) = listener {
            state.set_listener(listener);
        }
        state.transition_to(PluginState::Loading)?;

        let instance = match module.instantiate() {
            Ok(instance) => instance,
            Err(e) => {
                state.mark_failed();
                return Err(e.with_plugin(&metadata.id));
            }
        };
        if instance.metadata().id != metadata.id {
            state.mark_failed();
            return Err(PluginError::metadata_invalid(format!(
                "Plugin object reports id '{}' but descriptor declares '{}'",
                instance.metadata().id,
                metadata.id
            ))
            .with_plugin(&metadata.id));
        }
        state.transition_to(PluginState::Loaded)?;

        let load_duration = started.elapsed();
        let handle = PluginHandle::new(
            metadata.clone(),
            artifact,
            instance,
            module.clone(),
            state.clone(),
            load_duration,
        );

        let mut records = self.records.write();
        if records.contains_key(&metadata.id) {
            return Err(PluginError::already_loaded(&metadata.id).with_path(&canonical));
        }
        records.insert(
            metadata.id.clone(),
            LoadRecord {
                path: canonical.clone(),
                module,
                state,
                load_duration,
            },
        );
        log::info!(
            "Loaded plugin '{}' v{} from {} in {:?}",
            metadata.id,
            metadata.version,
            canonical.display(),
            load_duration
        );
        Ok(handle)
    }

    /// Release the module for `id`.
    ///
    /// The plugin must be `Stopped`, `Failed`, or `Loaded` (never initialized).
    pub fn unload(&self, id: &str) -> PluginResult<()> {
        let result = self.unload_inner(id);
        if let Err(e) = &result {
            let path = self.records.read().get(id).map(|r| r.path.clone());
            self.history.record("unload", path, Some(id), e);
        }
        result
    }

    fn unload_inner(&self, id: &str) -> PluginResult<()> {
        let mut records = self.records.write();
        let record = records.get(id).ok_or_else(|| PluginError::not_loaded(id))?;
        match record.state.current_state() {
            PluginState::Stopped | PluginState::Failed => {
                record.state.transition_to(PluginState::Unloaded)?;
            }
            PluginState::Loaded => record.state.reset(),
            // a reset already returned it to Unloaded
            PluginState::Unloaded => {}
            other => {
                return Err(PluginError::invalid_state(format!(
                    "Cannot unload plugin '{}' while {}",
                    id, other
                ))
                .with_plugin(id)
                .with_context("state", other.as_str()));
            }
        }
        if let Some(record) = records.remove(id) {
            log::info!("Unloaded plugin '{}' ({})", id, record.path.display());
        }
        Ok(())
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.records.read().contains_key(id)
    }

    pub fn loaded_ids(&self) -> Vec<PluginId> {
        let mut ids: Vec<_> = self.records.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn path_of(&self, id: &str) -> Option<PathBuf> {
        self.records.read().get(id).map(|r| r.path.clone())
    }

    pub fn resource_usage(&self, id: &str) -> PluginResult<ResourceUsage> {
        let records = self.records.read();
        let record = records.get(id).ok_or_else(|| PluginError::not_loaded(id))?;
        Ok(ResourceUsage {
            approx_memory_bytes: record.module.approx_memory_bytes(),
            handle_count: Arc::strong_count(&record.module),
            load_duration: record.load_duration,
        })
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache.set_enabled(enabled);
    }

    pub fn set_max_cache_size(&self, max_size: usize) {
        self.cache.set_max_size(max_size);
    }

    pub fn error_history(&self) -> Vec<ErrorRecord> {
        self.history.entries()
    }

    /// The shared history, also fed by the hot-reload manager
    pub fn history(&self) -> &Arc<ErrorHistory> {
        &self.history
    }
}
