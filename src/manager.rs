//! Plugin Manager
//!
//! Single entry point that owns the loader, registry, lifecycle manager,
//! message bus, service registry, transaction coordinator, hot-reload
//! watcher and health monitor of one host instance. Several managers can
//! coexist in a process; nothing here is global.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::bus::{topics, BusStats, MessageBus};
use crate::config::HostConfig;
use crate::error::{ErrorKind, PluginError, PluginResult};
use crate::hot_reload::{HotReloadManager, HotReloadStats};
use crate::lifecycle::{
    BatchReport, HealthMonitor, HookPoint, HookRegistry, HookToken, LifecycleManager, Outcome,
};
use crate::loader::{is_recognized_extension, CacheStats, Loader, ModuleBackend};
use crate::plugin::handle::{Artifact, PluginHandle, PluginSnapshot};
use crate::plugin::metadata::{Capabilities, PluginId, PluginMetadata};
use crate::plugin::registry::PluginRegistry;
use crate::plugin::state::{PluginState, StateChange, StateListener};
use crate::plugin::traits::CommandDescriptor;
use crate::services::ServiceRegistry;
use crate::transaction::operation::{standard_validation, Operation, OperationKind};
use crate::transaction::{
    IsolationLevel, TransactionCoordinator, TransactionId, TransactionInfo, TransactionReaper,
    TransactionStats,
};

/// Options for [`PluginManager::load_plugin`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginLoadOptions {
    /// Require the installed signature validator to accept the artifact
    pub validate_signature: bool,
    /// Require declared dependencies to be loaded with compatible versions
    pub check_dependencies: bool,
    pub initialize_immediately: bool,
    pub enable_hot_reload: bool,
    /// Applied through `configure` before initialization
    pub initial_configuration: Option<Value>,
}

impl Default for PluginLoadOptions {
    fn default() -> Self {
        Self {
            validate_signature: false,
            check_dependencies: true,
            initialize_immediately: false,
            enable_hot_reload: false,
            initial_configuration: None,
        }
    }
}

impl PluginLoadOptions {
    /// Default options with `initialize_immediately` set
    pub fn initialized() -> Self {
        Self {
            initialize_immediately: true,
            ..Self::default()
        }
    }
}

/// A loadable artifact found by [`PluginManager::discover`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPlugin {
    pub path: PathBuf,
    pub metadata: PluginMetadata,
}

/// Point-in-time view of the whole host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_plugins: usize,
    pub plugins_by_state: BTreeMap<String, usize>,
    pub cache: CacheStats,
    pub bus: BusStats,
    pub transactions: TransactionStats,
    pub error_history_len: usize,
    pub hot_reload: HotReloadStats,
    pub registered_services: usize,
    pub cpu_cores: usize,
    pub uptime_ms: u64,
    pub collected_at: DateTime<Utc>,
}

/// Host-supplied artifact check used when `validate_signature` is requested
pub type SignatureValidator = Arc<dyn Fn(&Artifact) -> bool + Send + Sync>;

struct Inner {
    config: HostConfig,
    loader: Loader,
    registry: Arc<PluginRegistry>,
    bus: Arc<MessageBus>,
    services: Arc<ServiceRegistry>,
    hooks: Arc<HookRegistry>,
    lifecycle: Arc<LifecycleManager>,
    transactions: Arc<TransactionCoordinator>,
    reaper: Arc<TransactionReaper>,
    hot_reload: HotReloadManager,
    health: Arc<HealthMonitor>,
    search_paths: RwLock<Vec<PathBuf>>,
    signature_validator: RwLock<Option<SignatureValidator>>,
    started: Instant,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.health.cancel();
        self.reaper.cancel();
    }
}

/// Steps of `load_plugin` that are undone when a later step fails
enum LoadStep {
    Loaded,
    Registered,
    Watching,
    Initialized,
}

/// Cheap-to-clone handle on one host instance
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<Inner>,
}

impl PluginManager {
    /// Build a host from `config`.
    ///
    /// When created inside a tokio runtime the transaction reaper and the
    /// health monitor (if enabled) are started and reload callbacks run on
    /// that runtime.
    pub fn new(config: HostConfig) -> Self {
        let loader = Loader::new(&config.loader);
        let registry = Arc::new(PluginRegistry::new());
        let bus = Arc::new(MessageBus::new(config.bus.clone()));
        let services = Arc::new(ServiceRegistry::new());
        let hooks = Arc::new(HookRegistry::new());
        let lifecycle = Arc::new(LifecycleManager::new(
            config.lifecycle.clone(),
            registry.clone(),
            bus.clone(),
            services.clone(),
            hooks.clone(),
        ));
        let transactions = Arc::new(TransactionCoordinator::new(
            config.transactions.clone(),
            registry.clone(),
        ));
        let reaper = TransactionReaper::new(&transactions);
        {
            let bus = bus.clone();
            transactions.set_completion_listener(Arc::new(move |info: &TransactionInfo| {
                let payload = serde_json::to_value(info).unwrap_or(Value::Null);
                bus.emit(topics::TRANSACTION_COMPLETED, payload);
            }));
        }
        let hot_reload = HotReloadManager::new(config.hot_reload.clone(), loader.history().clone());
        let health = HealthMonitor::new(lifecycle.clone(), config.health.clone());

        let inner = Arc::new(Inner {
            search_paths: RwLock::new(config.search_paths.clone()),
            config,
            loader,
            registry,
            bus,
            services,
            hooks,
            lifecycle,
            transactions,
            reaper,
            hot_reload,
            health,
            signature_validator: RwLock::new(None),
            started: Instant::now(),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner.hot_reload.set_reload_callback(move |id| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        let manager = PluginManager { inner };
                        manager.reload_plugin(&id).await
                    }
                    None => Err(PluginError::internal("Host was shut down before the reload ran")),
                }
            }
            .boxed()
        });

        let has_runtime = tokio::runtime::Handle::try_current().is_ok();
        if has_runtime {
            inner.reaper.start();
        } else {
            debug!("No tokio runtime; expired transactions are only rolled back when next used");
        }
        if inner.config.health.enabled {
            if has_runtime {
                inner.health.start();
            } else {
                warn!("Health monitoring is enabled but no tokio runtime is available");
            }
        }
        info!("Plugin host ready (API v{})", crate::version::host_api_version());
        Self { inner }
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn loader(&self) -> &Loader {
        &self.inner.loader
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.inner.bus
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.inner.services
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.inner.lifecycle
    }

    pub fn transactions(&self) -> &TransactionCoordinator {
        &self.inner.transactions
    }

    pub fn hot_reload(&self) -> &HotReloadManager {
        &self.inner.hot_reload
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.inner.health
    }

    /// Add a module backend, consulted before the existing ones
    pub fn add_backend(&self, backend: Arc<dyn ModuleBackend>) {
        self.inner.loader.add_backend(backend);
    }

    pub fn set_signature_validator<F>(&self, validator: F)
    where
        F: Fn(&Artifact) -> bool + Send + Sync + 'static,
    {
        *self.inner.signature_validator.write() = Some(Arc::new(validator));
    }

    pub fn add_search_path<P: Into<PathBuf>>(&self, path: P) {
        let path = path.into();
        let mut paths = self.inner.search_paths.write();
        if !paths.contains(&path) {
            debug!("Added search path {}", path.display());
            paths.push(path);
        }
    }

    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.inner.search_paths.read().clone()
    }

    /// Relative paths that do not exist as given are looked up in the search paths
    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.exists() {
            return path.to_path_buf();
        }
        self.inner
            .search_paths
            .read()
            .iter()
            .map(|dir| dir.join(path))
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| path.to_path_buf())
    }

    fn state_listener(&self) -> StateListener {
        let bus = self.inner.bus.clone();
        Arc::new(move |change: &StateChange| {
            let payload = serde_json::to_value(change).unwrap_or(Value::Null);
            bus.emit(topics::STATE_CHANGED, payload);
        })
    }

    fn check_signature(&self, artifact: &Artifact, id: &str) -> PluginResult<()> {
        let validator = self.inner.signature_validator.read().clone();
        match validator {
            None => Err(PluginError::load_failed(format!(
                "Signature validation requested for '{}' but no validator is installed",
                id
            ))
            .with_plugin(id)
            .with_path(&artifact.file_path)),
            Some(validator) if !validator(artifact) => Err(PluginError::load_failed(format!(
                "Artifact for '{}' failed signature validation",
                id
            ))
            .with_plugin(id)
            .with_path(&artifact.file_path)),
            Some(_) => Ok(()),
        }
    }

    /// Required dependencies must be registered, not failed, and version compatible
    fn check_load_dependencies(&self, metadata: &PluginMetadata) -> PluginResult<()> {
        for dep in &metadata.dependencies {
            let provider = self.inner.registry.get(&dep.id).ok_or_else(|| {
                PluginError::dependency_unsatisfied(format!(
                    "'{}' requires '{}', which is not loaded",
                    metadata.id, dep.id
                ))
                .with_plugin(&metadata.id)
                .with_context("dependency", dep.id.clone())
            })?;
            if provider.state() == PluginState::Failed {
                return Err(PluginError::dependency_unsatisfied(format!(
                    "'{}' requires '{}', which has failed",
                    metadata.id, dep.id
                ))
                .with_plugin(&metadata.id)
                .with_context("dependency", dep.id.clone()));
            }
            if !dep.accepts(&provider.metadata().version) {
                return Err(PluginError::dependency_unsatisfied(format!(
                    "'{}' requires {} but v{} is loaded",
                    metadata.id,
                    dep,
                    provider.metadata().version
                ))
                .with_plugin(&metadata.id)
                .with_context("dependency", dep.id.clone()));
            }
        }
        Ok(())
    }

    /// Load an artifact and register it.
    ///
    /// Any failure undoes the steps already taken, leaving the registry as it was.
    pub async fn load_plugin(&self, path: &Path, options: PluginLoadOptions) -> PluginResult<PluginId> {
        let path = self.resolve_path(path);
        let (artifact, metadata) = self.inner.loader.inspect(&path)?;
        let id = metadata.id.clone();

        if self.inner.registry.contains(&id) {
            return Err(PluginError::already_loaded(&id).with_path(&artifact.file_path));
        }
        if options.validate_signature {
            self.check_signature(&artifact, &id)?;
        }
        if options.check_dependencies {
            self.check_load_dependencies(&metadata)?;
        }
        self.inner.hooks.run(HookPoint::PreLoad, &id, None)?;

        let mut done: Vec<LoadStep> = Vec::new();
        match self.load_steps(&path, &id, &options, &mut done).await {
            Ok(handle) => {
                info!("Plugin '{}' v{} is {}", id, handle.metadata().version, handle.state());
                self.inner.bus.emit(
                    topics::LOADED,
                    json!({
                        "plugin_id": id,
                        "version": handle.metadata().version.to_string(),
                        "path": handle.artifact().file_path,
                        "state": handle.state().as_str(),
                    }),
                );
                self.inner.hooks.run(HookPoint::PostLoad, &id, Some(handle.as_ref()))?;
                Ok(id)
            }
            Err(e) => {
                warn!("Loading '{}' failed, undoing {} step(s): {}", id, done.len(), e);
                self.undo_load(&id, done).await;
                Err(e)
            }
        }
    }

    async fn load_steps(
        &self,
        path: &Path,
        id: &str,
        options: &PluginLoadOptions,
        done: &mut Vec<LoadStep>,
    ) -> PluginResult<Arc<PluginHandle>> {
        let handle = Arc::new(
            self.inner
                .loader
                .load_with_listener(path, Some(self.state_listener()))?,
        );
        done.push(LoadStep::Loaded);

        self.inner.lifecycle.register(handle.clone())?;
        done.push(LoadStep::Registered);

        if options.enable_hot_reload {
            if handle.metadata().capabilities.contains(Capabilities::HOT_RELOAD) {
                self.inner.hot_reload.enable(id, &handle.artifact().file_path)?;
                handle.set_reload_enabled(true);
                done.push(LoadStep::Watching);
            } else {
                warn!("Plugin '{}' does not declare HotReload; not watching its artifact", id);
            }
        }

        if let Some(config) = &options.initial_configuration {
            self.configure(id, config.clone()).await?;
        }

        if options.initialize_immediately {
            let result = self.inner.lifecycle.initialize(id).await;
            // a failed initialize still needs its shutdown-free teardown
            done.push(LoadStep::Initialized);
            result?;
        }
        Ok(handle)
    }

    async fn undo_load(&self, id: &str, done: Vec<LoadStep>) {
        for step in done.into_iter().rev() {
            let result = match step {
                LoadStep::Initialized => match self.inner.registry.state_of(id) {
                    Some(PluginState::Running) | Some(PluginState::Paused) => {
                        self.inner.lifecycle.stop_inner(id, true).await
                    }
                    _ => Ok(()),
                },
                LoadStep::Watching => {
                    self.inner.hot_reload.disable(id);
                    Ok(())
                }
                LoadStep::Registered => self.inner.lifecycle.unregister(id).map(|_| ()),
                LoadStep::Loaded => self.inner.loader.unload(id),
            };
            if let Err(e) = result {
                warn!("Failed to undo load step for '{}': {}", id, e);
            }
        }
    }

    /// Stop (if needed) and unload a plugin.
    ///
    /// Without `force`, a plugin that running dependents rely on, or one in the
    /// middle of a transition, is refused. With `force` it is stopped regardless
    /// and unloaded even if stopping fails.
    pub async fn unload_plugin(&self, id: &str, force: bool) -> PluginResult<()> {
        let handle = self.inner.registry.require(id)?;
        self.inner.hooks.run(HookPoint::PreUnload, id, Some(handle.as_ref()))?;

        match handle.state() {
            PluginState::Running | PluginState::Paused => {
                if let Err(e) = self.inner.lifecycle.stop_inner(id, force).await {
                    if !force {
                        return Err(e);
                    }
                    warn!("Forcing unload of '{}' after failed stop: {}", id, e);
                    self.inner.lifecycle.mark_failed(&handle, &e);
                }
            }
            PluginState::Loading | PluginState::Initializing | PluginState::Stopping => {
                let state = handle.state();
                let e = PluginError::invalid_state(format!("Plugin '{}' is {}", id, state))
                    .with_plugin(id)
                    .with_context("state", state.as_str());
                if !force {
                    return Err(e);
                }
                self.inner.lifecycle.mark_failed(&handle, &e);
            }
            _ => {}
        }

        self.inner.loader.unload(id)?;
        self.inner.hot_reload.disable(id);
        self.inner.lifecycle.unregister(id)?;
        let services = self.inner.services.unregister_provider(id);
        let subscriptions = self.inner.bus.unsubscribe(id, None);
        debug!(
            "Released {} service(s) and {} subscription(s) of '{}'",
            services, subscriptions, id
        );

        self.inner.bus.emit(topics::UNLOADED, json!({ "plugin_id": id }));
        self.inner.hooks.run(HookPoint::PostUnload, id, Some(handle.as_ref()))
    }

    pub fn get_plugin(&self, id: &str) -> Option<PluginSnapshot> {
        self.inner.registry.snapshot(id)
    }

    /// Registered plugin ids, sorted
    pub fn loaded(&self) -> Vec<PluginId> {
        let mut ids = self.inner.registry.ids();
        ids.sort();
        ids
    }

    /// Walk `dir` for loadable artifacts; unreadable entries are skipped
    pub async fn discover(&self, dir: &Path, recursive: bool) -> PluginResult<Vec<DiscoveredPlugin>> {
        let metadata = tokio::fs::metadata(dir)
            .await
            .map_err(|_| PluginError::file_not_found(dir))?;
        if !metadata.is_dir() {
            return Err(PluginError::invalid_path(format!("Not a directory: {}", dir.display())).with_path(dir));
        }

        let mut found = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("Skipping {}: {}", current.display(), e);
                    continue;
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(file_type) => file_type,
                    Err(_) => continue,
                };
                if file_type.is_dir() {
                    if recursive {
                        pending.push(path);
                    }
                    continue;
                }
                if !is_recognized_extension(&path) {
                    continue;
                }
                match self.inner.loader.inspect(&path) {
                    Ok((artifact, metadata)) => found.push(DiscoveredPlugin {
                        path: artifact.file_path,
                        metadata,
                    }),
                    Err(e) => debug!("Ignoring {}: {}", path.display(), e),
                }
            }
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        info!("Discovered {} plugin(s) in {}", found.len(), dir.display());
        Ok(found)
    }

    pub async fn initialize(&self, id: &str) -> PluginResult<()> {
        self.inner.lifecycle.initialize(id).await
    }

    pub async fn initialize_all(&self) -> BatchReport {
        self.inner.lifecycle.initialize_all().await
    }

    pub async fn stop(&self, id: &str) -> PluginResult<()> {
        self.inner.lifecycle.stop(id).await
    }

    pub async fn stop_all(&self) -> BatchReport {
        self.inner.lifecycle.stop_all().await
    }

    pub async fn pause(&self, id: &str) -> PluginResult<()> {
        self.inner.lifecycle.pause(id).await
    }

    pub async fn resume(&self, id: &str) -> PluginResult<()> {
        self.inner.lifecycle.resume(id).await
    }

    pub async fn restart(&self, id: &str) -> PluginResult<()> {
        self.inner.lifecycle.restart(id).await
    }

    /// Hand `config` to the plugin; the handle's live configuration is only
    /// updated once the plugin accepts it
    pub async fn configure(&self, id: &str, config: Value) -> PluginResult<()> {
        let handle = self.inner.registry.require(id)?;
        let mut instance = handle.instance().lock().await;
        let state = handle.state();
        if matches!(state, PluginState::Failed | PluginState::Unloaded) {
            return Err(PluginError::invalid_state(format!(
                "Cannot configure plugin '{}' while {}",
                id, state
            ))
            .with_plugin(id)
            .with_context("state", state.as_str()));
        }
        let limit = self.inner.lifecycle.config().operation_timeout;
        self.inner
            .lifecycle
            .bounded(id, "configure", limit, instance.configure(&config))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::ConfigurationError | ErrorKind::Timeout => e.with_plugin(id),
                _ => PluginError::configuration_error(format!(
                    "Plugin '{}' rejected its configuration: {}",
                    id,
                    e.message()
                ))
                .with_plugin(id)
                .with_cause(e),
            })?;
        handle.set_live_config(config);
        handle.touch();
        debug!("Configured plugin '{}'", id);
        Ok(())
    }

    pub async fn get_configuration(&self, id: &str) -> PluginResult<Value> {
        let handle = self.inner.registry.require(id)?;
        let instance = handle.instance().lock().await;
        Ok(instance.get_configuration())
    }

    /// Run a command on a `Running` plugin
    pub async fn execute_command(&self, id: &str, command: &str, params: Value) -> PluginResult<Value> {
        let handle = self.inner.registry.require(id)?;
        let mut instance = handle.instance().lock().await;
        let state = handle.state();
        if state != PluginState::Running {
            return Err(PluginError::invalid_state(format!(
                "Plugin '{}' is {} and cannot execute '{}'",
                id, state, command
            ))
            .with_plugin(id)
            .with_context("command", command));
        }
        let limit = self.inner.lifecycle.config().operation_timeout;
        let result = self
            .inner
            .lifecycle
            .bounded(id, command, limit, instance.execute_command(command, params))
            .await
            .map_err(|e| e.with_plugin(id));
        handle.touch();
        result
    }

    pub async fn available_commands(&self, id: &str) -> PluginResult<Vec<CommandDescriptor>> {
        let handle = self.inner.registry.require(id)?;
        let instance = handle.instance().lock().await;
        Ok(instance.available_commands())
    }

    pub fn register_hook<F>(&self, point: HookPoint, hook: F) -> HookToken
    where
        F: Fn(&str, Option<&PluginHandle>) -> PluginResult<()> + Send + Sync + 'static,
    {
        self.inner.hooks.register(point, hook)
    }

    pub fn unregister_hook(&self, token: HookToken) -> bool {
        self.inner.hooks.unregister(token)
    }

    /// Watch a loaded plugin's artifact; the plugin must declare `HotReload`
    pub fn enable_hot_reload(&self, id: &str) -> PluginResult<()> {
        let handle = self.inner.registry.require(id)?;
        if !handle.metadata().capabilities.contains(Capabilities::HOT_RELOAD) {
            return Err(PluginError::invalid_parameters(format!(
                "Plugin '{}' does not support hot reload",
                id
            ))
            .with_plugin(id));
        }
        self.inner.hot_reload.enable(id, &handle.artifact().file_path)?;
        handle.set_reload_enabled(true);
        Ok(())
    }

    pub fn disable_hot_reload(&self, id: &str) -> bool {
        if let Some(handle) = self.inner.registry.get(id) {
            handle.set_reload_enabled(false);
        }
        self.inner.hot_reload.disable(id)
    }

    pub fn set_hot_reload_enabled(&self, enabled: bool) {
        self.inner.hot_reload.set_global_enabled(enabled);
    }

    /// Replace a plugin with the current content of its artifact.
    ///
    /// The old instance is told through `hot_reload()`, then an unload and a
    /// load run in one transaction so a failed load restores the old plugin.
    pub async fn reload_plugin(&self, id: &str) -> PluginResult<()> {
        let handle = self.inner.registry.require(id)?;
        if !handle.is_reload_enabled() || !handle.metadata().capabilities.contains(Capabilities::HOT_RELOAD) {
            debug!("Ignoring reload request for '{}'", id);
            return Ok(());
        }
        {
            let mut instance = handle.instance().lock().await;
            let limit = self.inner.lifecycle.config().operation_timeout;
            self.inner
                .lifecycle
                .bounded(id, "hot_reload", limit, instance.hot_reload())
                .await
                .map_err(|e| e.with_plugin(id))?;
        }

        let path = handle.artifact().file_path.clone();
        let options = PluginLoadOptions {
            initialize_immediately: handle.state().satisfies_dependents(),
            enable_hot_reload: true,
            check_dependencies: false,
            initial_configuration: Some(handle.live_config()).filter(|c| !c.is_null()),
            ..PluginLoadOptions::default()
        };
        drop(handle);

        let tx = self.inner.transactions.begin(IsolationLevel::Serializable, None);
        let result = async {
            self.inner
                .transactions
                .add_operation(tx, self.unload_operation(id, true)?)
                .await?;
            self.inner
                .transactions
                .add_operation(tx, self.load_operation(&path, options)?)
                .await?;
            self.inner.transactions.commit(tx).await
        }
        .await;
        if result.is_err() {
            // no-op when the commit already rolled back
            let _ = self.inner.transactions.rollback(tx).await;
        }

        self.inner.bus.emit(
            topics::RELOAD,
            json!({
                "plugin_id": id,
                "success": result.is_ok(),
                "error": result.as_ref().err().map(|e| e.to_string()),
            }),
        );
        match &result {
            Ok(()) => info!("Reloaded plugin '{}'", id),
            Err(e) => warn!("Reload of '{}' failed: {}", id, e),
        }
        result
    }

    pub fn begin_transaction(&self, isolation: IsolationLevel, timeout: Option<Duration>) -> TransactionId {
        self.inner.transactions.begin(isolation, timeout)
    }

    pub async fn add_operation(&self, tx: TransactionId, operation: Operation) -> PluginResult<()> {
        self.inner.transactions.add_operation(tx, operation).await
    }

    pub async fn prepare(&self, tx: TransactionId) -> PluginResult<()> {
        self.inner.transactions.prepare(tx).await
    }

    pub async fn commit(&self, tx: TransactionId) -> PluginResult<()> {
        self.inner.transactions.commit(tx).await
    }

    pub async fn rollback(&self, tx: TransactionId) -> PluginResult<()> {
        self.inner.transactions.rollback(tx).await
    }

    fn weak(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    /// Operation steps hold the host weakly so a kept transaction cannot keep it alive
    fn upgrade(weak: &Weak<Inner>) -> PluginResult<PluginManager> {
        weak.upgrade()
            .map(|inner| PluginManager { inner })
            .ok_or_else(|| PluginError::internal("Host was shut down before the operation ran"))
    }

    /// Load `path`; undone by a forced unload
    pub fn load_operation(&self, path: &Path, options: PluginLoadOptions) -> PluginResult<Operation> {
        let path = self.resolve_path(path);
        let (_, metadata) = self.inner.loader.inspect(&path)?;
        let id = metadata.id.clone();

        let host = self.weak();
        let target = id.clone();
        let source = path.clone();
        let forward_options = options.clone();
        let undo = self.weak();
        let undo_id = id.clone();
        Ok(Operation::new(OperationKind::Load, &id, move || {
            let host = host.clone();
            let source = source.clone();
            let options = forward_options.clone();
            async move {
                let manager = Self::upgrade(&host)?;
                manager.load_plugin(&source, options).await.map(|_| ())
            }
        })
        .with_payload(json!({ "path": path, "options": options }))
        .with_validation(move |context| standard_validation(OperationKind::Load, &target, context))
        .with_rollback(move || {
            let undo = undo.clone();
            let id = undo_id.clone();
            async move { Self::upgrade(&undo)?.unload_plugin(&id, true).await }
        }))
    }

    /// Unload `id`; undone by loading the same artifact again, restoring its
    /// configuration and, if it was running, initializing it
    pub fn unload_operation(&self, id: &str, force: bool) -> PluginResult<Operation> {
        let handle = self.inner.registry.require(id)?;
        let path = handle.artifact().file_path.clone();
        let was_running = handle.state().satisfies_dependents();
        let live_config = handle.live_config();
        let watched = handle.is_reload_enabled();
        drop(handle);

        let host = self.weak();
        let target = id.to_string();
        let forward_id = id.to_string();
        let undo = self.weak();
        let restore = PluginLoadOptions {
            check_dependencies: false,
            initialize_immediately: was_running,
            enable_hot_reload: watched,
            initial_configuration: Some(live_config).filter(|c| !c.is_null()),
            ..PluginLoadOptions::default()
        };
        Ok(Operation::new(OperationKind::Unload, id, move || {
            let host = host.clone();
            let id = forward_id.clone();
            async move { Self::upgrade(&host)?.unload_plugin(&id, force).await }
        })
        .with_payload(json!({ "path": path, "force": force }))
        .with_validation(move |context| standard_validation(OperationKind::Unload, &target, context))
        .with_rollback(move || {
            let undo = undo.clone();
            let path = path.clone();
            let options = restore.clone();
            async move {
                let manager = Self::upgrade(&undo)?;
                manager.load_plugin(&path, options).await.map(|_| ())
            }
        }))
    }

    /// Configure `id`; undone by restoring the configuration it had before
    pub fn configure_operation(&self, id: &str, config: Value) -> Operation {
        let previous: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let host = self.weak();
        let forward_id = id.to_string();
        let target = id.to_string();
        let saved = previous.clone();
        let next = config.clone();
        let undo = self.weak();
        let undo_id = id.to_string();
        Operation::new(OperationKind::Configure, id, move || {
            let host = host.clone();
            let id = forward_id.clone();
            let config = next.clone();
            let saved = saved.clone();
            async move {
                let manager = Self::upgrade(&host)?;
                let handle = manager.inner.registry.require(&id)?;
                *saved.lock() = Some(handle.live_config());
                drop(handle);
                manager.configure(&id, config).await
            }
        })
        .with_payload(config)
        .with_validation(move |context| standard_validation(OperationKind::Configure, &target, context))
        .with_rollback(move || {
            let undo = undo.clone();
            let id = undo_id.clone();
            let previous = previous.lock().take();
            async move {
                match previous {
                    Some(previous) if !previous.is_null() => Self::upgrade(&undo)?.configure(&id, previous).await,
                    _ => Ok(()),
                }
            }
        })
    }

    /// Run a command; it has no rollback unless the caller adds one
    pub fn execute_operation(&self, id: &str, command: &str, params: Value) -> Operation {
        let host = self.weak();
        let forward_id = id.to_string();
        let target = id.to_string();
        let name = command.to_string();
        let args = params.clone();
        Operation::new(OperationKind::Execute, id, move || {
            let host = host.clone();
            let id = forward_id.clone();
            let name = name.clone();
            let args = args.clone();
            async move {
                let manager = Self::upgrade(&host)?;
                manager.execute_command(&id, &name, args).await.map(|_| ())
            }
        })
        .with_payload(json!({ "command": command, "params": params }))
        .with_validation(move |context| standard_validation(OperationKind::Execute, &target, context))
    }

    /// Host-wide snapshot
    pub fn system_metrics(&self) -> SystemMetrics {
        let counts = self.inner.registry.state_counts();
        SystemMetrics {
            total_plugins: counts.values().sum(),
            plugins_by_state: counts
                .into_iter()
                .map(|(state, count)| (state.as_str().to_string(), count))
                .collect(),
            cache: self.inner.loader.cache_stats(),
            bus: self.inner.bus.stats(),
            transactions: self.inner.transactions.stats(),
            error_history_len: self.inner.loader.history().len(),
            hot_reload: self.inner.hot_reload.stats(),
            registered_services: self.inner.services.len(),
            cpu_cores: num_cpus::get(),
            uptime_ms: self.inner.started.elapsed().as_millis() as u64,
            collected_at: Utc::now(),
        }
    }

    /// Stop monitoring, stop every plugin in reverse dependency order and unload them all
    pub async fn shutdown(&self) -> BatchReport {
        self.inner.health.stop().await;
        self.inner.reaper.stop().await;
        let mut report = self.inner.lifecycle.stop_all().await;
        report.operation = "shutdown".to_string();
        for id in self.unload_order() {
            if let Err(e) = self.unload_plugin(&id, true).await {
                warn!("Failed to unload '{}' during shutdown: {}", id, e);
                report.outcomes.push((id, Outcome::Failed(e)));
            }
        }
        self.inner.hot_reload.shutdown();
        info!("Plugin host shut down");
        report
    }

    /// Dependents before their dependencies
    fn unload_order(&self) -> Vec<PluginId> {
        let mut resolver = crate::plugin::resolver::DependencyResolver::new();
        for handle in self.inner.registry.handles() {
            resolver.add(handle.id(), handle.metadata().dependency_ids());
        }
        let resolution = resolver.partition();
        let mut order = resolution.order;
        order.extend(resolution.blocked);
        order.reverse();
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Message;
    use crate::loader::StaticBackend;
    use crate::plugin::tests::mock_plugins::{MockPlugin, MockProbe};
    use crate::plugin::traits::Plugin;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        manager: PluginManager,
        backend: Arc<StaticBackend>,
        probe: Arc<MockProbe>,
    }

    impl Fixture {
        fn new() -> Self {
            let manager = PluginManager::new(HostConfig::default());
            let backend = Arc::new(StaticBackend::new());
            manager.add_backend(backend.clone());
            Self {
                dir: TempDir::new().unwrap(),
                manager,
                backend,
                probe: MockProbe::new(),
            }
        }

        fn artifact(&self, id: &str, deps: &[&str]) -> PathBuf {
            self.artifact_with(id, deps, false)
        }

        fn artifact_with(&self, id: &str, deps: &[&str], fail_init: bool) -> PathBuf {
            let file_name = format!("{}.plugin", id);
            let path = self.dir.path().join(&file_name);
            fs::write(&path, id.as_bytes()).unwrap();
            let probe = self.probe.clone();
            let id = id.to_string();
            let deps: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
            self.backend
                .register(&file_name, move || {
                    let mut plugin = MockPlugin::new(&id).with_probe(&probe);
                    for dep in &deps {
                        plugin = plugin.with_dependency(dep);
                    }
                    if fail_init {
                        plugin = plugin.failing_initialize();
                    }
                    Box::new(plugin) as Box<dyn Plugin>
                })
                .unwrap();
            path
        }
    }

    #[tokio::test]
    async fn test_load_run_unload() {
        let fx = Fixture::new();
        let path = fx.artifact("a", &[]);

        let id = fx
            .manager
            .load_plugin(&path, PluginLoadOptions::initialized())
            .await
            .unwrap();
        assert_eq!(id, "a");
        assert_eq!(fx.manager.get_plugin("a").unwrap().state, PluginState::Running);
        assert_eq!(fx.manager.loaded(), vec!["a".to_string()]);

        fx.manager.unload_plugin("a", false).await.unwrap();
        assert!(fx.manager.loaded().is_empty());
        assert!(!fx.manager.loader().is_loaded("a"));
        assert_eq!(fx.probe.calls(), vec!["a:initialize", "a:shutdown"]);
    }

    #[tokio::test]
    async fn test_failed_initialize_rolls_back_load() {
        let fx = Fixture::new();
        let path = fx.artifact_with("a", &[], true);
        let err = fx
            .manager
            .load_plugin(&path, PluginLoadOptions::initialized())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InitializationFailed);
        assert!(fx.manager.loaded().is_empty());
        assert!(!fx.manager.loader().is_loaded("a"));

        // a second attempt is not refused as already loaded
        let err = fx.manager.load_plugin(&path, PluginLoadOptions::default()).await;
        assert!(err.is_ok());
    }

    #[tokio::test]
    async fn test_missing_dependency_refused() {
        let fx = Fixture::new();
        let path = fx.artifact("b", &["a"]);
        let err = fx
            .manager
            .load_plugin(&path, PluginLoadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyUnsatisfied);
        assert!(fx.manager.loaded().is_empty());

        let unchecked = PluginLoadOptions {
            check_dependencies: false,
            ..PluginLoadOptions::default()
        };
        fx.manager.load_plugin(&path, unchecked).await.unwrap();
    }

    #[tokio::test]
    async fn test_signature_validation() {
        let fx = Fixture::new();
        let path = fx.artifact("a", &[]);
        let signed = PluginLoadOptions {
            validate_signature: true,
            ..PluginLoadOptions::default()
        };
        let err = fx.manager.load_plugin(&path, signed.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LoadFailed);

        fx.manager.set_signature_validator(|artifact| artifact.size > 100);
        assert!(fx.manager.load_plugin(&path, signed.clone()).await.is_err());

        fx.manager.set_signature_validator(|artifact| !artifact.content_digest.is_empty());
        fx.manager.load_plugin(&path, signed).await.unwrap();
    }

    #[tokio::test]
    async fn test_unload_refused_while_dependents_run() {
        let fx = Fixture::new();
        let a = fx.artifact("a", &[]);
        let b = fx.artifact("b", &["a"]);
        fx.manager.load_plugin(&a, PluginLoadOptions::initialized()).await.unwrap();
        fx.manager.load_plugin(&b, PluginLoadOptions::initialized()).await.unwrap();

        let err = fx.manager.unload_plugin("a", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceBusy);
        assert_eq!(fx.manager.get_plugin("a").unwrap().state, PluginState::Running);

        fx.manager.unload_plugin("a", true).await.unwrap();
        assert_eq!(fx.manager.loaded(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_configure_and_commands() {
        let fx = Fixture::new();
        let path = fx.artifact("a", &[]);
        fx.manager.load_plugin(&path, PluginLoadOptions::default()).await.unwrap();

        let err = fx
            .manager
            .execute_command("a", "echo", json!(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        fx.manager.initialize("a").await.unwrap();
        assert_eq!(fx.manager.execute_command("a", "echo", json!({"x": 1})).await.unwrap(), json!({"x": 1}));
        let err = fx.manager.execute_command("a", "nope", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandNotFound);
        assert_eq!(fx.manager.available_commands("a").await.unwrap().len(), 2);

        fx.manager.configure("a", json!({"level": 3})).await.unwrap();
        assert_eq!(fx.manager.get_plugin("a").unwrap().live_config, json!({"level": 3}));
        let err = fx.manager.configure("a", json!("bad")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
        assert_eq!(fx.manager.get_configuration("a").await.unwrap(), json!({"level": 3}));
    }

    #[tokio::test]
    async fn test_events_published() {
        let fx = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        fx.manager.bus().subscribe(
            "observer",
            crate::bus::ALL_TYPES,
            move |m: &Message| {
                sink.lock().push(m.message_type.clone());
                Ok(())
            },
            None,
        );
        let path = fx.artifact("a", &[]);
        fx.manager.load_plugin(&path, PluginLoadOptions::initialized()).await.unwrap();
        fx.manager.unload_plugin("a", false).await.unwrap();

        let seen = seen.lock().clone();
        assert!(seen.contains(&topics::LOADED.to_string()));
        assert!(seen.contains(&topics::UNLOADED.to_string()));
        assert!(seen.iter().filter(|t| *t == topics::STATE_CHANGED).count() >= 4);
    }

    #[tokio::test]
    async fn test_discover_and_search_paths() {
        let fx = Fixture::new();
        fx.artifact("a", &[]);
        let nested = fx.dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join("ignored.txt"), b"x").unwrap();

        let found = fx.manager.discover(fx.dir.path(), true).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.id, "a");

        fx.manager.add_search_path(fx.dir.path());
        fx.manager
            .load_plugin(Path::new("a.plugin"), PluginLoadOptions::default())
            .await
            .unwrap();

        let err = fx.manager.discover(&fx.dir.path().join("missing"), false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
    }

    #[tokio::test]
    async fn test_system_metrics() {
        let fx = Fixture::new();
        let path = fx.artifact("a", &[]);
        fx.manager.load_plugin(&path, PluginLoadOptions::initialized()).await.unwrap();
        let metrics = fx.manager.system_metrics();
        assert_eq!(metrics.total_plugins, 1);
        assert_eq!(metrics.plugins_by_state.get("Running"), Some(&1));
        assert!(metrics.cpu_cores >= 1);
        assert!(serde_json::to_value(&metrics).is_ok());
    }

    #[tokio::test]
    async fn test_host_freed_after_committed_transactions() {
        let fx = Fixture::new();
        let a = fx.artifact("a", &[]);
        let b = fx.artifact("b", &[]);
        fx.manager.load_plugin(&a, PluginLoadOptions::initialized()).await.unwrap();

        let tx = fx.manager.begin_transaction(IsolationLevel::Serializable, None);
        fx.manager
            .add_operation(tx, fx.manager.configure_operation("a", json!({"level": 1})))
            .await
            .unwrap();
        fx.manager
            .add_operation(tx, fx.manager.load_operation(&b, PluginLoadOptions::default()).unwrap())
            .await
            .unwrap();
        fx.manager
            .add_operation(tx, fx.manager.execute_operation("a", "echo", json!(1)))
            .await
            .unwrap();
        fx.manager.commit(tx).await.unwrap();

        let abandoned = fx.manager.begin_transaction(IsolationLevel::ReadCommitted, None);
        fx.manager
            .add_operation(abandoned, fx.manager.unload_operation("b", true).unwrap())
            .await
            .unwrap();
        fx.manager.rollback(abandoned).await.unwrap();
        assert_eq!(fx.manager.transactions().list().len(), 2);

        let host = fx.manager.weak();
        let bus = Arc::downgrade(fx.manager.bus());
        let Fixture { dir: _dir, manager, .. } = fx;
        drop(manager);
        assert!(host.upgrade().is_none());

        // a reaper pass in progress may hold the coordinator for a moment
        let mut freed = false;
        for _ in 0..50 {
            if bus.upgrade().is_none() {
                freed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(freed);
    }

    #[tokio::test]
    async fn test_shutdown_unloads_everything() {
        let fx = Fixture::new();
        let a = fx.artifact("a", &[]);
        let b = fx.artifact("b", &["a"]);
        fx.manager.load_plugin(&a, PluginLoadOptions::initialized()).await.unwrap();
        fx.manager.load_plugin(&b, PluginLoadOptions::initialized()).await.unwrap();

        let report = fx.manager.shutdown().await;
        assert_eq!(report.order(), vec!["b", "a"]);
        assert!(fx.manager.loaded().is_empty());
    }
}
