//! Lifecycle Manager
//!
//! Drives registered plugins through the state machine. Each operation holds
//! the plugin's instance lock for its whole duration, so operations on one
//! plugin are linearized, while the registry lock is only taken for lookups.
//! Plugin code runs under a timeout; a timeout leaves the plugin `Failed`.

pub mod health;
pub mod hooks;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::bus::MessageBus;
use crate::error::{ErrorKind, PluginError, PluginResult};
use crate::plugin::handle::PluginHandle;
use crate::plugin::metadata::PluginId;
use crate::plugin::registry::PluginRegistry;
use crate::plugin::resolver::{DependencyResolver, Resolution};
use crate::plugin::state::PluginState;
use crate::plugin::traits::HostContext;
use crate::services::ServiceRegistry;

pub use health::{HealthConfig, HealthMonitor, HealthReport};
pub use hooks::{HookPoint, HookRegistry, HookToken, LifecycleHook};

/// Lifecycle timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Bound on initialize, pause, resume, configure and command calls
    pub operation_timeout: Duration,
    /// Bound on shutdown
    pub grace_period: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_millis(30_000),
            grace_period: Duration::from_millis(5_000),
        }
    }
}

/// Per-plugin result of a batch operation
#[derive(Debug, Clone, Serialize)]
pub enum Outcome {
    Ok,
    Failed(PluginError),
    /// Not attempted
    Skipped(PluginError),
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped(_))
    }

    pub fn error(&self) -> Option<&PluginError> {
        match self {
            Outcome::Ok => None,
            Outcome::Failed(e) | Outcome::Skipped(e) => Some(e),
        }
    }
}

/// Ordered per-plugin outcomes of a batch operation
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub operation: String,
    pub outcomes: Vec<(PluginId, Outcome)>,
}

impl BatchReport {
    fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            outcomes: Vec::new(),
        }
    }

    fn push(&mut self, id: &str, outcome: Outcome) {
        self.outcomes.push((id.to_string(), outcome));
    }

    pub fn outcome(&self, id: &str) -> Option<&Outcome> {
        self.outcomes.iter().find(|(pid, _)| pid == id).map(|(_, o)| o)
    }

    /// Plugin ids in processing order
    pub fn order(&self) -> Vec<&str> {
        self.outcomes.iter().map(|(id, _)| id.as_str()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| o.is_ok())
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.filtered(Outcome::is_ok)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.filtered(Outcome::is_failed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.filtered(Outcome::is_skipped)
    }

    fn filtered(&self, predicate: fn(&Outcome) -> bool) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| predicate(o))
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Drives plugins through their lifecycle
pub struct LifecycleManager {
    config: LifecycleConfig,
    registry: Arc<PluginRegistry>,
    bus: Arc<MessageBus>,
    services: Arc<ServiceRegistry>,
    hooks: Arc<HookRegistry>,
}

impl LifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        registry: Arc<PluginRegistry>,
        bus: Arc<MessageBus>,
        services: Arc<ServiceRegistry>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            config,
            registry,
            bus,
            services,
            hooks,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Add a handle and link it with its registered dependencies and dependents
    pub fn register(&self, handle: Arc<PluginHandle>) -> PluginResult<()> {
        let id = handle.id().to_string();
        self.registry.insert(handle.clone())?;
        let metadata = handle.metadata();
        for dep in metadata.dependencies.iter().chain(&metadata.optional_dependencies) {
            if let Some(provider) = self.registry.get(&dep.id) {
                provider.add_dependent(&id);
            }
        }
        for other in self.registry.handles() {
            let other_meta = other.metadata();
            let depends = other_meta
                .dependencies
                .iter()
                .chain(&other_meta.optional_dependencies)
                .any(|d| d.id == id);
            if depends {
                handle.add_dependent(other.id());
            }
        }
        debug!("Registered plugin '{}'", id);
        Ok(())
    }

    /// Remove a handle and unlink it from its dependencies
    pub fn unregister(&self, id: &str) -> PluginResult<Arc<PluginHandle>> {
        let handle = self.registry.remove(id)?;
        let metadata = handle.metadata();
        for dep in metadata.dependencies.iter().chain(&metadata.optional_dependencies) {
            if let Some(provider) = self.registry.get(&dep.id) {
                provider.remove_dependent(id);
            }
        }
        debug!("Unregistered plugin '{}'", id);
        Ok(handle)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    pub fn registered(&self) -> Vec<PluginId> {
        self.registry.ids()
    }

    pub fn state_of(&self, id: &str) -> Option<PluginState> {
        self.registry.state_of(id)
    }

    /// Run plugin code under `limit`
    pub(crate) async fn bounded<T, F>(&self, id: &str, operation: &str, limit: Duration, call: F) -> PluginResult<T>
    where
        F: Future<Output = PluginResult<T>>,
    {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(PluginError::timeout(format!(
                "Plugin '{}' did not finish {} within {:?}",
                id, operation, limit
            ))
            .with_plugin(id)
            .with_context("operation", operation)),
        }
    }

    /// Move a plugin to `Failed` and remember why
    pub fn mark_failed(&self, handle: &PluginHandle, error: &PluginError) {
        if handle.state_machine().mark_failed() {
            warn!("Plugin '{}' failed: {}", handle.id(), error);
        }
        handle.set_last_error(error.clone());
    }

    /// Every required dependency must be registered, satisfied and version compatible
    pub fn check_dependencies(&self, handle: &PluginHandle) -> PluginResult<()> {
        let id = handle.id();
        for dep in &handle.metadata().dependencies {
            let provider = self.registry.get(&dep.id).ok_or_else(|| {
                PluginError::dependency_unsatisfied(format!(
                    "'{}' requires '{}', which is not loaded",
                    id, dep.id
                ))
                .with_plugin(id)
                .with_context("dependency", dep.id.clone())
            })?;
            let state = provider.state();
            if !state.satisfies_dependents() {
                return Err(PluginError::dependency_unsatisfied(format!(
                    "'{}' requires '{}', which is {}",
                    id, dep.id, state
                ))
                .with_plugin(id)
                .with_context("dependency", dep.id.clone())
                .with_context("state", state.as_str()));
            }
            if !dep.accepts(&provider.metadata().version) {
                return Err(PluginError::dependency_unsatisfied(format!(
                    "'{}' requires {} but v{} is loaded",
                    id,
                    dep,
                    provider.metadata().version
                ))
                .with_plugin(id)
                .with_context("dependency", dep.id.clone()));
            }
        }
        Ok(())
    }

    /// `Loaded -> Initializing -> Running`; on failure the plugin is left `Failed`
    pub async fn initialize(&self, id: &str) -> PluginResult<()> {
        let handle = self.registry.require(id)?;
        let mut instance = handle.instance().lock().await;
        match handle.state() {
            PluginState::Running => return Ok(()),
            PluginState::Loaded => {}
            other => {
                return Err(PluginError::invalid_state(format!(
                    "Cannot initialize plugin '{}' while {}",
                    id, other
                ))
                .with_plugin(id)
                .with_context("state", other.as_str()));
            }
        }
        self.check_dependencies(&handle)?;
        self.hooks.run(HookPoint::PreInitialize, id, Some(handle.as_ref()))?;

        handle
            .state_machine()
            .transition_from(PluginState::Loaded, PluginState::Initializing)?;
        let context = HostContext::new(id, &self.bus, &self.services);
        let result = self
            .bounded(id, "initialize", self.config.operation_timeout, instance.initialize(&context))
            .await;
        if let Err(e) = result {
            let e = match e.kind() {
                ErrorKind::InitializationFailed | ErrorKind::Timeout => e.with_plugin(id),
                _ => PluginError::initialization_failed(format!(
                    "Plugin '{}' failed to initialize: {}",
                    id,
                    e.message()
                ))
                .with_plugin(id)
                .with_cause(e),
            };
            self.mark_failed(&handle, &e);
            return Err(e);
        }

        handle
            .state_machine()
            .transition_from(PluginState::Initializing, PluginState::Running)?;
        handle.clear_last_error();
        handle.touch();
        drop(instance);
        info!("Plugin '{}' is running", id);
        self.hooks.run(HookPoint::PostInitialize, id, Some(handle.as_ref()))
    }

    /// `Running -> Paused`
    pub async fn pause(&self, id: &str) -> PluginResult<()> {
        self.toggle(id, PluginState::Running, PluginState::Paused, "pause").await
    }

    /// `Paused -> Running`
    pub async fn resume(&self, id: &str) -> PluginResult<()> {
        self.toggle(id, PluginState::Paused, PluginState::Running, "resume").await
    }

    async fn toggle(&self, id: &str, from: PluginState, to: PluginState, operation: &str) -> PluginResult<()> {
        let handle = self.registry.require(id)?;
        let mut instance = handle.instance().lock().await;
        let current = handle.state();
        if current == to {
            return Ok(());
        }
        if current != from {
            return Err(PluginError::invalid_state(format!(
                "Cannot {} plugin '{}' while {}",
                operation, id, current
            ))
            .with_plugin(id)
            .with_context("state", current.as_str()));
        }
        let limit = self.config.operation_timeout;
        let result = if to == PluginState::Paused {
            self.bounded(id, operation, limit, instance.pause()).await
        } else {
            self.bounded(id, operation, limit, instance.resume()).await
        };
        match result {
            Ok(()) => {
                handle.state_machine().transition_from(from, to)?;
                handle.touch();
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::Timeout => {
                self.mark_failed(&handle, &e);
                Err(e)
            }
            // the plugin refused; it stays where it was
            Err(e) => Err(e.with_plugin(id)),
        }
    }

    /// Stop a running or paused plugin.
    ///
    /// Refused with `ResourceBusy` while a running dependent relies on it.
    pub async fn stop(&self, id: &str) -> PluginResult<()> {
        self.stop_inner(id, false).await
    }

    pub(crate) async fn stop_inner(&self, id: &str, ignore_dependents: bool) -> PluginResult<()> {
        let handle = self.registry.require(id)?;
        let mut instance = handle.instance().lock().await;
        let current = handle.state();
        match current {
            PluginState::Stopped => return Ok(()),
            PluginState::Running | PluginState::Paused => {}
            other => {
                return Err(PluginError::invalid_state(format!(
                    "Cannot stop plugin '{}' while {}",
                    id, other
                ))
                .with_plugin(id)
                .with_context("state", other.as_str()));
            }
        }
        if !ignore_dependents {
            let busy: Vec<PluginId> = self
                .registry
                .dependents_of(id)
                .into_iter()
                .filter(|d| self.registry.state_of(d).map_or(false, |s| s.satisfies_dependents()))
                .collect();
            if !busy.is_empty() {
                return Err(PluginError::resource_busy(format!(
                    "Plugin '{}' is still required by {}",
                    id,
                    busy.join(", ")
                ))
                .with_plugin(id)
                .with_context("dependents", busy));
            }
        }
        self.hooks.run(HookPoint::PreStop, id, Some(handle.as_ref()))?;

        let machine = handle.state_machine();
        if current == PluginState::Paused {
            // stopping is only reachable from Running
            machine.transition_from(PluginState::Paused, PluginState::Running)?;
        }
        machine.transition_from(PluginState::Running, PluginState::Stopping)?;
        let grace = self.config.grace_period;
        let stopped = self
            .bounded(id, "shutdown", grace, async {
                instance.shutdown().await;
                Ok::<(), PluginError>(())
            })
            .await;
        if let Err(e) = stopped {
            self.mark_failed(&handle, &e);
            return Err(e);
        }
        machine.transition_from(PluginState::Stopping, PluginState::Stopped)?;
        handle.touch();
        drop(instance);
        info!("Plugin '{}' stopped", id);
        self.hooks.run(HookPoint::PostStop, id, Some(handle.as_ref()))
    }

    /// Stop if needed, cycle the state back to `Loaded` and initialize again
    pub async fn restart(&self, id: &str) -> PluginResult<()> {
        let handle = self.registry.require(id)?;
        if matches!(handle.state(), PluginState::Running | PluginState::Paused) {
            self.stop_inner(id, true).await?;
        }
        {
            let _instance = handle.instance().lock().await;
            let machine = handle.state_machine();
            match machine.current_state() {
                PluginState::Stopped | PluginState::Failed => {
                    machine.transition_to(PluginState::Unloaded)?;
                    machine.transition_to(PluginState::Loading)?;
                    machine.transition_to(PluginState::Loaded)?;
                }
                PluginState::Loaded => {}
                other => {
                    return Err(PluginError::invalid_state(format!(
                        "Cannot restart plugin '{}' while {}",
                        id, other
                    ))
                    .with_plugin(id)
                    .with_context("state", other.as_str()));
                }
            }
        }
        info!("Restarting plugin '{}'", id);
        self.initialize(id).await
    }

    fn resolve(&self) -> Resolution {
        let mut resolver = DependencyResolver::new();
        for handle in self.registry.handles() {
            resolver.add(handle.id(), handle.metadata().dependency_ids());
        }
        resolver.partition()
    }

    /// Initialize every registered plugin in dependency order.
    ///
    /// Dependents of a plugin that fails are skipped; plugins already running
    /// are left alone and reported as `Ok`.
    pub async fn initialize_all(&self) -> BatchReport {
        let resolution = self.resolve();
        let mut report = BatchReport::new("initialize");
        let mut unavailable: BTreeSet<PluginId> = BTreeSet::new();

        for id in &resolution.order {
            let handle = match self.registry.get(id) {
                Some(handle) => handle,
                None => continue,
            };
            if handle.state().satisfies_dependents() {
                report.push(id, Outcome::Ok);
                continue;
            }
            let blocked_by: Vec<String> = handle
                .metadata()
                .dependency_ids()
                .into_iter()
                .filter(|dep| unavailable.contains(*dep))
                .map(String::from)
                .collect();
            if !blocked_by.is_empty() {
                unavailable.insert(id.clone());
                report.push(
                    id,
                    Outcome::Skipped(
                        PluginError::dependency_unsatisfied(format!(
                            "'{}' skipped because {} did not initialize",
                            id,
                            blocked_by.join(", ")
                        ))
                        .with_plugin(id)
                        .with_context("dependencies", blocked_by),
                    ),
                );
                continue;
            }
            match self.initialize(id).await {
                Ok(()) => report.push(id, Outcome::Ok),
                Err(e) => {
                    unavailable.insert(id.clone());
                    if e.kind() == ErrorKind::DependencyUnsatisfied {
                        report.push(id, Outcome::Skipped(e));
                    } else {
                        report.push(id, Outcome::Failed(e));
                    }
                }
            }
        }

        for id in &resolution.blocked {
            let error = match resolution.cycles.iter().find(|cycle| cycle.contains(id)) {
                Some(cycle) => PluginError::dependency_cycle(cycle).with_plugin(id),
                None => PluginError::dependency_unsatisfied(format!(
                    "'{}' depends on a dependency cycle",
                    id
                ))
                .with_plugin(id),
            };
            report.push(id, Outcome::Skipped(error));
        }

        if report.is_success() {
            info!("Initialized {} plugin(s)", report.outcomes.len());
        } else {
            warn!(
                "Initialization incomplete: failed {:?}, skipped {:?}",
                report.failed(),
                report.skipped()
            );
        }
        report
    }

    /// Stop every running or paused plugin in reverse dependency order
    pub async fn stop_all(&self) -> BatchReport {
        let resolution = self.resolve();
        let mut order = resolution.order;
        order.extend(resolution.blocked);
        order.reverse();

        let mut report = BatchReport::new("stop");
        for id in &order {
            let state = match self.registry.state_of(id) {
                Some(state) => state,
                None => continue,
            };
            if !state.satisfies_dependents() {
                report.push(
                    id,
                    Outcome::Skipped(
                        PluginError::invalid_state(format!("Plugin '{}' is {}", id, state))
                            .with_plugin(id)
                            .with_context("state", state.as_str()),
                    ),
                );
                continue;
            }
            match self.stop_inner(id, true).await {
                Ok(()) => report.push(id, Outcome::Ok),
                Err(e) => report.push(id, Outcome::Failed(e)),
            }
        }
        info!("Stopped {} plugin(s)", report.succeeded().len());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::tests::mock_plugins::{mock_handle, MockPlugin, MockProbe};

    fn manager() -> LifecycleManager {
        LifecycleManager::new(
            LifecycleConfig::default(),
            Arc::new(PluginRegistry::new()),
            Arc::new(MessageBus::default()),
            Arc::new(ServiceRegistry::new()),
            Arc::new(HookRegistry::new()),
        )
    }

    fn chain(lifecycle: &LifecycleManager, probe: &Arc<MockProbe>, failing: Option<&str>) {
        for (id, dep) in [("a", None), ("b", Some("a")), ("c", Some("b"))] {
            let mut plugin = MockPlugin::new(id).with_probe(probe);
            if let Some(dep) = dep {
                plugin = plugin.with_dependency(dep);
            }
            if failing == Some(id) {
                plugin = plugin.failing_initialize();
            }
            lifecycle.register(mock_handle(plugin)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_initialize_and_stop() {
        let lifecycle = manager();
        lifecycle.register(mock_handle(MockPlugin::new("a"))).unwrap();
        assert!(lifecycle.is_registered("a"));

        lifecycle.initialize("a").await.unwrap();
        assert_eq!(lifecycle.state_of("a"), Some(PluginState::Running));
        // initialize again is a no-op
        lifecycle.initialize("a").await.unwrap();

        lifecycle.pause("a").await.unwrap();
        assert_eq!(lifecycle.state_of("a"), Some(PluginState::Paused));
        lifecycle.resume("a").await.unwrap();
        lifecycle.stop("a").await.unwrap();
        assert_eq!(lifecycle.state_of("a"), Some(PluginState::Stopped));

        let err = lifecycle.pause("a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_initialize_failure_marks_failed() {
        let lifecycle = manager();
        lifecycle
            .register(mock_handle(MockPlugin::new("a").failing_initialize()))
            .unwrap();
        let err = lifecycle.initialize("a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InitializationFailed);
        let handle = lifecycle.registry().require("a").unwrap();
        assert_eq!(handle.state(), PluginState::Failed);
        assert!(handle.last_error().is_some());

        let history: Vec<PluginState> = handle
            .state_machine()
            .history()
            .iter()
            .map(|change| change.new)
            .collect();
        assert_eq!(history, vec![PluginState::Initializing, PluginState::Failed]);
    }

    #[tokio::test]
    async fn test_dependencies_must_be_running() {
        let lifecycle = manager();
        lifecycle.register(mock_handle(MockPlugin::new("a"))).unwrap();
        lifecycle
            .register(mock_handle(MockPlugin::new("b").with_dependency("a")))
            .unwrap();

        let err = lifecycle.initialize("b").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyUnsatisfied);
        assert_eq!(lifecycle.state_of("b"), Some(PluginState::Loaded));

        lifecycle.initialize("a").await.unwrap();
        lifecycle.initialize("b").await.unwrap();

        let err = lifecycle.stop("a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceBusy);
        assert_eq!(
            lifecycle.registry().require("a").unwrap().dependents(),
            vec!["b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_initialize_all_in_dependency_order() {
        let lifecycle = manager();
        let probe = MockProbe::new();
        chain(&lifecycle, &probe, None);

        let report = lifecycle.initialize_all().await;
        assert!(report.is_success());
        assert_eq!(report.order(), vec!["a", "b", "c"]);
        assert_eq!(probe.calls(), vec!["a:initialize", "b:initialize", "c:initialize"]);

        let report = lifecycle.stop_all().await;
        assert_eq!(report.order(), vec!["c", "b", "a"]);
        assert_eq!(
            probe.calls()[3..].to_vec(),
            vec!["c:shutdown", "b:shutdown", "a:shutdown"]
        );
    }

    #[tokio::test]
    async fn test_failed_initialize_skips_dependents() {
        let lifecycle = manager();
        let probe = MockProbe::new();
        chain(&lifecycle, &probe, Some("b"));

        let report = lifecycle.initialize_all().await;
        assert!(report.outcome("a").unwrap().is_ok());
        assert_eq!(
            report.outcome("b").unwrap().error().unwrap().kind(),
            ErrorKind::InitializationFailed
        );
        let skipped = report.outcome("c").unwrap();
        assert!(skipped.is_skipped());
        assert_eq!(skipped.error().unwrap().kind(), ErrorKind::DependencyUnsatisfied);

        assert_eq!(lifecycle.state_of("a"), Some(PluginState::Running));
        assert_eq!(lifecycle.state_of("b"), Some(PluginState::Failed));
        assert_eq!(lifecycle.state_of("c"), Some(PluginState::Loaded));
        assert_eq!(probe.count("initialize"), 2);
    }

    #[tokio::test]
    async fn test_cycles_are_not_initialized() {
        let lifecycle = manager();
        lifecycle
            .register(mock_handle(MockPlugin::new("x").with_dependency("y")))
            .unwrap();
        lifecycle
            .register(mock_handle(MockPlugin::new("y").with_dependency("x")))
            .unwrap();
        lifecycle
            .register(mock_handle(MockPlugin::new("z").with_dependency("x")))
            .unwrap();
        lifecycle.register(mock_handle(MockPlugin::new("free"))).unwrap();

        let report = lifecycle.initialize_all().await;
        assert!(report.outcome("free").unwrap().is_ok());
        assert_eq!(
            report.outcome("x").unwrap().error().unwrap().kind(),
            ErrorKind::DependencyCycle
        );
        assert_eq!(
            report.outcome("z").unwrap().error().unwrap().kind(),
            ErrorKind::DependencyUnsatisfied
        );
        assert_eq!(lifecycle.state_of("x"), Some(PluginState::Loaded));
    }

    #[tokio::test]
    async fn test_restart_cycles_through_loaded() {
        let lifecycle = manager();
        let probe = MockProbe::new();
        lifecycle
            .register(mock_handle(MockPlugin::new("a").with_probe(&probe)))
            .unwrap();
        lifecycle.initialize("a").await.unwrap();
        lifecycle.pause("a").await.unwrap();

        lifecycle.restart("a").await.unwrap();
        assert_eq!(lifecycle.state_of("a"), Some(PluginState::Running));
        assert_eq!(probe.count("initialize"), 2);
        assert_eq!(probe.count("shutdown"), 1);

        let states: Vec<PluginState> = lifecycle
            .registry()
            .require("a")
            .unwrap()
            .state_machine()
            .history()
            .iter()
            .map(|change| change.new)
            .collect();
        for pair in states.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[tokio::test]
    async fn test_initialize_timeout_fails_plugin() {
        let lifecycle = LifecycleManager::new(
            LifecycleConfig {
                operation_timeout: Duration::from_millis(20),
                grace_period: Duration::from_millis(20),
            },
            Arc::new(PluginRegistry::new()),
            Arc::new(MessageBus::default()),
            Arc::new(ServiceRegistry::new()),
            Arc::new(HookRegistry::new()),
        );
        lifecycle
            .register(mock_handle(
                MockPlugin::new("slow").with_initialize_delay(Duration::from_secs(5)),
            ))
            .unwrap();
        let err = lifecycle.initialize("slow").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(lifecycle.state_of("slow"), Some(PluginState::Failed));
    }

    #[tokio::test]
    async fn test_pre_hook_blocks_initialize() {
        let lifecycle = manager();
        lifecycle.register(mock_handle(MockPlugin::new("a"))).unwrap();
        let token = lifecycle.hooks().register(HookPoint::PreInitialize, |id, handle| {
            assert!(handle.is_some());
            Err(PluginError::invalid_state(format!("{} is not allowed", id)))
        });
        assert!(lifecycle.initialize("a").await.is_err());
        assert_eq!(lifecycle.state_of("a"), Some(PluginState::Loaded));

        lifecycle.hooks().unregister(token);
        lifecycle.initialize("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_unlinks_dependents() {
        let lifecycle = manager();
        lifecycle.register(mock_handle(MockPlugin::new("a"))).unwrap();
        lifecycle
            .register(mock_handle(MockPlugin::new("b").with_dependency("a")))
            .unwrap();
        lifecycle.unregister("b").unwrap();
        assert!(lifecycle.registry().require("a").unwrap().dependents().is_empty());
        assert_eq!(lifecycle.registered(), vec!["a".to_string()]);
        assert_eq!(lifecycle.unregister("b").unwrap_err().kind(), ErrorKind::NotLoaded);
    }
}
