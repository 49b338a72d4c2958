//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;

use plughost::config::HostConfig;
use plughost::loader::StaticBackend;
use plughost::plugin::{
    Capabilities, CommandDescriptor, HealthStatus, HostContext, Plugin, PluginDependency, PluginMetadata,
    PluginState,
};
use plughost::{PluginError, PluginManager, PluginResult, Version};

/// Calls made by every test plugin of one host, as `"<id>:<call>"`
#[derive(Default)]
pub struct Journal {
    calls: Mutex<Vec<String>>,
    unhealthy: Mutex<HashSet<String>>,
    failing_init: Mutex<HashSet<String>>,
    blocked: AtomicBool,
}

impl Journal {
    pub fn record(&self, id: &str, call: &str) {
        self.calls.lock().push(format!("{}:{}", id, call));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls of one kind, in order, as plugin ids
    pub fn ids_for(&self, call: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| c.split_once(':'))
            .filter(|(_, name)| *name == call)
            .map(|(id, _)| id.to_string())
            .collect()
    }

    pub fn count(&self, id: &str, call: &str) -> usize {
        let wanted = format!("{}:{}", id, call);
        self.calls.lock().iter().filter(|c| **c == wanted).count()
    }

    pub fn set_healthy(&self, id: &str, healthy: bool) {
        if healthy {
            self.unhealthy.lock().remove(id);
        } else {
            self.unhealthy.lock().insert(id.to_string());
        }
    }

    pub fn fail_initialize(&self, id: &str, fail: bool) {
        if fail {
            self.failing_init.lock().insert(id.to_string());
        } else {
            self.failing_init.lock().remove(id);
        }
    }

    /// Make health checks hang until released
    pub fn block_health(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }
}

/// Plugin recording every call in a shared journal
pub struct TestPlugin {
    metadata: PluginMetadata,
    state: PluginState,
    config: Value,
    journal: Arc<Journal>,
}

impl TestPlugin {
    pub fn new(metadata: PluginMetadata, journal: Arc<Journal>) -> Self {
        Self {
            metadata,
            state: PluginState::Unloaded,
            config: json!({}),
            journal,
        }
    }

    fn record(&self, call: &str) {
        self.journal.record(&self.metadata.id, call);
    }
}

#[async_trait]
impl Plugin for TestPlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn state(&self) -> PluginState {
        self.state
    }

    async fn initialize(&mut self, context: &HostContext) -> PluginResult<()> {
        self.record("initialize");
        if self.journal.failing_init.lock().contains(&self.metadata.id) {
            return Err(PluginError::initialization_failed(format!(
                "{} refuses to start",
                self.metadata.id
            )));
        }
        context.logger().debug("started");
        self.state = PluginState::Running;
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.record("shutdown");
        self.state = PluginState::Stopped;
    }

    async fn configure(&mut self, config: &Value) -> PluginResult<()> {
        self.record("configure");
        if !config.is_object() {
            return Err(PluginError::configuration_error("configuration must be an object"));
        }
        self.config = config.clone();
        Ok(())
    }

    fn get_configuration(&self) -> Value {
        self.config.clone()
    }

    async fn execute_command(&mut self, name: &str, params: Value) -> PluginResult<Value> {
        self.record(name);
        match name {
            "echo" => Ok(params),
            "version" => Ok(json!(self.metadata.version.to_string())),
            _ => Err(PluginError::command_not_found(&self.metadata.id, name)),
        }
    }

    fn available_commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor::new("echo", "Return the parameters"),
            CommandDescriptor::new("version", "Report the running version"),
        ]
    }

    async fn check_health(&self) -> PluginResult<HealthStatus> {
        while self.journal.blocked.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if self.journal.unhealthy.lock().contains(&self.metadata.id) {
            Ok(HealthStatus::unhealthy("test plugin reports unhealthy", 1))
        } else {
            Ok(HealthStatus::healthy())
        }
    }

    async fn hot_reload(&mut self) -> PluginResult<()> {
        self.record("hot_reload");
        Ok(())
    }
}

/// One host with a static backend serving artifacts from a temp directory
pub struct TestHost {
    pub dir: TempDir,
    pub manager: PluginManager,
    pub backend: Arc<StaticBackend>,
    pub journal: Arc<Journal>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_config(HostConfig::default())
    }

    pub fn with_config(config: HostConfig) -> Self {
        let manager = PluginManager::new(config);
        let backend = Arc::new(StaticBackend::new());
        manager.add_backend(backend.clone());
        Self {
            dir: TempDir::new().expect("temp dir"),
            manager,
            backend,
            journal: Arc::new(Journal::default()),
        }
    }

    /// Version 1.0.0 artifact with required dependencies
    pub fn artifact(&self, id: &str, deps: &[&str]) -> PathBuf {
        let mut metadata = PluginMetadata::new(id, Version::new(1, 0, 0));
        for dep in deps {
            metadata = metadata.with_dependency(PluginDependency::new(*dep));
        }
        self.artifact_from(metadata)
    }

    /// Artifact declaring the hot-reload capability
    pub fn reloadable_artifact(&self, id: &str) -> PathBuf {
        self.artifact_from(
            PluginMetadata::new(id, Version::new(1, 0, 0)).with_capabilities(Capabilities::HOT_RELOAD),
        )
    }

    pub fn artifact_from(&self, metadata: PluginMetadata) -> PathBuf {
        let file_name = format!("{}.plugin", metadata.id);
        let path = self.dir.path().join(&file_name);
        fs::write(&path, format!("artifact {}", metadata.id)).expect("write artifact");
        let journal = self.journal.clone();
        self.backend
            .register(&file_name, move || {
                Box::new(TestPlugin::new(metadata.clone(), journal.clone())) as Box<dyn Plugin>
            })
            .expect("register static plugin");
        path
    }

    pub fn state(&self, id: &str) -> Option<PluginState> {
        self.manager.get_plugin(id).map(|snapshot| snapshot.state)
    }
}

/// Poll `condition` every 10 ms until it holds or `timeout` elapses
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
