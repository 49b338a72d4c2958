//! Core Plugin Traits
//!
//! The contract every plugin satisfies, and the host services handed to a
//! plugin when it is initialized.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::Level;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bus::{DeliveryMode, Message, MessageBus};
use crate::error::{PluginError, PluginResult};
use crate::plugin::metadata::{Capabilities, PluginDependency, PluginMetadata, Priority};
use crate::plugin::state::PluginState;
use crate::services::ServiceRegistry;

/// Result of a plugin health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
    pub error_count: u64,
    pub last_check: DateTime<Utc>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: "OK".to_string(),
            error_count: 0,
            last_check: Utc::now(),
        }
    }

    pub fn unhealthy<S: Into<String>>(message: S, error_count: u64) -> Self {
        Self {
            healthy: false,
            message: message.into(),
            error_count,
            last_check: Utc::now(),
        }
    }
}

/// A command a plugin accepts through `execute_command`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub name: String,
    pub description: String,
}

impl CommandDescriptor {
    pub fn new<N: Into<String>, D: Into<String>>(name: N, description: D) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Core plugin interface that all plugins must implement
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin metadata; must be pure and idempotent
    fn metadata(&self) -> &PluginMetadata;

    /// The plugin's own view of its state. The host's state machine is authoritative.
    fn state(&self) -> PluginState;

    fn capabilities(&self) -> Capabilities {
        self.metadata().capabilities
    }

    fn priority(&self) -> Priority {
        self.metadata().priority
    }

    fn dependencies(&self) -> Vec<PluginDependency> {
        self.metadata().dependencies.clone()
    }

    fn optional_dependencies(&self) -> Vec<PluginDependency> {
        self.metadata().optional_dependencies.clone()
    }

    /// Initialize the plugin with its host services
    async fn initialize(&mut self, context: &HostContext) -> PluginResult<()>;

    /// Release plugin resources. Must not fail.
    async fn shutdown(&mut self);

    /// Apply a configuration document
    async fn configure(&mut self, config: &Value) -> PluginResult<()>;

    /// Current effective configuration
    fn get_configuration(&self) -> Value;

    fn default_configuration(&self) -> Value {
        Value::Object(Map::new())
    }

    /// Run a named command
    async fn execute_command(&mut self, name: &str, params: Value) -> PluginResult<Value>;

    fn available_commands(&self) -> Vec<CommandDescriptor>;

    async fn check_health(&self) -> PluginResult<HealthStatus> {
        Ok(HealthStatus::healthy())
    }

    async fn pause(&mut self) -> PluginResult<()> {
        Ok(())
    }

    async fn resume(&mut self) -> PluginResult<()> {
        Ok(())
    }

    /// Called before the host swaps this instance out for a reloaded artifact
    async fn hot_reload(&mut self) -> PluginResult<()> {
        Ok(())
    }
}

/// Logger channel allocated to one plugin.
///
/// Records are emitted through the `log` facade with target `plugin::<id>`.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    target: String,
}

impl PluginLogger {
    pub fn new(plugin_id: &str) -> Self {
        Self {
            target: format!("plugin::{}", plugin_id),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn log(&self, level: Level, message: &str) {
        log::log!(target: self.target.as_str(), level, "{}", message);
    }

    pub fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }
}

/// Host services passed to a plugin at initialization.
///
/// References are non-owning; they stop resolving once the host is dropped.
#[derive(Clone)]
pub struct HostContext {
    plugin_id: String,
    bus: Weak<MessageBus>,
    services: Weak<ServiceRegistry>,
    logger: PluginLogger,
}

impl HostContext {
    pub fn new(plugin_id: &str, bus: &Arc<MessageBus>, services: &Arc<ServiceRegistry>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            bus: Arc::downgrade(bus),
            services: Arc::downgrade(services),
            logger: PluginLogger::new(plugin_id),
        }
    }

    /// A context with no live host services
    pub fn detached(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            bus: Weak::new(),
            services: Weak::new(),
            logger: PluginLogger::new(plugin_id),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    pub fn bus(&self) -> PluginResult<Arc<MessageBus>> {
        self.bus.upgrade().ok_or_else(|| {
            PluginError::invalid_state("Message bus is no longer available").with_plugin(&self.plugin_id)
        })
    }

    pub fn services(&self) -> PluginResult<Arc<ServiceRegistry>> {
        self.services.upgrade().ok_or_else(|| {
            PluginError::invalid_state("Service registry is no longer available")
                .with_plugin(&self.plugin_id)
        })
    }

    /// Publish a broadcast message on behalf of this plugin
    pub fn publish(&self, message_type: &str, payload: Value) -> PluginResult<()> {
        let bus = self.bus()?;
        bus.publish(
            Message::new(message_type, &self.plugin_id, payload).with_delivery(DeliveryMode::Broadcast),
        )
        .map(|_| ())
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("plugin_id", &self.plugin_id)
            .field("bus_alive", &(self.bus.strong_count() > 0))
            .field("services_alive", &(self.services.strong_count() > 0))
            .finish()
    }
}
