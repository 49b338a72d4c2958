//! Service Contract Registry
//!
//! Plugins publish named, versioned contracts describing the methods they
//! offer. The registry only describes services; callers dispatch through the
//! message bus (using the endpoint's request type) or a direct plugin command.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, PluginError, PluginResult};
use crate::plugin::metadata::{Capabilities, PluginId};
use crate::version::Version;

/// One callable method of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub capability_flags: Capabilities,
    pub timeout_ms: u64,
}

impl MethodDescriptor {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: Value::Null,
            output_schema: Value::Null,
            capability_flags: Capabilities::empty(),
            timeout_ms: 5_000,
        }
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schemas(mut self, input: Value, output: Value) -> Self {
        self.input_schema = input;
        self.output_schema = output;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// A named, versioned set of methods
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceContract {
    pub service_name: String,
    pub version: Version,
    pub description: String,
    pub methods: Vec<MethodDescriptor>,
    pub dependencies: Vec<String>,
    pub capabilities: Capabilities,
    pub metadata: Value,
}

impl ServiceContract {
    pub fn new<S: Into<String>>(service_name: S, version: Version) -> Self {
        Self {
            service_name: service_name.into(),
            version,
            description: String::new(),
            methods: Vec::new(),
            dependencies: Vec::new(),
            capabilities: Capabilities::SERVICE,
            metadata: Value::Null,
        }
    }

    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Same service name and a compatible version
    pub fn is_compatible_with(&self, other: &ServiceContract) -> bool {
        self.service_name == other.service_name && self.version.is_compatible_with(&other.version)
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    fn validate(&self) -> PluginResult<()> {
        if self.service_name.trim().is_empty() {
            return Err(PluginError::invalid_parameters("Service name must not be empty"));
        }
        let mut names: Vec<&str> = self.methods.iter().map(|m| m.name.as_str()).collect();
        if names.iter().any(|n| n.trim().is_empty()) {
            return Err(PluginError::invalid_parameters("Method names must not be empty")
                .with_context("service", self.service_name.clone()));
        }
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(PluginError::invalid_parameters(format!(
                "Duplicate method '{}' in service '{}'",
                pair[0], self.service_name
            ))
            .with_context("service", self.service_name.clone()));
        }
        Ok(())
    }
}

/// A registered contract plus the reference needed to call it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub contract: ServiceContract,
    pub provider_id: PluginId,
    pub registered_at: DateTime<Utc>,
}

impl ServiceEndpoint {
    /// Bus message type for calls to `method`
    pub fn request_type(&self, method: &str) -> String {
        format!("service.{}.{}", self.contract.service_name, method)
    }
}

/// Registry of service contracts indexed by name then version
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<BTreeMap<String, BTreeMap<Version, ServiceEndpoint>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contract on behalf of `provider_id`
    pub fn register(&self, provider_id: &str, contract: ServiceContract) -> PluginResult<ServiceEndpoint> {
        contract.validate()?;
        let mut services = self.services.write();
        let versions = services.entry(contract.service_name.clone()).or_default();
        if let Some(existing) = versions.get(&contract.version) {
            return Err(PluginError::new(
                ErrorKind::AlreadyLoaded,
                format!(
                    "Service '{}' v{} is already provided by '{}'",
                    contract.service_name, contract.version, existing.provider_id
                ),
            )
            .with_plugin(provider_id)
            .with_context("service", contract.service_name.clone()));
        }
        let endpoint = ServiceEndpoint {
            contract,
            provider_id: provider_id.to_string(),
            registered_at: Utc::now(),
        };
        log::debug!(
            "Service '{}' v{} registered by '{}'",
            endpoint.contract.service_name,
            endpoint.contract.version,
            provider_id
        );
        versions.insert(endpoint.contract.version.clone(), endpoint.clone());
        Ok(endpoint)
    }

    pub fn unregister(&self, service_name: &str, version: &Version) -> bool {
        let mut services = self.services.write();
        let removed = services
            .get_mut(service_name)
            .map_or(false, |versions| versions.remove(version).is_some());
        if services.get(service_name).map_or(false, |v| v.is_empty()) {
            services.remove(service_name);
        }
        removed
    }

    /// Remove every contract a plugin registered
    pub fn unregister_provider(&self, provider_id: &str) -> usize {
        let mut services = self.services.write();
        let mut removed = 0;
        for versions in services.values_mut() {
            let before = versions.len();
            versions.retain(|_, endpoint| endpoint.provider_id != provider_id);
            removed += before - versions.len();
        }
        services.retain(|_, versions| !versions.is_empty());
        removed
    }

    /// Exact lookup
    pub fn get(&self, service_name: &str, version: &Version) -> Option<ServiceEndpoint> {
        self.services
            .read()
            .get(service_name)
            .and_then(|versions| versions.get(version))
            .cloned()
    }

    /// All versions of `service_name` declaring `required` capabilities, newest first
    pub fn discover(&self, service_name: &str, required: Capabilities) -> Vec<ServiceEndpoint> {
        self.services
            .read()
            .get(service_name)
            .map(|versions| {
                versions
                    .values()
                    .rev()
                    .filter(|endpoint| endpoint.contract.capabilities.contains(required))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Newest registered version compatible with `required`
    pub fn find_compatible(&self, service_name: &str, required: &Version) -> Option<ServiceEndpoint> {
        self.services.read().get(service_name).and_then(|versions| {
            versions
                .values()
                .rev()
                .find(|endpoint| endpoint.contract.version.is_compatible_with(required))
                .cloned()
        })
    }

    /// Resolve a method of a compatible service
    pub fn resolve_method(
        &self,
        service_name: &str,
        required: &Version,
        method: &str,
    ) -> PluginResult<(ServiceEndpoint, MethodDescriptor)> {
        let endpoint = self.find_compatible(service_name, required).ok_or_else(|| {
            PluginError::dependency_unsatisfied(format!(
                "No service '{}' compatible with {}",
                service_name, required
            ))
            .with_context("service", service_name)
        })?;
        let descriptor = endpoint.contract.method(method).cloned().ok_or_else(|| {
            PluginError::new(
                ErrorKind::CommandNotFound,
                format!("Service '{}' has no method '{}'", service_name, method),
            )
            .with_plugin(&endpoint.provider_id)
            .with_context("method", method)
        })?;
        Ok((endpoint, descriptor))
    }

    /// Every endpoint, ordered by name then version
    pub fn list(&self) -> Vec<ServiceEndpoint> {
        self.services
            .read()
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}
