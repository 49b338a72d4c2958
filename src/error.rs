//! Plugin Host Error Types
//!
//! Every fallible host operation returns a [`PluginResult`]. Errors carry a
//! flat [`ErrorKind`], a human-readable message and a JSON context object
//! captured at the point of failure (at least the plugin id or artifact path
//! when one is known).

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Result type for plugin host operations
pub type PluginResult<T> = Result<T, PluginError>;

/// Flat enumeration of every failure the host can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    FileNotFound,
    InvalidPath,
    UnsupportedFormat,
    SymbolNotFound,
    MetadataInvalid,
    IncompatibleVersion,
    AlreadyLoaded,
    NotLoaded,
    LoadFailed,
    InitializationFailed,
    ConfigurationError,
    InvalidParameters,
    InvalidState,
    CommandNotFound,
    DependencyUnsatisfied,
    DependencyCycle,
    Timeout,
    BackpressureDropped,
    TransactionAborted,
    ResourceBusy,
    InternalError,
}

impl ErrorKind {
    /// Stable string code for the kind
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::FileNotFound => "FileNotFound",
            ErrorKind::InvalidPath => "InvalidPath",
            ErrorKind::UnsupportedFormat => "UnsupportedFormat",
            ErrorKind::SymbolNotFound => "SymbolNotFound",
            ErrorKind::MetadataInvalid => "MetadataInvalid",
            ErrorKind::IncompatibleVersion => "IncompatibleVersion",
            ErrorKind::AlreadyLoaded => "AlreadyLoaded",
            ErrorKind::NotLoaded => "NotLoaded",
            ErrorKind::LoadFailed => "LoadFailed",
            ErrorKind::InitializationFailed => "InitializationFailed",
            ErrorKind::ConfigurationError => "ConfigurationError",
            ErrorKind::InvalidParameters => "InvalidParameters",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::CommandNotFound => "CommandNotFound",
            ErrorKind::DependencyUnsatisfied => "DependencyUnsatisfied",
            ErrorKind::DependencyCycle => "DependencyCycle",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::BackpressureDropped => "BackpressureDropped",
            ErrorKind::TransactionAborted => "TransactionAborted",
            ErrorKind::ResourceBusy => "ResourceBusy",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A typed host error with structured context
#[derive(Error, Debug, Clone, Serialize)]
#[error("{kind}: {message}")]
pub struct PluginError {
    #[serde(rename = "code")]
    kind: ErrorKind,
    message: String,
    context: Value,
    #[source]
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<Box<PluginError>>,
}

impl PluginError {
    /// Create an error of the given kind
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Value::Object(Map::new()),
            cause: None,
        }
    }

    pub fn file_not_found(path: &Path) -> Self {
        Self::new(ErrorKind::FileNotFound, format!("Artifact not found: {}", path.display()))
            .with_path(path)
    }

    pub fn invalid_path<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::InvalidPath, message)
    }

    pub fn unsupported_format<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::UnsupportedFormat, message)
    }

    pub fn symbol_not_found<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::SymbolNotFound, message)
    }

    pub fn metadata_invalid<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::MetadataInvalid, message)
    }

    pub fn incompatible_version<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::IncompatibleVersion, message)
    }

    pub fn already_loaded(plugin_id: &str) -> Self {
        Self::new(ErrorKind::AlreadyLoaded, format!("Plugin already loaded: {}", plugin_id))
            .with_plugin(plugin_id)
    }

    pub fn not_loaded(plugin_id: &str) -> Self {
        Self::new(ErrorKind::NotLoaded, format!("Plugin not loaded: {}", plugin_id))
            .with_plugin(plugin_id)
    }

    pub fn load_failed<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::LoadFailed, message)
    }

    pub fn initialization_failed<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::InitializationFailed, message)
    }

    pub fn configuration_error<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::ConfigurationError, message)
    }

    pub fn invalid_parameters<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::InvalidParameters, message)
    }

    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn command_not_found(plugin_id: &str, command: &str) -> Self {
        Self::new(
            ErrorKind::CommandNotFound,
            format!("Plugin '{}' has no command '{}'", plugin_id, command),
        )
        .with_plugin(plugin_id)
        .with_context("command", command)
    }

    pub fn dependency_unsatisfied<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::DependencyUnsatisfied, message)
    }

    pub fn dependency_cycle(cycle: &[String]) -> Self {
        Self::new(
            ErrorKind::DependencyCycle,
            format!("Dependency cycle detected: {}", cycle.join(" -> ")),
        )
        .with_context("cycle", cycle.to_vec())
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn backpressure_dropped<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::BackpressureDropped, message)
    }

    /// Aggregated transaction failure wrapping the operation error that caused it
    pub fn transaction_aborted<S: Into<String>>(message: S, cause: Option<PluginError>) -> Self {
        let mut error = Self::new(ErrorKind::TransactionAborted, message);
        error.cause = cause.map(Box::new);
        error
    }

    pub fn resource_busy<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::ResourceBusy, message)
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    /// Attach a context entry
    pub fn with_context<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        if !self.context.is_object() {
            self.context = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.context {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Attach the plugin id to the context
    pub fn with_plugin(self, plugin_id: &str) -> Self {
        self.with_context("plugin_id", plugin_id)
    }

    /// Attach an artifact path to the context
    pub fn with_path(self, path: &Path) -> Self {
        self.with_context("path", path.display().to_string())
    }

    /// Attach an underlying cause
    pub fn with_cause(mut self, cause: PluginError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &Value {
        &self.context
    }

    pub fn cause(&self) -> Option<&PluginError> {
        self.cause.as_deref()
    }

    /// Innermost error in the cause chain
    pub fn root_cause(&self) -> &PluginError {
        let mut current = self;
        while let Some(next) = current.cause() {
            current = next;
        }
        current
    }

    /// Plugin id recorded in the context, if any
    pub fn plugin_id(&self) -> Option<&str> {
        self.context.get("plugin_id").and_then(Value::as_str)
    }

    /// Check if the caller may reasonably retry the operation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Timeout | ErrorKind::BackpressureDropped | ErrorKind::ResourceBusy
        )
    }

    /// Check if error is related to plugin lifecycle
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::InitializationFailed
                | ErrorKind::InvalidState
                | ErrorKind::AlreadyLoaded
                | ErrorKind::NotLoaded
                | ErrorKind::LoadFailed
        )
    }

    /// Check if error comes from dependency resolution
    pub fn is_dependency_error(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::DependencyUnsatisfied | ErrorKind::DependencyCycle
        )
    }
}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                PluginError::new(ErrorKind::FileNotFound, format!("IO error: {}", err))
            }
            std::io::ErrorKind::PermissionDenied => {
                PluginError::invalid_path(format!("IO error: {}", err))
            }
            _ => PluginError::internal(format!("IO error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        PluginError::invalid_parameters(format!("JSON error: {}", err))
    }
}

impl From<libloading::Error> for PluginError {
    fn from(err: libloading::Error) -> Self {
        PluginError::load_failed(format!("Dynamic library error: {}", err))
    }
}

impl From<notify::Error> for PluginError {
    fn from(err: notify::Error) -> Self {
        PluginError::internal(format!("File watcher error: {}", err))
    }
}

impl From<tokio::task::JoinError> for PluginError {
    fn from(err: tokio::task::JoinError) -> Self {
        PluginError::internal(format!("Task join error: {}", err))
    }
}
