//! plughost - a dynamic plugin host runtime
//!
//! Loads plugin artifacts, drives them through a validated lifecycle in
//! dependency order, and connects them through a message bus, a service
//! contract registry and two-phase transactions. [`manager::PluginManager`]
//! is the single entry point; every instance is independent.

pub mod error;
pub mod version;

pub mod bus;
pub mod hot_reload;
pub mod lifecycle;
pub mod loader;
pub mod manager;
pub mod plugin;
pub mod services;
pub mod transaction;

pub mod app;
pub mod cli;
pub mod config;
pub mod display;
pub mod logging;

pub use error::{ErrorKind, PluginError, PluginResult};
pub use manager::{PluginLoadOptions, PluginManager, SystemMetrics};
pub use plugin::{Capabilities, Plugin, PluginMetadata, PluginState};
pub use version::Version;
