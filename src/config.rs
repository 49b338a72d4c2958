use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use toml::Value;

use crate::bus::BusConfig;
use crate::hot_reload::HotReloadConfig;
use crate::lifecycle::{HealthConfig, LifecycleConfig};
use crate::loader::LoaderConfig;
use crate::transaction::TransactionConfig;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV: &str = "PLUGHOST_CONFIG";

/// Configuration storage - section_name -> key -> value
pub type Configuration = HashMap<String, HashMap<String, String>>;

/// Settings for every component of one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HostConfig {
    pub loader: LoaderConfig,
    /// Directories consulted for relative artifact paths
    pub search_paths: Vec<PathBuf>,
    pub lifecycle: LifecycleConfig,
    pub health: HealthConfig,
    pub bus: BusConfig,
    pub hot_reload: HotReloadConfig,
    pub transactions: TransactionConfig,
}

impl HostConfig {
    /// Reject settings no component can work with
    pub fn validate(&self) -> Result<()> {
        if self.loader.max_cache_size == 0 {
            anyhow::bail!("loader.max-cache-size must be greater than zero");
        }
        if self.loader.error_history_size == 0 {
            anyhow::bail!("loader.error-history-size must be greater than zero");
        }
        if self.lifecycle.operation_timeout.is_zero() || self.lifecycle.grace_period.is_zero() {
            anyhow::bail!("lifecycle timeouts must be greater than zero");
        }
        if self.health.interval.is_zero() || self.health.check_timeout.is_zero() {
            anyhow::bail!("health intervals must be greater than zero");
        }
        if self.health.failure_threshold == 0 {
            anyhow::bail!("health.failure-threshold must be at least 1");
        }
        if self.bus.queue_depth == 0 {
            anyhow::bail!("bus.queue-depth must be greater than zero");
        }
        if self.transactions.default_timeout.is_zero() {
            anyhow::bail!("transactions.default-timeout-ms must be greater than zero");
        }
        if self.transactions.reap_interval.is_zero() {
            anyhow::bail!("transactions.reap-interval-ms must be greater than zero");
        }
        Ok(())
    }
}

/// Configuration manager
pub struct ConfigManager {
    config: Configuration,
    config_file_path: Option<PathBuf>,
    selected_section: Option<String>,
}

impl ConfigManager {
    /// Create a new ConfigManager from a Configuration (primarily for testing)
    pub fn from_config(config: Configuration) -> Self {
        Self {
            config,
            config_file_path: None,
            selected_section: None,
        }
    }

    /// Load configuration using discovery hierarchy
    pub fn load() -> Result<Self> {
        debug!("Starting configuration discovery");

        for path in discover_config_files() {
            debug!("Attempting to load config from: {}", path.display());
            if path.exists() {
                return Self::load_from_file(path);
            }
        }

        info!("No configuration file found, using defaults");
        Ok(Self::from_config(Configuration::new()))
    }

    /// Load configuration from explicit file path
    pub fn load_from_file(path: PathBuf) -> Result<Self> {
        debug!("Loading configuration from file: {}", path.display());

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = parse_toml_config(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        info!("Loaded configuration from: {}", path.display());
        Ok(Self {
            config,
            config_file_path: Some(path),
            selected_section: None,
        })
    }

    pub fn config_file_path(&self) -> Option<&PathBuf> {
        self.config_file_path.as_ref()
    }

    /// Get value from configuration with section fallback
    pub fn get_value(&self, section: &str, key: &str) -> Option<&String> {
        // Priority: selected_section -> specified section -> base
        if let Some(selected) = &self.selected_section {
            if let Some(value) = self.config.get(selected).and_then(|s| s.get(key)) {
                return Some(value);
            }
        }

        if let Some(value) = self.config.get(section).and_then(|s| s.get(key)) {
            return Some(value);
        }

        self.config.get("base").and_then(|s| s.get(key))
    }

    /// Select an override section consulted before all others
    pub fn select_section(&mut self, section: String) {
        debug!("Selecting configuration section: {}", section);
        self.selected_section = Some(section);
    }

    /// Get boolean value with type conversion
    pub fn get_bool(&self, section: &str, key: &str) -> Result<Option<bool>> {
        match self.get_value(section, key) {
            Some(value) => match value.to_lowercase().as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(anyhow::anyhow!("Invalid boolean value for {}.{}: {}", section, key, value)),
            },
            None => Ok(None),
        }
    }

    pub fn get_u64(&self, section: &str, key: &str) -> Result<Option<u64>> {
        match self.get_value(section, key) {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map(Some)
                .with_context(|| format!("Invalid number for {}.{}: {}", section, key, value)),
            None => Ok(None),
        }
    }

    /// A millisecond count as a `Duration`
    pub fn get_duration_ms(&self, section: &str, key: &str) -> Result<Option<Duration>> {
        Ok(self.get_u64(section, key)?.map(Duration::from_millis))
    }

    /// Get log level value with type conversion
    pub fn get_log_level(&self, section: &str, key: &str) -> Result<Option<log::LevelFilter>> {
        match self.get_value(section, key) {
            Some(value) => Ok(Some(crate::logging::parse_log_level(value)?)),
            None => Ok(None),
        }
    }

    /// Get path value with type conversion
    pub fn get_path(&self, section: &str, key: &str) -> Option<PathBuf> {
        self.get_value(section, key).map(PathBuf::from)
    }

    /// A TOML string array, or a comma separated string
    pub fn get_list(&self, section: &str, key: &str) -> Result<Option<Vec<String>>> {
        let value = match self.get_value(section, key) {
            Some(value) => value,
            None => return Ok(None),
        };
        if value.trim_start().starts_with('[') {
            let parsed: toml::Table = format!("list = {}", value)
                .parse()
                .with_context(|| format!("Invalid list for {}.{}: {}", section, key, value))?;
            let items = match parsed.get("list") {
                Some(Value::Array(items)) => items,
                _ => anyhow::bail!("Invalid list for {}.{}: {}", section, key, value),
            };
            return Ok(Some(items.iter().map(toml_value_to_string).collect()));
        }
        Ok(Some(
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect(),
        ))
    }

    /// Typed host configuration; unset keys keep their defaults
    pub fn host_config(&self) -> Result<HostConfig> {
        let mut config = HostConfig::default();

        if let Some(enabled) = self.get_bool("loader", "cache-enabled")? {
            config.loader.cache_enabled = enabled;
        }
        if let Some(size) = self.get_u64("loader", "max-cache-size")? {
            config.loader.max_cache_size = size as usize;
        }
        if let Some(size) = self.get_u64("loader", "error-history-size")? {
            config.loader.error_history_size = size as usize;
        }
        if let Some(paths) = self.get_list("loader", "search-paths")? {
            config.search_paths = paths.into_iter().map(PathBuf::from).collect();
        }

        if let Some(timeout) = self.get_duration_ms("lifecycle", "operation-timeout-ms")? {
            config.lifecycle.operation_timeout = timeout;
        }
        if let Some(grace) = self.get_duration_ms("lifecycle", "grace-period-ms")? {
            config.lifecycle.grace_period = grace;
        }

        if let Some(enabled) = self.get_bool("health", "enabled")? {
            config.health.enabled = enabled;
        }
        if let Some(interval) = self.get_duration_ms("health", "interval-ms")? {
            config.health.interval = interval;
        }
        if let Some(threshold) = self.get_u64("health", "failure-threshold")? {
            config.health.failure_threshold = u32::try_from(threshold)
                .with_context(|| format!("health.failure-threshold out of range: {}", threshold))?;
        }
        if let Some(restart) = self.get_bool("health", "auto-restart")? {
            config.health.auto_restart = restart;
        }
        if let Some(timeout) = self.get_duration_ms("health", "check-timeout-ms")? {
            config.health.check_timeout = timeout;
        }

        if let Some(depth) = self.get_u64("bus", "queue-depth")? {
            config.bus.queue_depth = depth as usize;
        }
        if let Some(samples) = self.get_u64("bus", "latency-samples")? {
            config.bus.latency_samples = samples as usize;
        }

        if let Some(enabled) = self.get_bool("hot-reload", "enabled")? {
            config.hot_reload.enabled = enabled;
        }
        if let Some(debounce) = self.get_duration_ms("hot-reload", "debounce-ms")? {
            config.hot_reload.debounce = debounce;
        }

        if let Some(timeout) = self.get_duration_ms("transactions", "default-timeout-ms")? {
            config.transactions.default_timeout = timeout;
        }
        if let Some(interval) = self.get_duration_ms("transactions", "reap-interval-ms")? {
            config.transactions.reap_interval = interval;
        }

        config
            .validate()
            .with_context(|| "Host configuration validation failed")?;
        Ok(config)
    }
}

/// Discover configuration files in order of precedence
fn discover_config_files() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. Environment variable $PLUGHOST_CONFIG
    if let Ok(env_path) = env::var(CONFIG_ENV) {
        paths.push(PathBuf::from(env_path));
    }

    // 2. XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("plughost").join("config.toml"));
    }

    // 3. Home directory
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".plughost.toml"));
    }

    // 4. Project local
    paths.push(PathBuf::from("./.plughost.toml"));

    debug!("Config discovery paths: {:?}", paths);
    paths
}

/// Parse TOML content to string-based configuration
fn parse_toml_config(content: &str) -> Result<Configuration> {
    let toml_value: Value = content.parse().context("Failed to parse TOML content")?;

    let mut config = Configuration::new();
    if let Value::Table(table) = toml_value {
        flatten_toml_table(&table, String::new(), &mut config);
    }

    debug!("Parsed configuration: {:?}", config);
    Ok(config)
}

/// Recursively flatten TOML tables into section.subsection format
fn flatten_toml_table(table: &toml::Table, prefix: String, config: &mut Configuration) {
    for (key, value) in table {
        let section_name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };

        match value {
            Value::Table(subtable) => {
                if subtable.values().all(|v| !matches!(v, Value::Table(_))) {
                    // leaf table: a configuration section
                    let section_map = subtable
                        .iter()
                        .map(|(subkey, subvalue)| (subkey.clone(), toml_value_to_string(subvalue)))
                        .collect();
                    config.insert(section_name, section_map);
                } else {
                    flatten_toml_table(subtable, section_name, config);
                }
            }
            _ => {
                // top-level key outside any table
                config
                    .entry("base".to_string())
                    .or_default()
                    .insert(key.clone(), toml_value_to_string(value));
            }
        }
    }
}

/// Convert TOML Value to string representation
fn toml_value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Array(_) | Value::Table(_) => value.to_string(),
        Value::Datetime(d) => d.to_string(),
    }
}
