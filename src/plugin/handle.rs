//! Plugin Handles
//!
//! The host-side record of a loaded plugin, and the artifact identity it was
//! loaded from.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{PluginError, PluginResult};
use crate::loader::PluginModule;
use crate::plugin::metadata::{PluginId, PluginMetadata};
use crate::plugin::state::{PluginState, StateMachine};
use crate::plugin::traits::Plugin;

/// Identity of an artifact file on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub file_path: PathBuf,
    pub size: u64,
    pub mtime: SystemTime,
    /// Lowercase hex SHA-256 of the file contents
    pub content_digest: String,
}

impl Artifact {
    /// Stat and hash the file at `path`
    pub fn inspect(path: &Path) -> PluginResult<Self> {
        let (size, mtime) = stat(path)?;
        let content_digest = digest_file(path)?;
        Ok(Self {
            file_path: path.to_path_buf(),
            size,
            mtime,
            content_digest,
        })
    }

    /// Whether `(size, mtime)` still match the file on disk
    pub fn matches_stat(&self, size: u64, mtime: SystemTime) -> bool {
        self.size == size && self.mtime == mtime
    }
}

/// Size and modification time of a file
pub fn stat(path: &Path) -> PluginResult<(u64, SystemTime)> {
    let meta = fs::metadata(path).map_err(|e| PluginError::from(e).with_path(path))?;
    let mtime = meta
        .modified()
        .map_err(|e| PluginError::from(e).with_path(path))?;
    Ok((meta.len(), mtime))
}

/// SHA-256 of the file contents, hex encoded
pub fn digest_file(path: &Path) -> PluginResult<String> {
    let file = File::open(path).map_err(|e| PluginError::from(e).with_path(path))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| PluginError::from(e).with_path(path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Runtime record of a loaded plugin, owned by the registry.
///
/// Field order matters: the plugin instance is dropped before the module it
/// was created from.
pub struct PluginHandle {
    instance: tokio::sync::Mutex<Box<dyn Plugin>>,
    id: PluginId,
    metadata: PluginMetadata,
    artifact: Artifact,
    state: Arc<StateMachine>,
    loaded_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    live_config: RwLock<Value>,
    reload_enabled: AtomicBool,
    dependents: RwLock<Vec<PluginId>>,
    last_error: RwLock<Option<PluginError>>,
    load_duration: Duration,
    module: Arc<dyn PluginModule>,
}

impl PluginHandle {
    pub fn new(
        metadata: PluginMetadata,
        artifact: Artifact,
        instance: Box<dyn Plugin>,
        module: Arc<dyn PluginModule>,
        state: Arc<StateMachine>,
        load_duration: Duration,
    ) -> Self {
        let now = Utc::now();
        let live_config = instance.default_configuration();
        Self {
            instance: tokio::sync::Mutex::new(instance),
            id: metadata.id.clone(),
            metadata,
            artifact,
            state,
            loaded_at: now,
            last_activity: RwLock::new(now),
            live_config: RwLock::new(live_config),
            reload_enabled: AtomicBool::new(false),
            dependents: RwLock::new(Vec::new()),
            last_error: RwLock::new(None),
            load_duration,
            module,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    /// The plugin object. Holding this lock linearizes lifecycle operations on the plugin.
    pub fn instance(&self) -> &tokio::sync::Mutex<Box<dyn Plugin>> {
        &self.instance
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn state(&self) -> PluginState {
        self.state.current_state()
    }

    pub fn module(&self) -> &Arc<dyn PluginModule> {
        &self.module
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read()
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }

    pub fn live_config(&self) -> Value {
        self.live_config.read().clone()
    }

    pub fn set_live_config(&self, config: Value) {
        *self.live_config.write() = config;
    }

    pub fn is_reload_enabled(&self) -> bool {
        self.reload_enabled.load(Ordering::Acquire)
    }

    pub fn set_reload_enabled(&self, enabled: bool) {
        self.reload_enabled.store(enabled, Ordering::Release);
    }

    pub fn dependents(&self) -> Vec<PluginId> {
        self.dependents.read().clone()
    }

    pub fn add_dependent(&self, id: &str) {
        let mut dependents = self.dependents.write();
        if !dependents.iter().any(|d| d == id) {
            dependents.push(id.to_string());
            dependents.sort();
        }
    }

    pub fn remove_dependent(&self, id: &str) {
        self.dependents.write().retain(|d| d != id);
    }

    pub fn load_duration(&self) -> Duration {
        self.load_duration
    }

    /// Most recent lifecycle failure
    pub fn last_error(&self) -> Option<PluginError> {
        self.last_error.read().clone()
    }

    pub fn set_last_error(&self, error: PluginError) {
        *self.last_error.write() = Some(error);
    }

    pub fn clear_last_error(&self) {
        *self.last_error.write() = None;
    }

    /// Copy of the observable fields
    pub fn snapshot(&self) -> PluginSnapshot {
        PluginSnapshot {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            artifact: self.artifact.clone(),
            state: self.state(),
            loaded_at: self.loaded_at,
            last_activity: self.last_activity(),
            live_config: self.live_config(),
            reload_enabled: self.is_reload_enabled(),
            dependents: self.dependents(),
            last_error: self.last_error().map(|e| e.to_string()),
            load_duration_ms: self.load_duration.as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("path", &self.artifact.file_path)
            .finish()
    }
}

/// Point-in-time view of a plugin handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSnapshot {
    pub id: PluginId,
    pub metadata: PluginMetadata,
    pub artifact: Artifact,
    pub state: PluginState,
    pub loaded_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub live_config: Value,
    pub reload_enabled: bool,
    pub dependents: Vec<PluginId>,
    pub last_error: Option<String>,
    pub load_duration_ms: u64,
}
