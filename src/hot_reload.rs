//! Hot Reload
//!
//! Watches the artifacts of reload-enabled plugins. Raw change events are
//! debounced on a dedicated thread; once a path has been quiet for the
//! debounce window its digest is compared with the digest of the last
//! successful load and, if it differs, the reload callback is dispatched.
//! Callbacks run on the tokio runtime (or a helper thread when there is none)
//! so a slow reload never blocks change detection.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info, warn};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::loader::history::ErrorHistory;
use crate::plugin::handle::digest_file;
use crate::plugin::metadata::PluginId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotReloadConfig {
    pub enabled: bool,
    /// Quiet period required after the last change event
    pub debounce: Duration,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: Duration::from_millis(250),
        }
    }
}

/// Invoked with the plugin id for every confirmed change
pub type ReloadCallback = Arc<dyn Fn(PluginId) -> BoxFuture<'static, PluginResult<()>> + Send + Sync>;

/// Counters for the watcher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotReloadStats {
    pub watched: usize,
    pub events: u64,
    pub dispatched: u64,
    pub unchanged: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
struct WatchEntry {
    plugin_id: PluginId,
    digest: String,
    in_flight: bool,
}

enum Signal {
    Changed(PathBuf),
    Shutdown,
}

struct Shared {
    entries: RwLock<HashMap<PathBuf, WatchEntry>>,
    global: AtomicBool,
    callback: RwLock<Option<ReloadCallback>>,
    history: Arc<ErrorHistory>,
    runtime: Option<tokio::runtime::Handle>,
    events: AtomicU64,
    dispatched: AtomicU64,
    unchanged: AtomicU64,
    failed: AtomicU64,
}

/// Artifact watcher and reload dispatcher
pub struct HotReloadManager {
    config: HotReloadConfig,
    shared: Arc<Shared>,
    signals: Sender<Signal>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    watched_dirs: Mutex<HashMap<PathBuf, usize>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Paths are compared in canonical form; a missing file keeps its given form
fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl HotReloadManager {
    /// Create the manager and its debounce thread.
    ///
    /// When called inside a tokio runtime, reload callbacks are spawned on it.
    /// A platform watcher that cannot be created is logged; changes can then
    /// only be reported through [`notify_path_changed`](Self::notify_path_changed).
    pub fn new(config: HotReloadConfig, history: Arc<ErrorHistory>) -> Self {
        let (signals, receiver) = unbounded();
        let shared = Arc::new(Shared {
            entries: RwLock::new(HashMap::new()),
            global: AtomicBool::new(config.enabled),
            callback: RwLock::new(None),
            history,
            runtime: tokio::runtime::Handle::try_current().ok(),
            events: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let watcher = Self::create_watcher(signals.clone());
        let worker = {
            let shared = shared.clone();
            let debounce = config.debounce;
            std::thread::Builder::new()
                .name("plughost-reload".to_string())
                .spawn(move || debounce_loop(shared, receiver, debounce))
                .map_err(|e| error!("Failed to start the reload thread: {}", e))
                .ok()
        };

        Self {
            config,
            shared,
            signals,
            watcher: Mutex::new(watcher),
            watched_dirs: Mutex::new(HashMap::new()),
            worker: Mutex::new(worker),
        }
    }

    fn create_watcher(signals: Sender<Signal>) -> Option<RecommendedWatcher> {
        let handler = move |result: Result<Event, notify::Error>| match result {
            Ok(event) => {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    for path in event.paths {
                        let _ = signals.send(Signal::Changed(normalize(&path)));
                    }
                }
            }
            Err(e) => warn!("File watcher error: {}", e),
        };
        match RecommendedWatcher::new(handler, Config::default()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Hot reload watcher unavailable: {}", PluginError::from(e));
                None
            }
        }
    }

    pub fn config(&self) -> &HotReloadConfig {
        &self.config
    }

    /// Watch `path` on behalf of `id`, replacing any earlier registration for the plugin
    pub fn enable(&self, id: &str, path: &Path) -> PluginResult<()> {
        let path = normalize(path);
        let digest = digest_file(&path).map_err(|e| e.with_plugin(id))?;
        self.disable(id);

        if let Some(dir) = path.parent().map(Path::to_path_buf) {
            let mut dirs = self.watched_dirs.lock();
            if !dirs.contains_key(&dir) {
                if let Some(watcher) = self.watcher.lock().as_mut() {
                    watcher
                        .watch(&dir, RecursiveMode::NonRecursive)
                        .map_err(|e| PluginError::from(e).with_plugin(id).with_path(&dir))?;
                }
            }
            *dirs.entry(dir).or_insert(0) += 1;
        }

        self.shared.entries.write().insert(
            path.clone(),
            WatchEntry {
                plugin_id: id.to_string(),
                digest,
                in_flight: false,
            },
        );
        info!("Hot reload enabled for '{}' ({})", id, path.display());
        Ok(())
    }

    /// Stop watching the plugin's artifact
    pub fn disable(&self, id: &str) -> bool {
        let removed: Vec<PathBuf> = {
            let mut entries = self.shared.entries.write();
            let paths: Vec<PathBuf> = entries
                .iter()
                .filter(|(_, entry)| entry.plugin_id == id)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &paths {
                entries.remove(path);
            }
            paths
        };
        for path in &removed {
            self.release_dir(path);
        }
        if !removed.is_empty() {
            debug!("Hot reload disabled for '{}'", id);
        }
        !removed.is_empty()
    }

    fn release_dir(&self, path: &Path) {
        let dir = match path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => return,
        };
        let mut dirs = self.watched_dirs.lock();
        let remaining = match dirs.get_mut(&dir) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            dirs.remove(&dir);
            if let Some(watcher) = self.watcher.lock().as_mut() {
                if let Err(e) = watcher.unwatch(&dir) {
                    debug!("Failed to unwatch {}: {}", dir.display(), e);
                }
            }
        }
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.shared.entries.read().values().any(|e| e.plugin_id == id)
    }

    /// While disabled, change events are discarded
    pub fn set_global_enabled(&self, enabled: bool) {
        self.shared.global.store(enabled, Ordering::SeqCst);
        info!("Hot reload {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_global_enabled(&self) -> bool {
        self.shared.global.load(Ordering::SeqCst)
    }

    /// Install the single reload sink, replacing any previous one
    pub fn set_reload_callback<F>(&self, callback: F)
    where
        F: Fn(PluginId) -> BoxFuture<'static, PluginResult<()>> + Send + Sync + 'static,
    {
        *self.shared.callback.write() = Some(Arc::new(callback));
    }

    /// Report a change as if it came from the file watcher
    pub fn notify_path_changed(&self, path: &Path) {
        let _ = self.signals.send(Signal::Changed(normalize(path)));
    }

    /// Watched artifacts by plugin id
    pub fn watched(&self) -> Vec<(PluginId, PathBuf)> {
        let mut watched: Vec<(PluginId, PathBuf)> = self
            .shared
            .entries
            .read()
            .iter()
            .map(|(path, entry)| (entry.plugin_id.clone(), path.clone()))
            .collect();
        watched.sort();
        watched
    }

    pub fn stats(&self) -> HotReloadStats {
        HotReloadStats {
            watched: self.shared.entries.read().len(),
            events: self.shared.events.load(Ordering::Relaxed),
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            unchanged: self.shared.unchanged.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop the watcher and the debounce thread
    pub fn shutdown(&self) {
        self.watcher.lock().take();
        let _ = self.signals.send(Signal::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Reload thread panicked");
            }
        }
    }
}

impl Drop for HotReloadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn debounce_loop(shared: Arc<Shared>, receiver: Receiver<Signal>, debounce: Duration) {
    let mut pending: HashSet<PathBuf> = HashSet::new();
    let mut quiet_at: Option<Instant> = None;
    loop {
        let signal = match quiet_at {
            Some(at) => {
                let wait = at.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(wait) {
                    Ok(signal) => Some(signal),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match receiver.recv() {
                Ok(signal) => Some(signal),
                Err(_) => break,
            },
        };

        match signal {
            Some(Signal::Shutdown) => break,
            Some(Signal::Changed(path)) => {
                if !shared.entries.read().contains_key(&path) {
                    continue;
                }
                shared.events.fetch_add(1, Ordering::Relaxed);
                pending.insert(path);
                quiet_at = Some(Instant::now() + debounce);
            }
            None => {
                quiet_at = None;
                for path in pending.drain() {
                    process_change(&shared, path);
                }
            }
        }
    }
    debug!("Reload thread exited");
}

fn process_change(shared: &Arc<Shared>, path: PathBuf) {
    if !shared.global.load(Ordering::SeqCst) {
        debug!("Hot reload disabled, ignoring change to {}", path.display());
        return;
    }
    let digest = match digest_file(&path) {
        Ok(digest) => digest,
        Err(e) => {
            // typically a half-written or removed artifact; the next event retries
            debug!("Cannot hash {}: {}", path.display(), e);
            return;
        }
    };

    let plugin_id = {
        let mut entries = shared.entries.write();
        let entry = match entries.get_mut(&path) {
            Some(entry) => entry,
            None => return,
        };
        if entry.digest == digest {
            shared.unchanged.fetch_add(1, Ordering::Relaxed);
            debug!("'{}' artifact unchanged", entry.plugin_id);
            return;
        }
        if entry.in_flight {
            debug!("Reload of '{}' already in progress", entry.plugin_id);
            return;
        }
        entry.in_flight = true;
        entry.plugin_id.clone()
    };

    let callback = shared.callback.read().clone();
    let callback = match callback {
        Some(callback) => callback,
        None => {
            warn!("Change to '{}' detected but no reload callback is installed", plugin_id);
            finish_reload(shared, &path, None);
            return;
        }
    };

    info!("Reloading '{}' after change to {}", plugin_id, path.display());
    shared.dispatched.fetch_add(1, Ordering::Relaxed);
    let future = match catch_unwind(AssertUnwindSafe(|| callback(plugin_id.clone()))) {
        Ok(future) => future,
        Err(_) => {
            reload_failed(shared, &path, &plugin_id, panicked(&plugin_id));
            return;
        }
    };
    let runtime = shared.runtime.clone();
    let task_shared = shared.clone();
    let task_path = path.clone();
    let task_id = plugin_id.clone();
    let task = async move {
        let outcome = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(panicked(&task_id)),
        };
        match outcome {
            Ok(()) => finish_reload(&task_shared, &task_path, Some(digest)),
            Err(e) => reload_failed(&task_shared, &task_path, &task_id, e),
        }
    };
    match runtime {
        Some(runtime) => {
            runtime.spawn(task);
        }
        None => {
            let spawned = std::thread::Builder::new()
                .name("plughost-reload-task".to_string())
                .spawn(move || futures::executor::block_on(task));
            if let Err(e) = spawned {
                let e = PluginError::internal(format!("Failed to run reload task: {}", e));
                reload_failed(shared, &path, &plugin_id, e);
            }
        }
    }
}

fn panicked(plugin_id: &str) -> PluginError {
    PluginError::internal(format!("Reload callback panicked for '{}'", plugin_id)).with_plugin(plugin_id)
}

/// Count and record a failed reload; the old digest stays so the next change retries
fn reload_failed(shared: &Shared, path: &Path, plugin_id: &str, e: PluginError) {
    shared.failed.fetch_add(1, Ordering::Relaxed);
    error!("Reload of '{}' failed: {}", plugin_id, e);
    shared
        .history
        .record("reload", Some(path.to_path_buf()), Some(plugin_id), &e);
    finish_reload(shared, path, None);
}

/// Clear the in-flight flag, adopting `digest` after a successful reload
fn finish_reload(shared: &Shared, path: &Path, digest: Option<String>) {
    if let Some(entry) = shared.entries.write().get_mut(path) {
        entry.in_flight = false;
        if let Some(digest) = digest {
            entry.digest = digest;
        }
    }
}
