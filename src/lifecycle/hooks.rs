//! Lifecycle Hooks
//!
//! Callbacks run before and after load, initialize, stop and unload. A
//! failing pre-hook aborts the operation; post-hook failures are only logged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::plugin::handle::PluginHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookPoint {
    PreLoad,
    PostLoad,
    PreInitialize,
    PostInitialize,
    PreStop,
    PostStop,
    PreUnload,
    PostUnload,
}

impl HookPoint {
    pub fn is_pre(&self) -> bool {
        matches!(
            self,
            HookPoint::PreLoad | HookPoint::PreInitialize | HookPoint::PreStop | HookPoint::PreUnload
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::PreLoad => "pre-load",
            HookPoint::PostLoad => "post-load",
            HookPoint::PreInitialize => "pre-initialize",
            HookPoint::PostInitialize => "post-initialize",
            HookPoint::PreStop => "pre-stop",
            HookPoint::PostStop => "post-stop",
            HookPoint::PreUnload => "pre-unload",
            HookPoint::PostUnload => "post-unload",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook callback; the handle is absent before a plugin has been loaded
pub type LifecycleHook = Arc<dyn Fn(&str, Option<&PluginHandle>) -> PluginResult<()> + Send + Sync>;

/// Opaque registration token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HookToken(u64);

struct Registered {
    point: HookPoint,
    hook: LifecycleHook,
}

/// Hooks by registration order
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<BTreeMap<HookToken, Registered>>,
    next_token: AtomicU64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, point: HookPoint, hook: F) -> HookToken
    where
        F: Fn(&str, Option<&PluginHandle>) -> PluginResult<()> + Send + Sync + 'static,
    {
        let token = HookToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.hooks.write().insert(
            token,
            Registered {
                point,
                hook: Arc::new(hook),
            },
        );
        token
    }

    pub fn unregister(&self, token: HookToken) -> bool {
        self.hooks.write().remove(&token).is_some()
    }

    pub fn count(&self, point: HookPoint) -> usize {
        self.hooks.read().values().filter(|r| r.point == point).count()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    fn hooks_for(&self, point: HookPoint) -> Vec<LifecycleHook> {
        self.hooks
            .read()
            .values()
            .filter(|r| r.point == point)
            .map(|r| r.hook.clone())
            .collect()
    }

    /// Run the hooks for `point`.
    ///
    /// Pre-hooks stop at the first failure and return it. Post-hooks all run;
    /// their failures are logged and `Ok` is returned.
    pub fn run(&self, point: HookPoint, plugin_id: &str, handle: Option<&PluginHandle>) -> PluginResult<()> {
        // no registry lock is held while hooks run
        for hook in self.hooks_for(point) {
            if let Err(e) = hook(plugin_id, handle) {
                if point.is_pre() {
                    return Err(PluginError::new(
                        e.kind(),
                        format!("{} hook rejected '{}': {}", point, plugin_id, e.message()),
                    )
                    .with_plugin(plugin_id)
                    .with_context("hook", point.as_str())
                    .with_cause(e));
                }
                warn!("{} hook failed for '{}': {}", point, plugin_id, e);
            }
        }
        Ok(())
    }
}
