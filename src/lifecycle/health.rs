//! Health Monitor
//!
//! A single background task probes every `Running` plugin on a fixed
//! interval. Results are published on the bus. After `failure_threshold`
//! consecutive failures the plugin is restarted or marked `Failed`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::topics;
use crate::error::PluginError;
use crate::plugin::handle::PluginHandle;
use crate::plugin::metadata::PluginId;
use crate::plugin::state::PluginState;

use super::LifecycleManager;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Consecutive failures before action is taken
    pub failure_threshold: u32,
    /// Restart instead of marking the plugin `Failed`
    pub auto_restart: bool,
    /// Bound on a single `check_health` call
    pub check_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_millis(10_000),
            failure_threshold: 3,
            auto_restart: false,
            check_timeout: Duration::from_millis(5_000),
        }
    }
}

/// What the monitor did after a failed probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthAction {
    None,
    Restarted,
    RestartFailed,
    MarkedFailed,
}

/// Result of probing one plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub plugin_id: PluginId,
    pub healthy: bool,
    pub message: String,
    pub consecutive_failures: u32,
    pub action: HealthAction,
    pub checked_at: DateTime<Utc>,
}

/// Periodic health prober
pub struct HealthMonitor {
    lifecycle: Arc<LifecycleManager>,
    config: HealthConfig,
    failures: DashMap<PluginId, u32>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(lifecycle: Arc<LifecycleManager>, config: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            lifecycle,
            config,
            failures: DashMap::new(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Spawn the probe loop on the current runtime.
    ///
    /// Returns false when monitoring is disabled or already started.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.config.enabled || self.cancel.is_cancelled() {
            return false;
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return false;
        }
        let monitor = Arc::clone(self);
        *task = Some(tokio::spawn(async move { monitor.run().await }));
        info!("Health monitor started (interval {:?})", self.config.interval);
        true
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reports = self.check_once().await;
                    debug!("Health pass probed {} plugin(s)", reports.len());
                }
            }
        }
        debug!("Health monitor loop exited");
    }

    /// Ask the loop to exit without waiting for it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the loop and wait for an in-flight pass to finish
    pub async fn stop(&self) {
        self.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Health monitor task ended abnormally: {}", e);
            }
            info!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().map_or(false, |t| !t.is_finished())
    }

    pub fn failure_count(&self, id: &str) -> u32 {
        self.failures.get(id).map_or(0, |count| *count)
    }

    /// Probe every running plugin once
    pub async fn check_once(&self) -> Vec<HealthReport> {
        let registry = self.lifecycle.registry();
        let running: Vec<Arc<PluginHandle>> = registry
            .handles()
            .into_iter()
            .filter(|h| h.state() == PluginState::Running)
            .collect();
        self.failures.retain(|id, _| registry.contains(id));

        let mut reports = Vec::with_capacity(running.len());
        for handle in running {
            if let Some(report) = self.probe(&handle).await {
                let payload = serde_json::to_value(&report).unwrap_or_else(|_| json!({"plugin_id": &report.plugin_id}));
                self.lifecycle.bus().emit(topics::HEALTH, payload);
                reports.push(report);
            }
        }
        reports
    }

    async fn probe(&self, handle: &Arc<PluginHandle>) -> Option<HealthReport> {
        let id = handle.id().to_string();
        let status = {
            // a plugin busy with another operation is probed next time
            let instance = match handle.instance().try_lock() {
                Ok(instance) => instance,
                Err(_) => {
                    debug!("Skipping health check of busy plugin '{}'", id);
                    return None;
                }
            };
            if handle.state() != PluginState::Running {
                return None;
            }
            self.lifecycle
                .bounded(&id, "check_health", self.config.check_timeout, instance.check_health())
                .await
        };

        let (healthy, message) = match status {
            Ok(status) => (status.healthy, status.message),
            Err(e) => (false, e.to_string()),
        };
        let mut report = HealthReport {
            plugin_id: id.clone(),
            healthy,
            message,
            consecutive_failures: 0,
            action: HealthAction::None,
            checked_at: Utc::now(),
        };
        if healthy {
            self.failures.remove(&id);
            return Some(report);
        }

        let failures = {
            let mut count = self.failures.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        report.consecutive_failures = failures;
        warn!(
            "Health check failed for '{}' ({}/{}): {}",
            id, failures, self.config.failure_threshold, report.message
        );
        if failures >= self.config.failure_threshold {
            self.failures.remove(&id);
            report.action = self.act_on_failure(handle, &report.message).await;
        }
        Some(report)
    }

    async fn act_on_failure(&self, handle: &Arc<PluginHandle>, message: &str) -> HealthAction {
        let id = handle.id();
        if self.config.auto_restart {
            match self.lifecycle.restart(id).await {
                Ok(()) => {
                    info!("Restarted unhealthy plugin '{}'", id);
                    HealthAction::Restarted
                }
                Err(e) => {
                    warn!("Failed to restart unhealthy plugin '{}': {}", id, e);
                    HealthAction::RestartFailed
                }
            }
        } else {
            let error = PluginError::internal(format!("Plugin '{}' is unhealthy: {}", id, message))
                .with_plugin(id)
                .with_context("failure_threshold", self.config.failure_threshold);
            self.lifecycle.mark_failed(handle, &error);
            HealthAction::MarkedFailed
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
