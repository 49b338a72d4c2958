//! Transaction Operations
//!
//! An operation names its target plugin, how to check it during `prepare`,
//! how to apply it and how to undo it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, PluginError, PluginResult};
use crate::plugin::metadata::PluginId;
use crate::plugin::registry::PluginRegistry;
use crate::plugin::state::PluginState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Load,
    Unload,
    Configure,
    Execute,
    Custom,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Load => "load",
            OperationKind::Unload => "unload",
            OperationKind::Configure => "configure",
            OperationKind::Execute => "execute",
            OperationKind::Custom => "custom",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OperationStatus {
    #[default]
    Pending,
    Validated,
    Executed,
    Failed,
    RolledBack,
    RollbackFailed,
}

pub type StepFuture = BoxFuture<'static, PluginResult<()>>;
pub type StepFn = Arc<dyn Fn() -> StepFuture + Send + Sync>;
pub type ValidateFn = Arc<dyn Fn(&mut PrepareContext) -> PluginResult<()> + Send + Sync>;

/// Registry view used while validating a transaction.
///
/// Starts from the live registry and tracks the loads and unloads planned by
/// earlier operations of the same transaction.
#[derive(Debug, Clone, Default)]
pub struct PrepareContext {
    present: BTreeSet<PluginId>,
    states: BTreeMap<PluginId, PluginState>,
}

impl PrepareContext {
    pub fn from_registry(registry: &PluginRegistry) -> Self {
        let states: BTreeMap<PluginId, PluginState> = registry
            .handles()
            .into_iter()
            .map(|handle| (handle.id().to_string(), handle.state()))
            .collect();
        Self {
            present: states.keys().cloned().collect(),
            states,
        }
    }

    pub fn is_present(&self, id: &str) -> bool {
        self.present.contains(id)
    }

    /// Live state, or `None` for plugins that are absent or only planned
    pub fn state_of(&self, id: &str) -> Option<PluginState> {
        self.states.get(id).copied()
    }

    pub fn require_present(&self, id: &str) -> PluginResult<()> {
        if self.is_present(id) {
            Ok(())
        } else {
            Err(PluginError::not_loaded(id))
        }
    }

    pub fn plan_load(&mut self, id: &str) -> PluginResult<()> {
        if !self.present.insert(id.to_string()) {
            return Err(PluginError::already_loaded(id));
        }
        self.states.remove(id);
        Ok(())
    }

    pub fn plan_unload(&mut self, id: &str) -> PluginResult<()> {
        if !self.present.remove(id) {
            return Err(PluginError::not_loaded(id));
        }
        self.states.remove(id);
        Ok(())
    }
}

/// One step of a transaction
pub struct Operation {
    target: PluginId,
    kind: OperationKind,
    payload: Value,
    validate: Option<ValidateFn>,
    forward: Option<StepFn>,
    rollback: Option<StepFn>,
    status: OperationStatus,
}

impl Operation {
    pub fn new<F, Fut>(kind: OperationKind, target: &str, forward: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PluginResult<()>> + Send + 'static,
    {
        Self {
            target: target.to_string(),
            kind,
            payload: Value::Null,
            validate: None,
            forward: Some(Arc::new(move || forward().boxed())),
            rollback: None,
            status: OperationStatus::Pending,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_validation<V>(mut self, validate: V) -> Self
    where
        V: Fn(&mut PrepareContext) -> PluginResult<()> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    pub fn with_rollback<F, Fut>(mut self, rollback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PluginResult<()>> + Send + 'static,
    {
        self.rollback = Some(Arc::new(move || rollback().boxed()));
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn has_rollback(&self) -> bool {
        self.rollback.is_some()
    }

    pub(crate) fn set_status(&mut self, status: OperationStatus) {
        self.status = status;
    }

    pub(crate) fn check(&self, context: &mut PrepareContext) -> PluginResult<()> {
        match &self.validate {
            Some(validate) => validate(context).map_err(|e| {
                e.with_context("operation", self.kind.to_string())
                    .with_context("target", self.target.clone())
            }),
            None => Ok(()),
        }
    }

    pub(crate) fn forward(&self) -> StepFuture {
        match &self.forward {
            Some(forward) => forward(),
            None => {
                let err = PluginError::invalid_state(format!(
                    "{} of '{}' was already released",
                    self.kind, self.target
                ))
                .with_plugin(&self.target);
                async move { Err(err) }.boxed()
            }
        }
    }

    /// Drop the step closures along with everything they captured
    pub(crate) fn release(&mut self) {
        self.validate = None;
        self.forward = None;
        self.rollback = None;
    }

    pub(crate) fn rollback(&self) -> Option<StepFuture> {
        self.rollback.as_ref().map(|rollback| rollback())
    }

    pub fn info(&self) -> OperationInfo {
        OperationInfo {
            target: self.target.clone(),
            kind: self.kind,
            status: self.status,
            payload: self.payload.clone(),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .finish()
    }
}

/// Observable view of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub target: PluginId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub payload: Value,
}

/// Validation shared by the standard operation kinds
pub fn standard_validation(kind: OperationKind, target: &str, context: &mut PrepareContext) -> PluginResult<()> {
    match kind {
        OperationKind::Load => context.plan_load(target),
        OperationKind::Unload => {
            context.require_present(target)?;
            if let Some(state) = context.state_of(target) {
                if matches!(state, PluginState::Loading | PluginState::Initializing | PluginState::Stopping) {
                    return Err(PluginError::new(
                        ErrorKind::InvalidState,
                        format!("Plugin '{}' is {} and cannot be unloaded", target, state),
                    )
                    .with_plugin(target));
                }
            }
            context.plan_unload(target)
        }
        OperationKind::Configure | OperationKind::Execute => {
            context.require_present(target)?;
            match context.state_of(target) {
                Some(PluginState::Failed) => Err(PluginError::invalid_state(format!(
                    "Plugin '{}' has failed",
                    target
                ))
                .with_plugin(target)),
                _ => Ok(()),
            }
        }
        OperationKind::Custom => Ok(()),
    }
}
