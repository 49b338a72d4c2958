//! Plugin Lifecycle State Machine
//!
//! Per-plugin state with transition validation. The lock guarding the state
//! is only held while checking and committing a transition; plugin code is
//! never invoked under it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// Number of transitions retained per plugin for diagnostics
const HISTORY_LIMIT: usize = 64;

/// Lifecycle state of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum PluginState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl PluginState {
    pub const ALL: [PluginState; 9] = [
        PluginState::Unloaded,
        PluginState::Loading,
        PluginState::Loaded,
        PluginState::Initializing,
        PluginState::Running,
        PluginState::Paused,
        PluginState::Stopping,
        PluginState::Stopped,
        PluginState::Failed,
    ];

    /// Whether `self -> next` appears in the transition table
    pub fn can_transition_to(&self, next: PluginState) -> bool {
        use PluginState::*;
        match (*self, next) {
            (Unloaded, Loading)
            | (Loading, Loaded)
            | (Loaded, Initializing)
            | (Initializing, Running)
            | (Running, Paused)
            | (Paused, Running)
            | (Running, Stopping)
            | (Stopping, Stopped)
            | (Stopped, Unloaded)
            | (Failed, Unloaded) => true,
            (Unloaded, Failed) | (Failed, Failed) => false,
            (_, Failed) => true,
            _ => false,
        }
    }

    /// Terminal states of a load cycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, PluginState::Unloaded | PluginState::Failed)
    }

    /// Whether a dependent may rely on a plugin in this state
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, PluginState::Running | PluginState::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Unloaded => "Unloaded",
            PluginState::Loading => "Loading",
            PluginState::Loaded => "Loaded",
            PluginState::Initializing => "Initializing",
            PluginState::Running => "Running",
            PluginState::Paused => "Paused",
            PluginState::Stopping => "Stopping",
            PluginState::Stopped => "Stopped",
            PluginState::Failed => "Failed",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub plugin_id: String,
    pub old: PluginState,
    pub new: PluginState,
    pub timestamp: DateTime<Utc>,
}

/// Observer invoked after every committed transition
pub type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Per-plugin state machine
pub struct StateMachine {
    plugin_id: String,
    state: Mutex<PluginState>,
    history: Mutex<VecDeque<StateChange>>,
    listener: RwLock<Option<StateListener>>,
}

impl StateMachine {
    pub fn new<S: Into<String>>(plugin_id: S) -> Self {
        Self::with_state(plugin_id, PluginState::Unloaded)
    }

    /// Start from an arbitrary state, used when adopting an already loaded module
    pub fn with_state<S: Into<String>>(plugin_id: S, state: PluginState) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            state: Mutex::new(state),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            listener: RwLock::new(None),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn current_state(&self) -> PluginState {
        *self.state.lock()
    }

    /// Install the transition observer, replacing any previous one
    pub fn set_listener(&self, listener: StateListener) {
        *self.listener.write() = Some(listener);
    }

    pub fn clear_listener(&self) {
        *self.listener.write() = None;
    }

    /// Atomically move to `next`.
    ///
    /// A transition to the current state is a no-op. Transitions out of
    /// `Failed` other than cleanup to `Unloaded` require [`reset`](Self::reset).
    pub fn transition_to(&self, next: PluginState) -> PluginResult<()> {
        let change = {
            let mut state = self.state.lock();
            let old = *state;
            if old == next {
                return Ok(());
            }
            if !old.can_transition_to(next) {
                let hint = if old == PluginState::Failed {
                    " (reset required)"
                } else {
                    ""
                };
                return Err(PluginError::invalid_state(format!(
                    "Invalid transition {} -> {} for plugin '{}'{}",
                    old, next, self.plugin_id, hint
                ))
                .with_plugin(&self.plugin_id)
                .with_context("from", old.as_str())
                .with_context("to", next.as_str()));
            }
            *state = next;
            StateChange {
                plugin_id: self.plugin_id.clone(),
                old,
                new: next,
                timestamp: Utc::now(),
            }
        };
        self.publish(change);
        Ok(())
    }

    /// Transition only if currently in `expected`
    pub fn transition_from(&self, expected: PluginState, next: PluginState) -> PluginResult<()> {
        let current = self.current_state();
        if current != expected {
            return Err(PluginError::invalid_state(format!(
                "Plugin '{}' is {} (expected {})",
                self.plugin_id, current, expected
            ))
            .with_plugin(&self.plugin_id)
            .with_context("state", current.as_str()));
        }
        self.transition_to(next)
    }

    /// Move to `Failed` if the table allows it; returns whether the state changed
    pub fn mark_failed(&self) -> bool {
        let before = self.current_state();
        before != PluginState::Failed && self.transition_to(PluginState::Failed).is_ok()
    }

    /// Force the state back to `Unloaded` after full cleanup
    pub fn reset(&self) {
        let change = {
            let mut state = self.state.lock();
            let old = *state;
            if old == PluginState::Unloaded {
                return;
            }
            *state = PluginState::Unloaded;
            StateChange {
                plugin_id: self.plugin_id.clone(),
                old,
                new: PluginState::Unloaded,
                timestamp: Utc::now(),
            }
        };
        self.publish(change);
    }

    /// Recent transitions, oldest first
    pub fn history(&self) -> Vec<StateChange> {
        self.history.lock().iter().cloned().collect()
    }

    fn publish(&self, change: StateChange) {
        log::debug!(
            "Plugin '{}' state {} -> {}",
            change.plugin_id,
            change.old,
            change.new
        );
        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(change.clone());
        }
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(&change);
        }
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("plugin_id", &self.plugin_id)
            .field("state", &self.current_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_happy_path() {
        let sm = StateMachine::new("a");
        for next in [
            PluginState::Loading,
            PluginState::Loaded,
            PluginState::Initializing,
            PluginState::Running,
            PluginState::Paused,
            PluginState::Running,
            PluginState::Stopping,
            PluginState::Stopped,
            PluginState::Unloaded,
        ] {
            sm.transition_to(next).unwrap();
        }
        assert_eq!(sm.current_state(), PluginState::Unloaded);
        assert_eq!(sm.history().len(), 9);
    }

    #[test]
    fn test_same_state_is_noop() {
        let sm = StateMachine::new("a");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        sm.set_listener(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        sm.transition_to(PluginState::Unloaded).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sm.transition_to(PluginState::Loading).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let sm = StateMachine::new("a");
        assert!(sm.transition_to(PluginState::Running).is_err());
        assert!(sm.transition_to(PluginState::Failed).is_err());
        sm.transition_to(PluginState::Loading).unwrap();
        sm.transition_to(PluginState::Failed).unwrap();
        let err = sm.transition_to(PluginState::Loading).unwrap_err();
        assert!(err.message().contains("reset required"));
        sm.transition_to(PluginState::Unloaded).unwrap();
    }

    #[test]
    fn test_reset_from_failed() {
        let sm = StateMachine::with_state("a", PluginState::Running);
        assert!(sm.mark_failed());
        assert!(!sm.mark_failed());
        sm.reset();
        assert_eq!(sm.current_state(), PluginState::Unloaded);
        sm.transition_to(PluginState::Loading).unwrap();
    }

    #[test]
    fn test_listener_receives_change() {
        let sm = StateMachine::new("a");
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        sm.set_listener(Arc::new(move |change: &StateChange| {
            sink.lock().push((change.old, change.new));
        }));
        sm.transition_to(PluginState::Loading).unwrap();
        assert_eq!(
            *captured.lock(),
            vec![(PluginState::Unloaded, PluginState::Loading)]
        );
    }

    fn arb_state() -> impl Strategy<Value = PluginState> {
        (0usize..PluginState::ALL.len()).prop_map(|i| PluginState::ALL[i])
    }

    proptest! {
        #[test]
        fn prop_observed_sequence_is_valid_path(
            attempts in proptest::collection::vec((arb_state(), any::<bool>()), 0..64)
        ) {
            let sm = StateMachine::new("p");
            for (next, reset) in attempts {
                if reset && sm.current_state() == PluginState::Failed {
                    sm.reset();
                } else {
                    let _ = sm.transition_to(next);
                }
            }
            let history = sm.history();
            let mut previous = PluginState::Unloaded;
            for change in history {
                prop_assert_eq!(change.old, previous);
                let legal = change.old.can_transition_to(change.new)
                    || (change.old == PluginState::Failed && change.new == PluginState::Unloaded);
                prop_assert!(legal, "{} -> {}", change.old, change.new);
                previous = change.new;
            }
            prop_assert_eq!(previous, sm.current_state());
        }
    }
}
