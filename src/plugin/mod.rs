//! Plugin Model
//!
//! Everything the host knows about a plugin: its descriptor, the contract a
//! plugin object implements, the lifecycle state machine, the runtime handle,
//! the registry of handles, and dependency ordering.

pub mod handle;
pub mod metadata;
pub mod registry;
pub mod resolver;
pub mod state;
pub mod traits;

#[cfg(test)]
pub mod tests;

pub use handle::{Artifact, PluginHandle, PluginSnapshot};
pub use metadata::{Capabilities, PluginDependency, PluginId, PluginMetadata, Priority, ThreadModel};
pub use registry::{PluginRegistry, SharedPluginRegistry};
pub use resolver::{DependencyResolver, Resolution};
pub use state::{PluginState, StateChange, StateListener, StateMachine};
pub use traits::{CommandDescriptor, HealthStatus, HostContext, Plugin, PluginLogger};
