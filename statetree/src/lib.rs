//! Hierarchical, path-addressed state tree.
//!
//! Named state slices are declared as [`StateDefinition`]s, mounted into one
//! shared tree in dependency order, and changed by dispatching actions to
//! the handlers registered on them. Derived values are read through
//! memoized [`Selector`]s.
//!
//! - **[`core`]**: Pure, deterministic logic (values, paths, locations, the
//!   mount graph, action envelopes). No locks, no async.
//! - **[`Store`]**: The engine. Owns the tree, the registry of mounted
//!   nodes and the action stream; every mutation goes through it.
//!
//! Handlers receive a [`StateContext`] bound to their slice and return a
//! [`HandlerOutput`]; a dispatch resolves once every matched handler has
//! settled.

pub mod config;
pub mod context;
pub mod core;
pub mod definition;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod instance;
pub mod logging;
pub mod registry;
pub mod selector;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::config::EngineConfig;
pub use crate::context::StateContext;
pub use crate::core::action::{
    Action, ActionContext, ActionEnvelope, ActionKind, ActionStatus, UpdateState,
};
pub use crate::core::location::LocationAddress;
pub use crate::core::value::{StateMap, StateValue};
pub use crate::definition::{HandlerOptions, StateDefinition};
pub use crate::diagnostics::{Diagnostic, DiagnosticKind};
pub use crate::dispatch::{BatchCompletion, Completion, DispatchOutcome, HandlerOutput};
pub use crate::error::{HandlerError, Result, StoreError};
pub use crate::instance::{InstanceProvider, SingletonProvider, StateInstance};
pub use crate::registry::MountedNode;
pub use crate::selector::{Selector, SelectorOptions};
pub use crate::store::Store;
