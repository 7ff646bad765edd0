//! The handle through which handlers read and write their slice.

use std::fmt;
use std::sync::Arc;

use futures::future::AbortHandle;
use tracing::debug;

use crate::core::action::ActionEnvelope;
use crate::core::value::{StateMap, StateValue};
use crate::dispatch::{BatchCompletion, Completion};
use crate::error::{Result, StoreError};
use crate::instance::StateInstance;
use crate::registry::MountedNode;
use crate::store::Store;

/// Read/write access to one slice of the tree.
///
/// Bound to a mounted node; the slice is the node's path unless the context
/// was created for an explicit path with `Store::context_at`.
#[derive(Clone)]
pub struct StateContext {
    store: Store,
    node: Arc<MountedNode>,
    path: String,
    cancellation: Option<AbortHandle>,
}

impl StateContext {
    pub(crate) fn new(store: Store, node: Arc<MountedNode>, cancellation: Option<AbortHandle>) -> Self {
        let path = node.path.clone();
        Self {
            store,
            node,
            path,
            cancellation,
        }
    }

    pub(crate) fn at_path(store: Store, node: Arc<MountedNode>, path: String) -> Self {
        Self {
            store,
            node,
            path,
            cancellation: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn node(&self) -> &Arc<MountedNode> {
        &self.node
    }

    pub fn node_name(&self) -> &str {
        &self.node.name
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The owning instance, if it is a `T`.
    pub fn instance<T: StateInstance>(&self) -> Option<Arc<T>> {
        self.node.instance.downcast::<T>()
    }

    /// True once a later dispatch of the same action type canceled this
    /// handler invocation.
    pub fn is_canceled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(AbortHandle::is_aborted)
    }

    pub fn get_state(&self) -> Result<StateValue> {
        self.store
            .read_path(&self.path)
            .ok_or_else(|| StoreError::MissingPath(self.path.clone()))
    }

    /// Replace the slice with `value`.
    pub fn set_state(&self, value: impl Into<StateValue>) {
        let (previous, next) = self.store.replace_path(&self.path, value.into());
        self.changed(&previous, &next);
    }

    /// Replace the slice with `transform(current)`.
    ///
    /// The transform runs outside every engine lock; a missing slice is
    /// passed as `Null`. If another writer replaced the slice while the
    /// transform ran, the transform is called again on the newer value.
    pub fn set_state_with<F>(&self, mut transform: F)
    where
        F: FnMut(&StateValue) -> StateValue,
    {
        loop {
            let current = self.store.read_path(&self.path).unwrap_or_default();
            let next = transform(&current);
            if let Some((previous, next)) = self.store.swap_path(&self.path, &current, next) {
                self.changed(&previous, &next);
                return;
            }
            debug!(path = %self.path, "slice changed during transform; retrying");
        }
    }

    /// Shallow-merge the keys of `partial` into the slice.
    ///
    /// Both the slice and `partial` must be maps; a missing or null slice is
    /// treated as an empty map.
    pub fn patch_state(&self, partial: impl Into<StateValue>) -> Result<()> {
        let partial = partial.into();
        let Some(updates) = partial.as_map() else {
            return Err(StoreError::PatchType(partial.kind_label()));
        };
        let (previous, next) = self.store.update_path(&self.path, |current| {
            let mut merged: StateMap = match current {
                None | Some(StateValue::Null) => StateMap::new(),
                Some(StateValue::Map(map)) => (**map).clone(),
                Some(other) => return Err(StoreError::PatchType(other.kind_label())),
            };
            for (key, value) in updates {
                merged.insert(key.clone(), value.clone());
            }
            Ok(StateValue::from_map(merged))
        })?;
        self.changed(&previous, &next);
        Ok(())
    }

    pub fn dispatch(&self, envelope: ActionEnvelope) -> Result<Completion> {
        self.store.dispatch(envelope)
    }

    pub fn dispatch_many(&self, envelopes: Vec<ActionEnvelope>) -> Result<BatchCompletion> {
        self.store.dispatch_many(envelopes)
    }

    fn changed(&self, previous: &StateValue, next: &StateValue) {
        self.node.instance.hooks().on_change(previous, next);
        self.store.republish();
    }
}

impl fmt::Debug for StateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateContext")
            .field("node", &self.node.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
