//! The engine value: shared tree, registry, dispatcher and selection surface.
//!
//! A `Store` is a cheap handle (`Clone`) around one engine. Independent
//! stores share nothing. All structural changes and all writes go through
//! the methods here; every structural change ends by dispatching
//! [`UpdateState`] so observers of the action stream see it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::FutureExt;
use futures::future::AbortHandle;
use futures::stream::Stream;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::context::StateContext;
use crate::core::action::{ActionContext, ActionEnvelope, UpdateState};
use crate::core::location::LocationAddress;
use crate::core::path;
use crate::core::value::StateValue;
use crate::definition::StateDefinition;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticLog};
use crate::dispatch::{self, BatchCompletion, Completion};
use crate::error::{Result, StoreError};
use crate::instance::{InstanceProvider, SingletonProvider};
use crate::registry::{MountedNode, ParentQuery, Removal, StateRegistry};
use crate::selector::Selector;

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: EngineConfig,
    tree: watch::Sender<StateValue>,
    registry: RwLock<StateRegistry>,
    provider: Arc<dyn InstanceProvider>,
    actions: broadcast::Sender<ActionContext>,
    /// Abort handles of pending `cancel_uncompleted` signals, per action type.
    pending: Mutex<HashMap<String, Vec<AbortHandle>>>,
    diagnostics: DiagnosticLog,
}

impl Default for Store {
    fn default() -> Self {
        Self::build(EngineConfig::default(), Arc::new(SingletonProvider::new()))
    }
}

impl Store {
    /// Store with the default configuration and a singleton provider.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EngineConfig) -> anyhow::Result<Self> {
        Self::with_provider(config, Arc::new(SingletonProvider::new()))
    }

    pub fn with_provider(
        config: EngineConfig,
        provider: Arc<dyn InstanceProvider>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self::build(config, provider))
    }

    fn build(config: EngineConfig, provider: Arc<dyn InstanceProvider>) -> Self {
        let (tree, _) = watch::channel(StateValue::empty_map());
        let (actions, _) = broadcast::channel(config.action_stream_capacity);
        Self {
            inner: Arc::new(StoreInner {
                config,
                tree,
                registry: RwLock::new(StateRegistry::new()),
                provider,
                actions,
                pending: Mutex::new(HashMap::new()),
                diagnostics: DiagnosticLog::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ---- mounting -------------------------------------------------------

    /// Mount `definitions` and their declared children.
    ///
    /// Returns the nodes whose defaults were seeded. Paths already occupied by
    /// a node are skipped; nodes whose path already holds a value keep it.
    pub fn mount(&self, definitions: &[Arc<StateDefinition>]) -> Result<Vec<Arc<MountedNode>>> {
        let mounted = self.registry_mut().mount(
            definitions,
            &self.inner.config.main_context,
            self.inner.provider.as_ref(),
        )?;
        let before = self.snapshot();
        let bootstrapped: Vec<Arc<MountedNode>> = mounted
            .into_iter()
            .filter(|node| path::get_value(&before, &node.path).is_none())
            .collect();
        self.seed(&bootstrapped);
        debug!(count = bootstrapped.len(), "mounted states");
        self.structure_changed();
        Ok(bootstrapped)
    }

    /// Add `child` under the node named `parent_name` (default: the parent
    /// definition's name) in the main context.
    pub fn add_child(
        &self,
        parent: &Arc<StateDefinition>,
        child: &Arc<StateDefinition>,
        child_name: Option<&str>,
        parent_name: Option<&str>,
    ) -> Result<Vec<Arc<MountedNode>>> {
        let query = ParentQuery::Named {
            name: parent_name.unwrap_or(parent.name()),
            context: &self.inner.config.main_context,
        };
        self.add_child_with(query, child, child_name)
    }

    /// Add `child` under the unique node of type `parent` in
    /// `location.context`.
    pub fn add_child_in_context(
        &self,
        parent: &Arc<StateDefinition>,
        location: &LocationAddress,
        child: &Arc<StateDefinition>,
        child_name: Option<&str>,
        parent_name: Option<&str>,
    ) -> Result<Vec<Arc<MountedNode>>> {
        let context = non_empty(location.context()).unwrap_or(&self.inner.config.main_context);
        let query = ParentQuery::OfTypeInContext {
            definition: parent,
            context,
            name: parent_name.or(non_empty(location.name())),
        };
        self.add_child_with(query, child, child_name)
    }

    /// Add `child` under the parent designated by `location`: by path and
    /// type, else by name and context, else by name in the main context.
    pub fn add_child_in_location(
        &self,
        parent: &Arc<StateDefinition>,
        child: &Arc<StateDefinition>,
        location: &LocationAddress,
        child_name: Option<&str>,
    ) -> Result<Vec<Arc<MountedNode>>> {
        let name = non_empty(location.name()).unwrap_or(parent.name());
        let query = if !location.path().is_empty() {
            ParentQuery::OfTypeUnderPath {
                definition: parent,
                path: location.path(),
            }
        } else if !location.context().is_empty() {
            ParentQuery::Named {
                name,
                context: location.context(),
            }
        } else {
            ParentQuery::Named {
                name,
                context: &self.inner.config.main_context,
            }
        };
        self.add_child_with(query, child, child_name)
    }

    /// Add `child` under the node mounted exactly at `location.path`.
    pub fn add_child_in_path(
        &self,
        child: &Arc<StateDefinition>,
        location: &LocationAddress,
        child_name: Option<&str>,
    ) -> Result<Vec<Arc<MountedNode>>> {
        if location.path().is_empty() {
            return Err(StoreError::InvalidLocation(format!(
                "{}: a parent path is required",
                location
            )));
        }
        self.add_child_with(ParentQuery::AtPath(location.path()), child, child_name)
    }

    fn add_child_with(
        &self,
        query: ParentQuery<'_>,
        child: &Arc<StateDefinition>,
        child_name: Option<&str>,
    ) -> Result<Vec<Arc<MountedNode>>> {
        let mount = {
            let mut registry = self.registry_mut();
            let parent = match registry.resolve_parent(query) {
                Ok(parent) => parent,
                Err(err) => {
                    drop(registry);
                    self.tolerate(err, DiagnosticKind::ParentNotFound)?;
                    return Ok(Vec::new());
                }
            };
            registry.add_child(&parent, child, child_name, self.inner.provider.as_ref())?
        };
        for skipped in &mount.skipped {
            self.inner.diagnostics.record(
                DiagnosticKind::PathOccupied,
                format!("state already mounted at '{}'; child skipped", skipped),
            );
        }
        self.seed(&mount.nodes);
        self.structure_changed();
        Ok(mount.nodes)
    }

    // ---- removal --------------------------------------------------------

    /// Remove the first node mounted with `child`'s name, and its subtree.
    pub fn remove_child(&self, child: &Arc<StateDefinition>) -> Vec<Arc<MountedNode>> {
        self.remove_child_by_name(child.name())
    }

    pub fn remove_child_by_name(&self, name: &str) -> Vec<Arc<MountedNode>> {
        let target = self.registry().find_by_name(name).map(|node| node.path.clone());
        match target {
            Some(target) => self.remove_paths(vec![target]),
            None => self.missing_removal(format!("no state named '{}'", name)),
        }
    }

    /// Remove the node mounted exactly at `location.path`, and its subtree.
    pub fn remove_state_in_path(&self, location: &LocationAddress) -> Result<Vec<Arc<MountedNode>>> {
        if location.path().is_empty() {
            return Err(StoreError::InvalidLocation(format!(
                "{}: a path is required",
                location
            )));
        }
        let found = self.registry().find_by_path(location.path()).is_some();
        if !found {
            return Ok(self.missing_removal(format!("no state at path '{}'", location.path())));
        }
        Ok(self.remove_paths(vec![location.path().to_string()]))
    }

    /// Remove every node mounted from `definition`, and their subtrees.
    pub fn remove_state(&self, definition: &Arc<StateDefinition>) -> Vec<Arc<MountedNode>> {
        let targets: Vec<String> = self
            .registry()
            .nodes_of(definition)
            .iter()
            .map(|node| node.path.clone())
            .collect();
        if targets.is_empty() {
            return self.missing_removal(format!("no state mounted from '{}'", definition.name()));
        }
        self.remove_paths(targets)
    }

    fn missing_removal(&self, message: String) -> Vec<Arc<MountedNode>> {
        self.inner
            .diagnostics
            .record(DiagnosticKind::RemovalTargetMissing, message);
        Vec::new()
    }

    fn remove_paths(&self, targets: Vec<String>) -> Vec<Arc<MountedNode>> {
        let removal = {
            let mut registry = self.registry_mut();
            let mut all = Removal::default();
            for target in &targets {
                let removal = registry.remove_within(target);
                all.removed.extend(removal.removed);
                all.orphaned.extend(removal.orphaned);
            }
            all
        };

        self.inner.tree.send_if_modified(|root| {
            for target in &targets {
                *root = path::clear_value(root, target);
            }
            false
        });
        for node in &removal.orphaned {
            debug!(path = %node.path, "destroying state instance");
            node.instance.hooks().on_destroy();
            self.inner.provider.release(&node.definition, &node.instance);
        }
        self.structure_changed();
        removal.removed
    }

    /// Move the subtree mounted at `from` to `to`, value and nodes alike.
    pub fn move_subtree(&self, from: &str, to: &str) -> Result<()> {
        if path::is_within(to, from) {
            return Err(StoreError::InvalidLocation(format!(
                "cannot move '{}' into itself ('{}')",
                from, to
            )));
        }
        if self.read_path(to).is_some() {
            return Err(StoreError::PathOccupied(to.to_string()));
        }
        let rebased = self.registry_mut().rebase(from, to);
        if let Err(err) = rebased {
            return self.tolerate(err, DiagnosticKind::LocationNotFound);
        }
        self.inner.tree.send_if_modified(|root| {
            let value = path::get_value(root, from).cloned();
            let cleared = path::clear_value(root, from);
            *root = match value {
                Some(value) => path::set_value(&cleared, to, value),
                None => cleared,
            };
            false
        });
        self.structure_changed();
        Ok(())
    }

    // ---- dispatch -------------------------------------------------------

    /// Route `envelope` to every matching handler.
    ///
    /// Synchronous handler work has happened when this returns; await the
    /// completion to drive asynchronous handlers and get the outcome.
    pub fn dispatch(&self, envelope: ActionEnvelope) -> Result<Completion> {
        dispatch::dispatch(self, envelope)
    }

    pub fn dispatch_many(&self, envelopes: Vec<ActionEnvelope>) -> Result<BatchCompletion> {
        dispatch::dispatch_many(self, envelopes)
    }

    pub fn dispatch_in_location(
        &self,
        envelope: ActionEnvelope,
        location: LocationAddress,
    ) -> Result<Completion> {
        self.dispatch(envelope.in_location(location))
    }

    // ---- lookup ---------------------------------------------------------

    /// Resolve `location` to the path of the node it designates.
    pub fn location_path(&self, location: &LocationAddress) -> Result<String> {
        self.registry().resolve_location(location)
    }

    /// Location of the first node named `name` at or below `root`.
    pub fn state_in_path(&self, root: &LocationAddress, name: &str) -> Result<LocationAddress> {
        let root_path = self.root_path(root)?;
        self.registry()
            .nodes()
            .iter()
            .find(|node| node.name == name && path::is_within(&node.path, &root_path))
            .map(|node| LocationAddress::by_path(&node.path))
            .ok_or_else(|| {
                StoreError::NotFound(format!("no state named '{}' under '{}'", name, root_path))
            })
    }

    /// Location of the node mounted exactly at `root.path + "." + name`.
    pub fn state_at(&self, root: &LocationAddress, name: &str) -> Result<LocationAddress> {
        let target = path::join(&self.root_path(root)?, name);
        match self.registry().find_by_path(&target) {
            Some(_) => Ok(LocationAddress::by_path(&target)),
            None => Err(StoreError::NotFound(format!("no state at path '{}'", target))),
        }
    }

    fn root_path(&self, root: &LocationAddress) -> Result<String> {
        if root.path().is_empty() {
            self.location_path(root)
        } else {
            Ok(root.path().to_string())
        }
    }

    pub fn nodes(&self) -> Vec<Arc<MountedNode>> {
        self.registry().nodes().to_vec()
    }

    /// Context bound to the node `location` designates.
    pub fn context_for(&self, location: &LocationAddress) -> Result<StateContext> {
        let target = self.location_path(location)?;
        let node = self
            .registry()
            .find_by_path(&target)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("no state at path '{}'", target)))?;
        Ok(StateContext::new(self.clone(), node, None))
    }

    /// Context writing to `at`, owned by the deepest node containing it.
    pub fn context_at(&self, at: &str) -> Result<StateContext> {
        let node = self
            .registry()
            .owner_of(at)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("no state contains path '{}'", at)))?;
        Ok(StateContext::at_path(self.clone(), node, at.to_string()))
    }

    // ---- selection ------------------------------------------------------

    pub fn snapshot(&self) -> StateValue {
        self.inner.tree.borrow().clone()
    }

    /// Replace the whole tree; nodes stay mounted.
    pub fn reset(&self, tree: impl Into<StateValue>) {
        self.inner.tree.send_replace(tree.into());
    }

    pub fn select_snapshot(&self, selector: &Selector) -> Result<Option<StateValue>> {
        self.run_selector(selector, &self.snapshot())
    }

    /// Evaluate `selector` against the sub-tree of the node `location`
    /// designates.
    pub fn select_in_location(
        &self,
        selector: &Selector,
        location: &LocationAddress,
    ) -> Result<Option<StateValue>> {
        let target = match self.location_path(location) {
            Ok(target) => target,
            Err(err) => {
                self.tolerate(err, DiagnosticKind::LocationNotFound)?;
                return Ok(None);
            }
        };
        self.run_selector(&selector.anchored(&target), &self.snapshot())
    }

    /// Evaluate the selector registered as `selector_name` on the node
    /// `location` designates.
    pub fn select_in_state(
        &self,
        location: &LocationAddress,
        selector_name: &str,
    ) -> Result<Option<StateValue>> {
        let selector = match self.node_selector(location, selector_name) {
            Ok(selector) => selector,
            Err(err) => {
                self.tolerate(err, DiagnosticKind::LocationNotFound)?;
                return Ok(None);
            }
        };
        self.run_selector(&selector, &self.snapshot())
    }

    fn node_selector(&self, location: &LocationAddress, selector_name: &str) -> Result<Selector> {
        let target = self.location_path(location)?;
        let registry = self.registry();
        let node = registry
            .find_by_path(&target)
            .ok_or_else(|| StoreError::NotFound(format!("no state at path '{}'", target)))?;
        node.selectors.get(selector_name).cloned().ok_or_else(|| {
            StoreError::NotFound(format!(
                "state '{}' has no selector '{}'",
                node.name, selector_name
            ))
        })
    }

    /// Results of `selector` each time the tree is republished, skipping
    /// results identical to the previous one.
    ///
    /// An evaluation error is yielded once and ends the stream.
    pub fn select_stream(
        &self,
        selector: Selector,
    ) -> impl Stream<Item = Result<StateValue>> + Send + use<> {
        let store = self.clone();
        let mut rx = self.inner.tree.subscribe();
        async_stream::stream! {
            let mut last: Option<StateValue> = None;
            loop {
                let tree = rx.borrow_and_update().clone();
                match store.run_selector(&selector, &tree) {
                    Ok(Some(value)) => {
                        let unchanged = last.as_ref().is_some_and(|prev| prev.same(&value));
                        if !unchanged {
                            last = Some(value.clone());
                            yield Ok(value);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    fn run_selector(&self, selector: &Selector, tree: &StateValue) -> Result<Option<StateValue>> {
        match selector.evaluate(tree) {
            Ok(value) => Ok(Some(value)),
            Err(err) if selector.suppresses_errors() || self.inner.config.suppress_selector_errors => {
                self.inner
                    .diagnostics
                    .record(DiagnosticKind::SelectorSuppressed, err.to_string());
                Ok(None)
            }
            Err(err) => {
                debug!(error = %err, "selector failed");
                Err(err)
            }
        }
    }

    // ---- observation ----------------------------------------------------

    /// Receiver of the root, notified on every republish.
    pub fn subscribe(&self) -> watch::Receiver<StateValue> {
        self.inner.tree.subscribe()
    }

    /// Lifecycle events of every dispatched envelope.
    pub fn actions(&self) -> broadcast::Receiver<ActionContext> {
        self.inner.actions.subscribe()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.inner.diagnostics.snapshot()
    }

    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        self.inner.diagnostics.take()
    }

    // ---- engine internals -----------------------------------------------

    pub(crate) fn registry(&self) -> RwLockReadGuard<'_, StateRegistry> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, StateRegistry> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn diagnostics_log(&self) -> &DiagnosticLog {
        &self.inner.diagnostics
    }

    pub(crate) fn read_path(&self, at: &str) -> Option<StateValue> {
        path::get_value(&self.inner.tree.borrow(), at).cloned()
    }

    /// Write `value` at `at` without notifying subscribers.
    ///
    /// Returns the previous value (`Null` if absent) and the new one.
    pub(crate) fn replace_path(&self, at: &str, value: StateValue) -> (StateValue, StateValue) {
        let mut previous = StateValue::Null;
        let next = value.clone();
        self.inner.tree.send_if_modified(|root| {
            previous = path::get_value(root, at).cloned().unwrap_or_default();
            *root = path::set_value(root, at, value);
            false
        });
        (previous, next)
    }

    /// Like `replace_path`, but only while the slice is still `expected`
    /// (by identity). Returns `None` when another write got there first.
    pub(crate) fn swap_path(
        &self,
        at: &str,
        expected: &StateValue,
        value: StateValue,
    ) -> Option<(StateValue, StateValue)> {
        let mut swapped = None;
        self.inner.tree.send_if_modified(|root| {
            let previous = path::get_value(root, at).cloned().unwrap_or_default();
            if previous.same(expected) {
                *root = path::set_value(root, at, value.clone());
                swapped = Some((previous, value));
            }
            false
        });
        swapped
    }

    /// Like `replace_path`, computing the value from the current one while
    /// the tree is held.
    pub(crate) fn update_path<F>(&self, at: &str, compute: F) -> Result<(StateValue, StateValue)>
    where
        F: FnOnce(Option<&StateValue>) -> Result<StateValue>,
    {
        let mut outcome = None;
        self.inner.tree.send_if_modified(|root| {
            let current = path::get_value(root, at);
            let previous = current.cloned().unwrap_or_default();
            match compute(current) {
                Ok(next) => {
                    *root = path::set_value(root, at, next.clone());
                    outcome = Some(Ok((previous, next)));
                }
                Err(err) => outcome = Some(Err(err)),
            }
            false
        });
        outcome.unwrap_or_else(|| Err(StoreError::MissingPath(at.to_string())))
    }

    /// Notify tree subscribers of the current root.
    pub(crate) fn republish(&self) {
        self.inner.tree.send_modify(|_| {});
    }

    pub(crate) fn publish(&self, context: ActionContext) {
        // No subscribers is fine.
        let _ = self.inner.actions.send(context);
    }

    pub(crate) fn abort_pending(&self, action_type: &str) {
        let handles = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(action_type);
        for handle in handles.into_iter().flatten() {
            handle.abort();
        }
    }

    pub(crate) fn register_pending(&self, action_type: &str, handle: AbortHandle) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(action_type.to_string())
            .or_default()
            .push(handle);
    }

    fn seed(&self, nodes: &[Arc<MountedNode>]) {
        if nodes.is_empty() {
            return;
        }
        self.inner.tree.send_if_modified(|root| {
            for node in nodes {
                *root = path::set_value(root, &node.path, node.defaults.clone());
            }
            false
        });
    }

    /// Swallow lookup failures as diagnostics in permissive mode.
    fn tolerate(&self, err: StoreError, kind: DiagnosticKind) -> Result<()> {
        if self.inner.config.permissive && err.is_lookup() {
            self.inner.diagnostics.record(kind, err.to_string());
            return Ok(());
        }
        Err(err)
    }

    fn structure_changed(&self) {
        self.republish();
        let mut completion = match dispatch::dispatch(self, ActionEnvelope::new(UpdateState)) {
            Ok(completion) => completion,
            Err(err) => {
                warn!(error = %err, "state update marker failed");
                return;
            }
        };
        if (&mut completion).now_or_never().is_some() {
            return;
        }
        // Async marker handlers finish on the ambient runtime.
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(completion);
            }
            Err(_) => self.inner.diagnostics.record(
                DiagnosticKind::UpdateDetached,
                "state update handlers left pending work outside a tokio runtime",
            ),
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.inner.config)
            .field("nodes", &self.registry().len())
            .finish_non_exhaustive()
    }
}
