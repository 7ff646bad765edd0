//! Declarations of state slices: defaults, children, handlers and selectors.
//!
//! Definitions are immutable once built and shared as `Arc<StateDefinition>`;
//! the `Arc` address is the definition's type identity.

use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::context::StateContext;
use crate::core::action::{Action, ActionEnvelope};
use crate::core::value::StateValue;
use crate::dispatch::HandlerOutput;
use crate::error::HandlerError;
use crate::instance::{DefaultInstance, InstanceHandle, StateInstance};
use crate::selector::Selector;

pub type HandlerFn =
    Arc<dyn Fn(StateContext, ActionEnvelope) -> Result<HandlerOutput, HandlerError> + Send + Sync>;

type InstanceFactory = Arc<dyn Fn() -> InstanceHandle + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Cancel this handler's pending signal when the same action type is
    /// dispatched again.
    pub cancel_uncompleted: bool,
}

/// One registered handler.
#[derive(Clone)]
pub struct ActionHandlerMeta {
    /// Name of the definition that declared the handler.
    pub owner: String,
    pub handler: HandlerFn,
    pub options: HandlerOptions,
}

impl fmt::Debug for ActionHandlerMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandlerMeta")
            .field("owner", &self.owner)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

pub struct StateDefinition {
    name: String,
    defaults: Option<StateValue>,
    children: Vec<Arc<StateDefinition>>,
    extends: Option<Arc<StateDefinition>>,
    actions: BTreeMap<String, Vec<ActionHandlerMeta>>,
    selectors: BTreeMap<String, Selector>,
    factory: Option<InstanceFactory>,
}

impl StateDefinition {
    pub fn builder(name: &str) -> StateDefinitionBuilder {
        StateDefinitionBuilder {
            definition: StateDefinition {
                name: name.to_string(),
                defaults: None,
                children: Vec::new(),
                extends: None,
                actions: BTreeMap::new(),
                selectors: BTreeMap::new(),
                factory: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &[Arc<StateDefinition>] {
        &self.children
    }

    pub fn extends(&self) -> Option<&Arc<StateDefinition>> {
        self.extends.as_ref()
    }

    /// Own defaults, else the nearest base's, else an empty map.
    pub fn defaults(&self) -> StateValue {
        self.lineage()
            .find_map(|def| def.defaults.clone())
            .unwrap_or_else(StateValue::empty_map)
    }

    /// Address-based identity, stable for the life of the `Arc`.
    pub fn id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    pub fn is(self: &Arc<Self>, other: &Arc<StateDefinition>) -> bool {
        Arc::ptr_eq(self, other)
    }

    /// True if `other` is this definition or one of its bases.
    pub fn derives_from(self: &Arc<Self>, other: &Arc<StateDefinition>) -> bool {
        self.lineage().any(|def| std::ptr::eq(def, Arc::as_ptr(other)))
    }

    /// This definition followed by its base chain.
    fn lineage(&self) -> impl Iterator<Item = &StateDefinition> {
        std::iter::successors(Some(self), |def| def.extends.as_deref())
    }

    /// Handlers merged along the base chain; the most-derived entry per
    /// action type replaces inherited ones.
    pub fn flattened_actions(&self) -> BTreeMap<String, Vec<ActionHandlerMeta>> {
        let chain: Vec<&StateDefinition> = self.lineage().collect();
        let mut merged = BTreeMap::new();
        for def in chain.into_iter().rev() {
            for (action_type, handlers) in &def.actions {
                merged.insert(action_type.clone(), handlers.clone());
            }
        }
        merged
    }

    pub fn flattened_selectors(&self) -> BTreeMap<String, Selector> {
        let chain: Vec<&StateDefinition> = self.lineage().collect();
        let mut merged = BTreeMap::new();
        for def in chain.into_iter().rev() {
            for (name, selector) in &def.selectors {
                merged.insert(name.clone(), selector.clone());
            }
        }
        merged
    }

    pub fn create_instance(&self) -> InstanceHandle {
        match &self.factory {
            Some(factory) => factory(),
            None => InstanceHandle::new(DefaultInstance),
        }
    }
}

impl fmt::Debug for StateDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDefinition")
            .field("name", &self.name)
            .field(
                "children",
                &self.children.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("extends", &self.extends.as_ref().map(|d| d.name()))
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("selectors", &self.selectors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

pub struct StateDefinitionBuilder {
    definition: StateDefinition,
}

impl StateDefinitionBuilder {
    pub fn defaults(mut self, defaults: impl Into<StateValue>) -> Self {
        self.definition.defaults = Some(defaults.into());
        self
    }

    pub fn child(mut self, child: Arc<StateDefinition>) -> Self {
        self.definition.children.push(child);
        self
    }

    pub fn extends(mut self, base: Arc<StateDefinition>) -> Self {
        self.definition.extends = Some(base);
        self
    }

    /// Register a typed handler for `A`.
    pub fn on<A: Action>(
        self,
        handler: impl Fn(StateContext, &A) -> Result<HandlerOutput, HandlerError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.on_with::<A>(HandlerOptions::default(), handler)
    }

    pub fn on_with<A: Action>(
        self,
        options: HandlerOptions,
        handler: impl Fn(StateContext, &A) -> Result<HandlerOutput, HandlerError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.on_type_with(A::TYPE, options, move |ctx, envelope| {
            let action = envelope.payload::<A>().ok_or_else(|| {
                HandlerError::msg(format!(
                    "payload of '{}' is not a {}",
                    envelope.action_type(),
                    type_name::<A>()
                ))
            })?;
            handler(ctx, action)
        })
    }

    /// Register an untyped handler keyed by action type.
    pub fn on_type<F>(self, action_type: &str, handler: F) -> Self
    where
        F: Fn(StateContext, ActionEnvelope) -> Result<HandlerOutput, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.on_type_with(action_type, HandlerOptions::default(), handler)
    }

    pub fn on_type_with<F>(mut self, action_type: &str, options: HandlerOptions, handler: F) -> Self
    where
        F: Fn(StateContext, ActionEnvelope) -> Result<HandlerOutput, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let meta = ActionHandlerMeta {
            owner: self.definition.name.clone(),
            handler: Arc::new(handler),
            options,
        };
        self.definition
            .actions
            .entry(action_type.to_string())
            .or_default()
            .push(meta);
        self
    }

    pub fn selector(mut self, name: &str, selector: Selector) -> Self {
        self.definition.selectors.insert(name.to_string(), selector);
        self
    }

    /// Build a fresh instance from `factory` whenever one is requested.
    pub fn instance<T, F>(mut self, factory: F) -> Self
    where
        T: StateInstance,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.definition.factory = Some(Arc::new(move || InstanceHandle::new(factory())));
        self
    }

    /// Always hand out the same `instance`.
    pub fn shared_instance<T: StateInstance>(mut self, instance: Arc<T>) -> Self {
        self.definition.factory = Some(Arc::new(move || InstanceHandle::from_arc(instance.clone())));
        self
    }

    pub fn build(self) -> Arc<StateDefinition> {
        Arc::new(self.definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(_: StateContext, _: ActionEnvelope) -> Result<HandlerOutput, HandlerError> {
        Ok(HandlerOutput::Done)
    }

    #[test]
    fn absent_defaults_become_empty_map() {
        let def = StateDefinition::builder("a").build();
        assert_eq!(def.defaults(), StateValue::empty_map());
    }

    #[test]
    fn defaults_fall_back_to_base() {
        let base = StateDefinition::builder("base")
            .defaults(json!({"n": 1}))
            .build();
        let derived = StateDefinition::builder("derived").extends(base.clone()).build();
        assert_eq!(derived.defaults().to_json(), json!({"n": 1}));
        assert!(derived.derives_from(&base));
        assert!(!base.derives_from(&derived));
    }

    /// Derived entries replace inherited ones per key; others are inherited.
    #[test]
    fn flattening_prefers_most_derived_entries() {
        let base = StateDefinition::builder("base")
            .on_type("shared", noop)
            .on_type("base_only", noop)
            .selector("count", Selector::path("n"))
            .build();
        let derived = StateDefinition::builder("derived")
            .extends(base)
            .on_type("shared", noop)
            .on_type("shared", noop)
            .selector("count", Selector::path("m"))
            .build();

        let actions = derived.flattened_actions();
        assert_eq!(actions["base_only"].len(), 1);
        assert_eq!(actions["base_only"][0].owner, "base");
        assert_eq!(actions["shared"].len(), 2);
        assert!(actions["shared"].iter().all(|meta| meta.owner == "derived"));

        let selectors = derived.flattened_selectors();
        let tree = StateValue::from(json!({"n": 1, "m": 2}));
        assert_eq!(
            selectors["count"].evaluate(&tree).expect("count"),
            StateValue::from(2_i64)
        );
    }

    #[test]
    fn identity_is_per_arc() {
        let a = StateDefinition::builder("same").build();
        let b = StateDefinition::builder("same").build();
        assert!(a.is(&a.clone()));
        assert!(!a.is(&b));
        assert_ne!(a.id(), b.id());
    }
}
