//! User-side instances that own a state slice, and the provider that builds them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::core::value::StateValue;
use crate::definition::StateDefinition;

/// Lifecycle hooks of a state instance. Both default to no-ops.
pub trait StateInstance: Send + Sync + 'static {
    /// Called after every write through a context bound to this instance.
    fn on_change(&self, _previous: &StateValue, _next: &StateValue) {}

    /// Called once the last node referencing this instance is removed.
    fn on_destroy(&self) {}
}

/// Instance used for definitions that declare no factory.
#[derive(Debug, Default)]
pub struct DefaultInstance;

impl StateInstance for DefaultInstance {}

/// Shared handle to an instance: its hooks plus a downcastable view.
#[derive(Clone)]
pub struct InstanceHandle {
    hooks: Arc<dyn StateInstance>,
    any: Arc<dyn Any + Send + Sync>,
}

impl InstanceHandle {
    pub fn new<T: StateInstance>(instance: T) -> Self {
        Self::from_arc(Arc::new(instance))
    }

    pub fn from_arc<T: StateInstance>(instance: Arc<T>) -> Self {
        Self {
            hooks: instance.clone(),
            any: instance,
        }
    }

    pub fn hooks(&self) -> &dyn StateInstance {
        self.hooks.as_ref()
    }

    pub fn downcast<T: StateInstance>(&self) -> Option<Arc<T>> {
        self.any.clone().downcast::<T>().ok()
    }

    /// True if both handles point at the same instance.
    pub fn same(&self, other: &InstanceHandle) -> bool {
        Arc::ptr_eq(&self.any, &other.any)
    }
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceHandle({:p})", Arc::as_ptr(&self.any))
    }
}

/// Source of instances for mounted definitions.
pub trait InstanceProvider: Send + Sync {
    fn instance_for(&self, definition: &Arc<StateDefinition>) -> InstanceHandle;

    /// Called when no mounted node references the instance any more.
    fn release(&self, _definition: &Arc<StateDefinition>, _instance: &InstanceHandle) {}
}

/// Provider handing out one instance per definition name.
#[derive(Default)]
pub struct SingletonProvider {
    instances: Mutex<HashMap<String, InstanceHandle>>,
}

impl SingletonProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceProvider for SingletonProvider {
    fn instance_for(&self, definition: &Arc<StateDefinition>) -> InstanceHandle {
        let mut instances = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        instances
            .entry(definition.name().to_string())
            .or_insert_with(|| {
                debug!(state = %definition.name(), "creating state instance");
                definition.create_instance()
            })
            .clone()
    }

    fn release(&self, definition: &Arc<StateDefinition>, instance: &InstanceHandle) {
        let mut instances = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if instances
            .get(definition.name())
            .is_some_and(|cached| cached.same(instance))
        {
            instances.remove(definition.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter;

    impl StateInstance for Counter {}

    #[test]
    fn singleton_provider_reuses_instance_until_released() {
        let provider = SingletonProvider::new();
        let def = StateDefinition::builder("counter").instance(|| Counter).build();
        let first = provider.instance_for(&def);
        let second = provider.instance_for(&def);
        assert!(first.same(&second));
        assert!(first.downcast::<Counter>().is_some());

        provider.release(&def, &first);
        let third = provider.instance_for(&def);
        assert!(!third.same(&first));
    }

    #[test]
    fn default_instance_is_used_without_factory() {
        let def = StateDefinition::builder("plain").build();
        let handle = SingletonProvider::new().instance_for(&def);
        assert!(handle.downcast::<DefaultInstance>().is_some());
    }
}
