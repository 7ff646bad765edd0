//! Test-only helpers for building definitions, handlers and stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::EngineConfig;
use crate::context::StateContext;
use crate::core::action::{ActionEnvelope, ActionKind};
use crate::core::value::StateValue;
use crate::definition::StateDefinition;
use crate::dispatch::HandlerOutput;
use crate::error::HandlerError;
use crate::instance::StateInstance;
use crate::logging;
use crate::store::Store;

/// Instance that records every hook call.
#[derive(Debug, Default)]
pub struct RecordingInstance {
    changes: Mutex<Vec<(StateValue, StateValue)>>,
    destroyed: AtomicUsize,
}

impl RecordingInstance {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(previous, next)` pairs, oldest first.
    pub fn changes(&self) -> Vec<(StateValue, StateValue)> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn destroy_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl StateInstance for RecordingInstance {
    fn on_change(&self, previous: &StateValue, next: &StateValue) {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((previous.clone(), next.clone()));
    }

    fn on_destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Definition with empty-map defaults and nothing else.
pub fn state(name: &str) -> Arc<StateDefinition> {
    StateDefinition::builder(name).build()
}

pub fn state_with_defaults(name: &str, defaults: serde_json::Value) -> Arc<StateDefinition> {
    StateDefinition::builder(name).defaults(defaults).build()
}

/// Definition declaring `children`, in order.
pub fn parent_of(name: &str, children: &[Arc<StateDefinition>]) -> Arc<StateDefinition> {
    children
        .iter()
        .fold(StateDefinition::builder(name), |builder, child| {
            builder.child(child.clone())
        })
        .build()
}

pub fn command(action_type: &str) -> ActionEnvelope {
    ActionEnvelope::raw(action_type, ActionKind::Command)
}

pub fn event(action_type: &str) -> ActionEnvelope {
    ActionEnvelope::raw(action_type, ActionKind::Event)
}

/// Handler that overwrites its slice with `value`.
pub fn set_to(
    value: serde_json::Value,
) -> impl Fn(StateContext, ActionEnvelope) -> Result<HandlerOutput, HandlerError> + Send + Sync + 'static
{
    move |ctx, _| {
        ctx.set_state(value.clone());
        Ok(HandlerOutput::Done)
    }
}

/// Handler that fails synchronously with `message`.
pub fn failing(
    message: &'static str,
) -> impl Fn(StateContext, ActionEnvelope) -> Result<HandlerOutput, HandlerError> + Send + Sync + 'static
{
    move |_, _| Err(HandlerError::msg(message))
}

/// Handler that records the path of every context it is invoked with.
pub fn recording_paths(
    seen: Arc<Mutex<Vec<String>>>,
) -> impl Fn(StateContext, ActionEnvelope) -> Result<HandlerOutput, HandlerError> + Send + Sync + 'static
{
    move |ctx, _| {
        seen.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ctx.path().to_string());
        Ok(HandlerOutput::Done)
    }
}

/// Default store; also routes engine tracing to the test writer.
pub fn store() -> Store {
    logging::try_init();
    Store::new()
}

/// Store with lookup failures downgraded to diagnostics.
pub fn permissive_store() -> Store {
    store_with(|config| config.permissive = true)
}

/// Store with a tweaked default configuration.
pub fn store_with(configure: impl FnOnce(&mut EngineConfig)) -> Store {
    logging::try_init();
    let mut config = EngineConfig::default();
    configure(&mut config);
    match Store::with_config(config) {
        Ok(store) => store,
        Err(err) => panic!("invalid test config: {err:#}"),
    }
}
