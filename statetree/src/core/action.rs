//! Action envelopes and their lifecycle statuses.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::location::LocationAddress;
use crate::error::HandlerError;

/// Whether an unhandled envelope is worth reporting.
///
/// A Command expects at least one handler; an Event may go unheard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    #[default]
    Command,
    Event,
}

/// A typed action. `TYPE` is the routing key handlers register against.
pub trait Action: Send + Sync + 'static {
    const TYPE: &'static str;
    const KIND: ActionKind = ActionKind::Command;
}

/// Marker dispatched after every structural change to the tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateState;

impl Action for UpdateState {
    const TYPE: &'static str = "@@UPDATE_STATE";
    const KIND: ActionKind = ActionKind::Event;
}

/// A dispatched action: type identity, kind, optional target and payload.
#[derive(Clone)]
pub struct ActionEnvelope {
    action_type: Arc<str>,
    kind: ActionKind,
    location: Option<LocationAddress>,
    payload: Arc<dyn Any + Send + Sync>,
}

impl ActionEnvelope {
    pub fn new<A: Action>(action: A) -> Self {
        Self {
            action_type: Arc::from(A::TYPE),
            kind: A::KIND,
            location: None,
            payload: Arc::new(action),
        }
    }

    /// Untyped envelope with an empty payload.
    pub fn raw(action_type: &str, kind: ActionKind) -> Self {
        Self {
            action_type: Arc::from(action_type),
            kind,
            location: None,
            payload: Arc::new(()),
        }
    }

    pub fn with_payload<P: Any + Send + Sync>(mut self, payload: P) -> Self {
        self.payload = Arc::new(payload);
        self
    }

    /// Restrict delivery to nodes matching `location`.
    pub fn in_location(mut self, location: LocationAddress) -> Self {
        self.location = Some(location);
        self
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn location(&self) -> Option<&LocationAddress> {
        self.location.as_ref()
    }

    /// Borrow the payload as `P`, if that is what was dispatched.
    pub fn payload<P: Any>(&self) -> Option<&P> {
        self.payload.downcast_ref::<P>()
    }
}

impl fmt::Debug for ActionEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionEnvelope")
            .field("action_type", &self.action_type)
            .field("kind", &self.kind)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Dispatched,
    Successful,
    Canceled,
    Errored,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ActionStatus::Dispatched)
    }
}

/// One lifecycle event of an envelope, as published on the action stream.
///
/// The final context of a dispatch is also its outcome.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub envelope: ActionEnvelope,
    pub status: ActionStatus,
    pub error: Option<HandlerError>,
}

impl ActionContext {
    pub fn dispatched(envelope: ActionEnvelope) -> Self {
        Self {
            envelope,
            status: ActionStatus::Dispatched,
            error: None,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == ActionStatus::Successful
    }

    pub fn is_canceled(&self) -> bool {
        self.status == ActionStatus::Canceled
    }

    pub fn is_errored(&self) -> bool {
        self.status == ActionStatus::Errored
    }
}
