//! Error taxonomy for the state engine.
//!
//! Mount-time validation failures are always fatal. Lookup failures
//! (`NotFound`, `AmbiguousLocation`) are fatal unless the engine runs with
//! `permissive = true`. Handler failures never escape a dispatch fan-out; they
//! are captured per handler and surfaced through the dispatch outcome.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid state name '{0}': names must match ^[A-Za-z0-9_]+$")]
    InvalidName(String),

    #[error("state name '{0}' is declared by more than one definition")]
    DuplicateName(String),

    #[error("state graph contains a cycle through: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("invalid location: {0}")]
    InvalidLocation(String),

    #[error("path '{0}' is already occupied")]
    PathOccupied(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AmbiguousLocation(String),

    #[error("patching {0} is not supported")]
    PatchType(&'static str),

    #[error("no value at path '{0}'")]
    MissingPath(String),

    #[error("selector failed: {0}")]
    Selector(String),

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),
}

impl StoreError {
    /// True for structural errors that must abort a mount.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidName(_)
                | StoreError::DuplicateName(_)
                | StoreError::Cycle(_)
                | StoreError::InvalidLocation(_)
                | StoreError::PathOccupied(_)
        )
    }

    /// True for lookup failures that permissive mode downgrades to diagnostics.
    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::AmbiguousLocation(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failure reported by an action handler.
///
/// Cheap to clone so a single failure can be carried by the dispatch outcome
/// and by every subscriber of the action stream.
#[derive(Clone)]
pub struct HandlerError(Arc<anyhow::Error>);

impl HandlerError {
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerError({:?})", self.0)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        Self(Arc::new(anyhow::Error::new(err)))
    }
}
