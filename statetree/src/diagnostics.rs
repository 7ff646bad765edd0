//! Reportable but non-fatal conditions.
//!
//! Every diagnostic is logged at `warn` and kept in memory so callers (and
//! tests) can inspect what the engine chose to tolerate.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A Command envelope matched no handler.
    UnhandledCommand,
    /// Permissive mode swallowed a failed parent lookup.
    ParentNotFound,
    /// A dynamic child was skipped because its path is taken.
    PathOccupied,
    RemovalTargetMissing,
    /// Permissive mode swallowed a failed location lookup.
    LocationNotFound,
    SelectorSuppressed,
    /// An `UpdateState` handler left async work and no runtime could finish it.
    UpdateDetached,
}

impl DiagnosticKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticKind::UnhandledCommand => "unhandled_command",
            DiagnosticKind::ParentNotFound => "parent_not_found",
            DiagnosticKind::PathOccupied => "path_occupied",
            DiagnosticKind::RemovalTargetMissing => "removal_target_missing",
            DiagnosticKind::LocationNotFound => "location_not_found",
            DiagnosticKind::SelectorSuppressed => "selector_suppressed",
            DiagnosticKind::UpdateDetached => "update_detached",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct DiagnosticLog {
    entries: Mutex<Vec<Diagnostic>>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: DiagnosticKind, message: impl Into<String>) {
        let message = message.into();
        warn!(kind = %kind, "{}", message);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Diagnostic { kind, message });
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain all recorded diagnostics.
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.entries.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.kind == kind)
            .count()
    }
}
