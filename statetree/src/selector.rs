//! Memoized derived values over the shared tree.
//!
//! A selector is either a path getter or a projection over other selectors.
//! Projections remember their last argument list and skip the projector when
//! every argument is identical (`StateValue::same`) to the previous call.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::path;
use crate::core::value::StateValue;
use crate::error::{Result, StoreError};

pub type Projector = Arc<dyn Fn(&[StateValue]) -> anyhow::Result<StateValue> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectorOptions {
    /// Yield `None` instead of an error when evaluation fails.
    pub suppress_errors: bool,
}

#[derive(Clone)]
pub struct Selector {
    inner: Arc<SelectorInner>,
}

struct SelectorInner {
    source: Source,
    /// Sub-path of the tree the selector reads from; empty for the root.
    anchor: String,
    options: SelectorOptions,
    memo: Mutex<Option<Memo>>,
}

#[derive(Clone)]
enum Source {
    Path(String),
    Projection {
        dependencies: Vec<Selector>,
        projector: Projector,
    },
}

struct Memo {
    args: Vec<StateValue>,
    result: StateValue,
}

impl Selector {
    fn from_source(source: Source, anchor: String, options: SelectorOptions) -> Self {
        Self {
            inner: Arc::new(SelectorInner {
                source,
                anchor,
                options,
                memo: Mutex::new(None),
            }),
        }
    }

    /// Memoized projection over `dependencies`.
    ///
    /// With no dependencies the projector receives the selector's scope (the
    /// tree, or the sub-tree at its anchor) as its only argument.
    pub fn create<F>(dependencies: Vec<Selector>, projector: F, options: SelectorOptions) -> Self
    where
        F: Fn(&[StateValue]) -> anyhow::Result<StateValue> + Send + Sync + 'static,
    {
        Self::from_source(
            Source::Projection {
                dependencies,
                projector: Arc::new(projector),
            },
            String::new(),
            options,
        )
    }

    /// Getter for the value at `path` within the scope.
    pub fn path(path: &str) -> Self {
        Self::from_source(
            Source::Path(path.to_string()),
            String::new(),
            SelectorOptions::default(),
        )
    }

    /// The whole scope.
    pub fn root() -> Self {
        Self::path("")
    }

    /// A copy reading from the sub-tree at `at`, with its own memo.
    pub fn anchored(&self, at: &str) -> Self {
        let anchor = if self.inner.anchor.is_empty() {
            at.to_string()
        } else {
            path::join(at, &self.inner.anchor)
        };
        Self::from_source(self.inner.source.clone(), anchor, self.inner.options)
    }

    pub fn anchor(&self) -> &str {
        &self.inner.anchor
    }

    pub fn suppresses_errors(&self) -> bool {
        self.inner.options.suppress_errors
    }

    /// Evaluate against `tree`; errors always propagate.
    pub fn evaluate(&self, tree: &StateValue) -> Result<StateValue> {
        let scope = path::get_value(tree, &self.inner.anchor)
            .ok_or_else(|| StoreError::MissingPath(self.inner.anchor.clone()))?;
        match &self.inner.source {
            Source::Path(relative) => path::get_value(scope, relative)
                .cloned()
                .ok_or_else(|| StoreError::MissingPath(path::join(&self.inner.anchor, relative))),
            Source::Projection {
                dependencies,
                projector,
            } => {
                let args = if dependencies.is_empty() {
                    vec![scope.clone()]
                } else {
                    dependencies
                        .iter()
                        .map(|dependency| dependency.evaluate(scope))
                        .collect::<Result<Vec<_>>>()?
                };
                self.project(args, projector)
            }
        }
    }

    /// Evaluate against `tree`, honouring this selector's `suppress_errors`.
    pub fn select(&self, tree: &StateValue) -> Result<Option<StateValue>> {
        match self.evaluate(tree) {
            Ok(value) => Ok(Some(value)),
            Err(_) if self.suppresses_errors() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn project(&self, args: Vec<StateValue>, projector: &Projector) -> Result<StateValue> {
        if let Some(result) = self.cached(&args) {
            return Ok(result);
        }
        let result = projector(&args).map_err(|err| StoreError::Selector(format!("{err:#}")))?;
        let mut memo = self
            .inner
            .memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *memo = Some(Memo {
            args,
            result: result.clone(),
        });
        Ok(result)
    }

    fn cached(&self, args: &[StateValue]) -> Option<StateValue> {
        let memo = self
            .inner
            .memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let memo = memo.as_ref()?;
        let hit = memo.args.len() == args.len()
            && memo.args.iter().zip(args).all(|(old, new)| old.same(new));
        hit.then(|| memo.result.clone())
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner.source {
            Source::Path(path) => format!("path({path})"),
            Source::Projection { dependencies, .. } => {
                format!("projection({} deps)", dependencies.len())
            }
        };
        f.debug_struct("Selector")
            .field("source", &kind)
            .field("anchor", &self.inner.anchor)
            .field("options", &self.inner.options)
            .finish()
    }
}
