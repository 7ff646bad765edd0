//! Addresses that select mounted nodes by path, name, context or tree search.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Immutable descriptor of where in the tree an operation targets.
///
/// Only the named constructors create addresses; they are the only legal
/// combinations of fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationAddress {
    context: String,
    name: String,
    path: String,
    search_in_tree: bool,
}

/// The addressable identity of a mounted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAddress<'a> {
    pub path: &'a str,
    pub name: &'a str,
    pub context: &'a str,
}

impl LocationAddress {
    fn new(context: &str, name: &str, path: &str, search_in_tree: bool) -> Self {
        Self {
            context: context.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            search_in_tree,
        }
    }

    pub fn by_name(name: &str) -> Self {
        Self::new("", name, "", false)
    }

    pub fn by_path(path: &str) -> Self {
        Self::new("", "", path, false)
    }

    pub fn by_context(context: &str, name: &str) -> Self {
        Self::new(context, name, "", true)
    }

    pub fn by_path_tree(path: &str, name: &str) -> Self {
        Self::new("", name, path, true)
    }

    pub fn by_all(context: &str, path: &str, name: &str) -> Self {
        Self::new(context, name, path, true)
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn search_in_tree(&self) -> bool {
        self.search_in_tree
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() && self.path.is_empty() && !self.search_in_tree {
            return Err(StoreError::InvalidLocation(format!(
                "{}: needs a name or a path",
                self
            )));
        }
        if self.search_in_tree && self.context.is_empty() && self.path.is_empty() {
            return Err(StoreError::InvalidLocation(format!(
                "{}: tree search needs a context or a root path",
                self
            )));
        }
        Ok(())
    }

    /// Dispatch filter: exact path wins, otherwise name (and context when set).
    pub fn matches(&self, node: NodeAddress<'_>) -> bool {
        if !self.path.is_empty() && self.path == node.path {
            return true;
        }
        if self.name.is_empty() || self.name != node.name {
            return false;
        }
        self.context.is_empty() || self.context == node.context
    }
}

impl fmt::Display for LocationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "location(context='{}', name='{}', path='{}', tree={})",
            self.context, self.name, self.path, self.search_in_tree
        )
    }
}
