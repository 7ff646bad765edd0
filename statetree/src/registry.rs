//! The collection of mounted nodes and the rules for adding and removing them.
//!
//! The registry is plain data: it never touches the shared tree and never
//! runs user hooks. The store applies its results (seeding defaults, firing
//! teardown hooks) after releasing the registry lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::core::graph::DependencyGraph;
use crate::core::invariants::{check_state_name, check_unique_names};
use crate::core::location::{LocationAddress, NodeAddress};
use crate::core::path;
use crate::core::value::StateValue;
use crate::definition::{ActionHandlerMeta, StateDefinition};
use crate::error::{Result, StoreError};
use crate::instance::{InstanceHandle, InstanceProvider};
use crate::selector::Selector;

/// A definition mounted at one path of the tree.
#[derive(Clone)]
pub struct MountedNode {
    pub name: String,
    pub path: String,
    pub context: String,
    pub definition: Arc<StateDefinition>,
    pub instance: InstanceHandle,
    pub defaults: StateValue,
    pub actions: Arc<BTreeMap<String, Vec<ActionHandlerMeta>>>,
    /// Flattened selectors, anchored at `path`.
    pub selectors: Arc<BTreeMap<String, Selector>>,
}

impl MountedNode {
    fn new(
        name: &str,
        node_path: &str,
        context: &str,
        definition: &Arc<StateDefinition>,
        instance: InstanceHandle,
    ) -> Self {
        Self {
            name: name.to_string(),
            path: node_path.to_string(),
            context: context.to_string(),
            definition: definition.clone(),
            instance,
            defaults: definition.defaults(),
            actions: Arc::new(definition.flattened_actions()),
            selectors: Arc::new(anchor_selectors(definition, node_path)),
        }
    }

    pub fn address(&self) -> NodeAddress<'_> {
        NodeAddress {
            path: &self.path,
            name: &self.name,
            context: &self.context,
        }
    }

    pub fn handles(&self, action_type: &str) -> bool {
        self.actions.contains_key(action_type)
    }

    fn relocated(&self, name: &str, node_path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: node_path.to_string(),
            selectors: Arc::new(anchor_selectors(&self.definition, node_path)),
            ..self.clone()
        }
    }
}

fn anchor_selectors(definition: &StateDefinition, node_path: &str) -> BTreeMap<String, Selector> {
    definition
        .flattened_selectors()
        .into_iter()
        .map(|(name, selector)| (name, selector.anchored(node_path)))
        .collect()
}

impl fmt::Debug for MountedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountedNode")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("context", &self.context)
            .field("definition", &self.definition.name())
            .finish_non_exhaustive()
    }
}

/// How a dynamic child's parent is looked up.
#[derive(Debug, Clone, Copy)]
pub enum ParentQuery<'a> {
    /// Unique node with this name in this context.
    Named { name: &'a str, context: &'a str },
    /// Unique node of this definition type in this context, optionally
    /// narrowed by name.
    OfTypeInContext {
        definition: &'a Arc<StateDefinition>,
        context: &'a str,
        name: Option<&'a str>,
    },
    /// Unique node of this definition type at or below this path.
    OfTypeUnderPath {
        definition: &'a Arc<StateDefinition>,
        path: &'a str,
    },
    /// The node mounted exactly at this path.
    AtPath(&'a str),
}

impl fmt::Display for ParentQuery<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentQuery::Named { name, context } => {
                write!(f, "state '{}' in context '{}'", name, context)
            }
            ParentQuery::OfTypeInContext {
                definition,
                context,
                name,
            } => {
                write!(f, "state of type '{}' in context '{}'", definition.name(), context)?;
                if let Some(name) = name {
                    write!(f, " named '{}'", name)?;
                }
                Ok(())
            }
            ParentQuery::OfTypeUnderPath { definition, path } => {
                write!(f, "state of type '{}' under path '{}'", definition.name(), path)
            }
            ParentQuery::AtPath(path) => write!(f, "state at path '{}'", path),
        }
    }
}

/// Result of a dynamic child mount.
#[derive(Debug, Default)]
pub struct ChildMount {
    /// Newly created nodes, parents before children.
    pub nodes: Vec<Arc<MountedNode>>,
    /// Paths skipped because a node already occupies them.
    pub skipped: Vec<String>,
}

/// Result of removing a subtree.
#[derive(Debug, Default)]
pub struct Removal {
    pub removed: Vec<Arc<MountedNode>>,
    /// One removed node per instance no surviving node references.
    pub orphaned: Vec<Arc<MountedNode>>,
}

#[derive(Debug, Default)]
pub struct StateRegistry {
    nodes: Vec<Arc<MountedNode>>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Arc<MountedNode>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Mount `definitions` and everything they declare as children.
    ///
    /// Nodes whose computed path is already occupied are skipped. Returns the
    /// new nodes in topological order.
    pub fn mount(
        &mut self,
        definitions: &[Arc<StateDefinition>],
        main_context: &str,
        provider: &dyn InstanceProvider,
    ) -> Result<Vec<Arc<MountedNode>>> {
        let expanded = expand_children(definitions);
        for def in &expanded {
            check_state_name(def.name())?;
            self.check_registered(def)?;
        }
        check_unique_names(expanded.iter().map(|def| (def.name(), def.id())))?;

        let graph = DependencyGraph::from_declarations(expanded.iter().map(|def| {
            let children: Vec<String> = def
                .children()
                .iter()
                .map(|child| child.name().to_string())
                .collect();
            (def.name().to_string(), children)
        }))?;
        let order = graph.topological_sort()?;
        let paths = graph.compute_paths(&order);
        let by_name: HashMap<&str, &Arc<StateDefinition>> =
            expanded.iter().map(|def| (def.name(), def)).collect();

        let mut mounted = Vec::with_capacity(order.len());
        for name in &order {
            let (Some(def), Some(node_path)) = (by_name.get(name.as_str()), paths.get(name)) else {
                continue;
            };
            if self.find_by_path(node_path).is_some() {
                debug!(state = %name, path = %node_path, "state already mounted");
                continue;
            }
            let instance = provider.instance_for(def);
            let node = Arc::new(MountedNode::new(name, node_path, main_context, def, instance));
            debug!(state = %name, path = %node_path, "mounted state");
            self.nodes.push(node.clone());
            mounted.push(node);
        }
        Ok(mounted)
    }

    /// Mount `child` (and its declared descendants) under `parent`.
    pub fn add_child(
        &mut self,
        parent: &Arc<MountedNode>,
        child: &Arc<StateDefinition>,
        child_name: Option<&str>,
        provider: &dyn InstanceProvider,
    ) -> Result<ChildMount> {
        let mut result = ChildMount::default();
        self.add_child_inner(parent, child, child_name, provider, &mut result)?;
        Ok(result)
    }

    fn add_child_inner(
        &mut self,
        parent: &Arc<MountedNode>,
        child: &Arc<StateDefinition>,
        child_name: Option<&str>,
        provider: &dyn InstanceProvider,
        result: &mut ChildMount,
    ) -> Result<()> {
        let name = child_name.unwrap_or(child.name());
        check_state_name(name)?;
        self.check_registered(child)?;

        let child_path = path::join(&parent.path, name);
        if self.find_by_path(&child_path).is_some() {
            result.skipped.push(child_path);
            return Ok(());
        }

        let instance = provider.instance_for(child);
        let node = Arc::new(MountedNode::new(
            name,
            &child_path,
            &parent.context,
            child,
            instance,
        ));
        debug!(state = %name, path = %child_path, "added child state");
        self.nodes.push(node.clone());
        result.nodes.push(node.clone());

        for grandchild in child.children() {
            self.add_child_inner(&node, grandchild, None, provider, result)?;
        }
        Ok(())
    }

    /// A definition name may only ever refer to one mounted definition.
    fn check_registered(&self, def: &Arc<StateDefinition>) -> Result<()> {
        let clash = self
            .nodes
            .iter()
            .any(|node| node.definition.name() == def.name() && !node.definition.is(def));
        if clash {
            return Err(StoreError::DuplicateName(def.name().to_string()));
        }
        Ok(())
    }

    pub fn resolve_parent(&self, query: ParentQuery<'_>) -> Result<Arc<MountedNode>> {
        let candidates: Vec<&Arc<MountedNode>> = match query {
            ParentQuery::Named { name, context } => self
                .nodes
                .iter()
                .filter(|node| node.name == name && node.context == context)
                .collect(),
            ParentQuery::OfTypeInContext {
                definition,
                context,
                name,
            } => self
                .nodes
                .iter()
                .filter(|node| node.context == context && node.definition.derives_from(definition))
                .filter(|node| name.is_none_or(|name| node.name == name))
                .collect(),
            ParentQuery::OfTypeUnderPath { definition, path: under } => self
                .nodes
                .iter()
                .filter(|node| {
                    path::is_within(&node.path, under) && node.definition.derives_from(definition)
                })
                .collect(),
            ParentQuery::AtPath(at) => self.nodes.iter().filter(|node| node.path == at).collect(),
        };
        unique(candidates, || format!("parent {}", query))
    }

    pub fn find_by_path(&self, node_path: &str) -> Option<&Arc<MountedNode>> {
        self.nodes.iter().find(|node| node.path == node_path)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Arc<MountedNode>> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Nodes mounted from `definition` (not from types derived from it).
    pub fn nodes_of(&self, definition: &Arc<StateDefinition>) -> Vec<Arc<MountedNode>> {
        self.nodes
            .iter()
            .filter(|node| node.definition.is(definition))
            .cloned()
            .collect()
    }

    /// Deepest node whose path contains `target`.
    pub fn owner_of(&self, target: &str) -> Option<&Arc<MountedNode>> {
        self.nodes
            .iter()
            .filter(|node| path::is_within(target, &node.path))
            .max_by_key(|node| node.path.len())
    }

    /// Remove the node at `root` and every descendant.
    pub fn remove_within(&mut self, root: &str) -> Removal {
        let (removed, survivors): (Vec<_>, Vec<_>) = std::mem::take(&mut self.nodes)
            .into_iter()
            .partition(|node| path::is_within(&node.path, root));
        self.nodes = survivors;

        let mut orphaned: Vec<Arc<MountedNode>> = Vec::new();
        for node in &removed {
            let shared = self
                .nodes
                .iter()
                .any(|survivor| survivor.instance.same(&node.instance));
            let seen = orphaned
                .iter()
                .any(|other| other.instance.same(&node.instance));
            if !shared && !seen {
                orphaned.push(node.clone());
            }
        }

        debug!(path = %root, removed = removed.len(), "removed state subtree");
        Removal { removed, orphaned }
    }

    /// Move every node at or below `from` to the same place below `to`.
    pub fn rebase(&mut self, from: &str, to: &str) -> Result<usize> {
        if self.find_by_path(from).is_none() {
            return Err(StoreError::NotFound(format!("no state mounted at '{}'", from)));
        }
        if self.nodes.iter().any(|node| path::is_within(&node.path, to)) {
            return Err(StoreError::PathOccupied(to.to_string()));
        }
        for segment in path::segments(to) {
            check_state_name(segment)?;
        }

        let mut moved = 0;
        for node in &mut self.nodes {
            let Some(next_path) = path::rebase(&node.path, from, to) else {
                continue;
            };
            let name = if node.path == from {
                path::leaf_name(to).to_string()
            } else {
                node.name.clone()
            };
            *node = Arc::new(node.relocated(&name, &next_path));
            moved += 1;
        }
        debug!(from = %from, to = %to, moved, "moved state subtree");
        Ok(moved)
    }

    /// Resolve a location to the path of the node it designates.
    pub fn resolve_location(&self, location: &LocationAddress) -> Result<String> {
        location.validate()?;
        if !location.search_in_tree() {
            if !location.path().is_empty() {
                return Ok(location.path().to_string());
            }
            let candidates: Vec<_> = self
                .nodes
                .iter()
                .filter(|node| node.name == location.name())
                .collect();
            return unique(candidates, || format!("state named '{}'", location.name()))
                .map(|node| node.path.clone());
        }

        let candidates: Vec<_> = if !location.context().is_empty() {
            self.nodes
                .iter()
                .filter(|node| node.context == location.context() && node.name == location.name())
                .collect()
        } else {
            self.nodes
                .iter()
                .filter(|node| {
                    path::is_within(&node.path, location.path()) && node.name == location.name()
                })
                .collect()
        };
        unique(candidates, || location.to_string()).map(|node| node.path.clone())
    }
}

fn unique(
    candidates: Vec<&Arc<MountedNode>>,
    describe: impl FnOnce() -> String,
) -> Result<Arc<MountedNode>> {
    match candidates.as_slice() {
        [] => Err(StoreError::NotFound(format!("{} not found", describe()))),
        [node] => Ok((*node).clone()),
        many => Err(StoreError::AmbiguousLocation(format!(
            "{} is ambiguous: {}",
            describe(),
            many.iter()
                .map(|node| node.path.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// `definitions` plus every transitively declared child, first occurrence
/// first.
fn expand_children(definitions: &[Arc<StateDefinition>]) -> Vec<Arc<StateDefinition>> {
    let mut seen = HashSet::new();
    let mut expanded = Vec::new();
    let mut stack: Vec<Arc<StateDefinition>> = definitions.iter().rev().cloned().collect();
    while let Some(def) = stack.pop() {
        if !seen.insert(def.id()) {
            continue;
        }
        stack.extend(def.children().iter().rev().cloned());
        expanded.push(def);
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{SingletonProvider, StateInstance};
    use serde_json::json;

    fn def(name: &str) -> Arc<StateDefinition> {
        StateDefinition::builder(name).build()
    }

    fn def_with(name: &str, children: &[&Arc<StateDefinition>]) -> Arc<StateDefinition> {
        children
            .iter()
            .fold(StateDefinition::builder(name), |builder, child| {
                builder.child((*child).clone())
            })
            .build()
    }

    fn paths(nodes: &[Arc<MountedNode>]) -> Vec<&str> {
        nodes.iter().map(|node| node.path.as_str()).collect()
    }

    fn mounted(defs: &[Arc<StateDefinition>]) -> StateRegistry {
        let mut registry = StateRegistry::new();
        registry
            .mount(defs, "main", &SingletonProvider::new())
            .expect("mount");
        registry
    }

    #[test]
    fn mount_expands_children_and_orders_parents_first() {
        let c = def("c");
        let b = def_with("b", &[&c]);
        let a = def_with("a", &[&b]);
        let registry = mounted(&[a]);
        assert_eq!(paths(registry.nodes()), vec!["a", "a.b", "a.b.c"]);
    }

    #[test]
    fn mount_is_idempotent_per_path() {
        let a = def("a");
        let provider = SingletonProvider::new();
        let mut registry = StateRegistry::new();
        let first = registry.mount(&[a.clone()], "main", &provider).expect("mount");
        let second = registry.mount(&[a], "main", &provider).expect("mount");
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn mount_places_a_dynamic_child_definition_at_its_root_path() {
        let item = def("item");
        let mut registry = mounted(&[def("list")]);
        let provider = SingletonProvider::new();
        let parent = registry.find_by_name("list").cloned().expect("list");
        registry
            .add_child(&parent, &item, Some("first"), &provider)
            .expect("add");

        let fresh = registry.mount(&[item], "main", &provider).expect("mount");
        assert_eq!(paths(&fresh), vec!["item"]);
        assert_eq!(paths(registry.nodes()), vec!["list", "list.first", "item"]);
    }

    #[test]
    fn mount_rejects_invalid_and_duplicate_names() {
        let provider = SingletonProvider::new();
        let mut registry = StateRegistry::new();
        let err = registry
            .mount(&[def("bad.name")], "main", &provider)
            .expect_err("invalid");
        assert!(matches!(err, StoreError::InvalidName(_)));

        let err = registry
            .mount(&[def("twin"), def("twin")], "main", &provider)
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::DuplicateName(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn add_child_skips_occupied_path() {
        let a = def("a");
        let mut registry = mounted(&[a]);
        let parent = registry.find_by_name("a").cloned().expect("parent");
        let provider = SingletonProvider::new();
        let child = def_with("child", &[&def("leaf")]);

        let first = registry
            .add_child(&parent, &child, None, &provider)
            .expect("add");
        assert_eq!(paths(&first.nodes), vec!["a.child", "a.child.leaf"]);

        let second = registry
            .add_child(&parent, &child, None, &provider)
            .expect("add again");
        assert!(second.nodes.is_empty());
        assert_eq!(second.skipped, vec!["a.child"]);
    }

    #[test]
    fn resolve_parent_reports_missing_and_ambiguous() {
        let item = def("item");
        let list = def("list");
        let mut registry = mounted(&[list.clone()]);
        let provider = SingletonProvider::new();
        let parent = registry.find_by_name("list").cloned().expect("list");
        registry
            .add_child(&parent, &item, Some("first"), &provider)
            .expect("first");
        registry
            .add_child(&parent, &item, Some("second"), &provider)
            .expect("second");

        let err = registry
            .resolve_parent(ParentQuery::OfTypeUnderPath {
                definition: &item,
                path: "list",
            })
            .expect_err("ambiguous");
        assert!(matches!(err, StoreError::AmbiguousLocation(_)));

        let found = registry
            .resolve_parent(ParentQuery::OfTypeUnderPath {
                definition: &item,
                path: "list.second",
            })
            .expect("unique");
        assert_eq!(found.path, "list.second");

        let err = registry
            .resolve_parent(ParentQuery::Named {
                name: "list",
                context: "other",
            })
            .expect_err("missing");
        assert!(err.is_lookup());
    }

    /// Teardown candidates are reported once per instance that no survivor shares.
    #[test]
    fn remove_within_reports_orphaned_instances_once() {
        struct Shared;
        impl StateInstance for Shared {}

        let shared = Arc::new(Shared);
        let item = StateDefinition::builder("item")
            .shared_instance(shared)
            .build();
        let list = def("list");
        let mut registry = mounted(&[list]);
        let parent = registry.find_by_name("list").cloned().expect("list");
        let provider = SingletonProvider::new();
        for name in ["one", "two"] {
            registry
                .add_child(&parent, &item, Some(name), &provider)
                .expect("add");
        }

        let removal = registry.remove_within("list.one");
        assert_eq!(paths(&removal.removed), vec!["list.one"]);
        assert!(removal.orphaned.is_empty());

        let removal = registry.remove_within("list");
        assert_eq!(removal.removed.len(), 2);
        assert_eq!(removal.orphaned.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_within_respects_segment_boundaries() {
        let mut registry = mounted(&[def("ab"), def("a")]);
        registry.remove_within("a");
        assert_eq!(paths(registry.nodes()), vec!["ab"]);
    }

    #[test]
    fn rebase_moves_paths_and_reanchors_selectors() {
        let b = StateDefinition::builder("b")
            .defaults(json!({"n": 1}))
            .selector("n", Selector::path("n"))
            .build();
        let a = def_with("a", &[&b]);
        let mut registry = mounted(&[a, def("z")]);
        let moved = registry.rebase("a", "x").expect("rebase");
        assert_eq!(moved, 2);
        assert_eq!(paths(registry.nodes()), vec!["x", "z", "x.b"]);
        let node = registry.find_by_path("x.b").expect("moved");
        assert_eq!(node.selectors["n"].anchor(), "x.b");
        assert_eq!(registry.find_by_path("x").expect("root").name, "x");

        let err = registry.rebase("x", "z").expect_err("occupied");
        assert!(matches!(err, StoreError::PathOccupied(_)));
    }

    #[test]
    fn resolve_location_by_each_constructor() {
        let b = def("b");
        let a = def_with("a", &[&b]);
        let registry = mounted(&[a]);
        let resolve = |location: LocationAddress| registry.resolve_location(&location);

        assert_eq!(resolve(LocationAddress::by_name("b")).expect("name"), "a.b");
        assert_eq!(resolve(LocationAddress::by_path("a.b")).expect("path"), "a.b");
        assert_eq!(
            resolve(LocationAddress::by_context("main", "b")).expect("context"),
            "a.b"
        );
        assert_eq!(
            resolve(LocationAddress::by_path_tree("a", "b")).expect("tree"),
            "a.b"
        );
        assert!(resolve(LocationAddress::by_name("nope")).is_err());
        assert!(matches!(
            resolve(LocationAddress::by_name("")),
            Err(StoreError::InvalidLocation(_))
        ));
    }
}
