//! Dependency graph of declared parent → child relations.
//!
//! The graph decides mount order (parents strictly before children) and the
//! dot-joined path of every node. It only sees names; the registry feeds it
//! from state definitions.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::core::path;
use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Node names in declaration order.
    nodes: Vec<String>,
    /// Declared children per node, in declaration order.
    children: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from `(name, children)` declarations.
    ///
    /// Every child must itself be declared.
    pub fn from_declarations<I, N, C, S>(declarations: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, C)>,
        N: Into<String>,
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut graph = Self::new();
        for (name, children) in declarations {
            graph.add_node(name, children)?;
        }
        graph.check_edges()?;
        Ok(graph)
    }

    pub fn add_node<N, C, S>(&mut self, name: N, children: C) -> Result<()>
    where
        N: Into<String>,
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        if self.children.contains_key(&name) {
            return Err(StoreError::DuplicateName(name));
        }
        let children = children.into_iter().map(Into::into).collect();
        self.nodes.push(name.clone());
        self.children.insert(name, children);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn children(&self, name: &str) -> &[String] {
        self.children.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    fn check_edges(&self) -> Result<()> {
        for name in &self.nodes {
            for child in self.children(name) {
                if !self.children.contains_key(child) {
                    return Err(StoreError::NotFound(format!(
                        "child '{}' of state '{}' is not declared",
                        child, name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm; roots and siblings keep declaration order.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        self.check_edges()?;
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|name| (name.as_str(), 0)).collect();
        for name in &self.nodes {
            for child in self.children(name) {
                if let Some(degree) = in_degree.get_mut(child.as_str()) {
                    *degree += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .map(String::as_str)
            .filter(|name| in_degree.get(name) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            for child in self.children(name) {
                if let Some(degree) = in_degree.get_mut(child.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .filter(|name| in_degree.get(name.as_str()).is_some_and(|d| *d > 0))
                .cloned()
                .collect();
            return Err(StoreError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Path of every node in `order`; the first declared parent wins.
    pub fn compute_paths(&self, order: &[String]) -> BTreeMap<String, String> {
        let mut parents: HashMap<&str, &str> = HashMap::new();
        for name in &self.nodes {
            for child in self.children(name) {
                parents.entry(child.as_str()).or_insert(name.as_str());
            }
        }

        let mut paths: BTreeMap<String, String> = BTreeMap::new();
        for name in order {
            let node_path = match parents.get(name.as_str()).and_then(|p| paths.get(*p)) {
                Some(parent_path) => path::join(parent_path, name),
                None => name.clone(),
            };
            paths.insert(name.clone(), node_path);
        }
        paths
    }
}
