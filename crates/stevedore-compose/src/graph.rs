//! Dependency graph management using `petgraph`.
//!
//! Builds a directed graph from the services' `depends_on` sets and
//! resolves a launch ordering for planning output.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use stevedore_common::error::{Result, StevedoreError};

use crate::model::Project;

/// A dependency graph of services.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Internal petgraph representation.
    graph: petgraph::Graph<String, ()>,
    /// Node index of every service by name.
    nodes: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Creates an empty dependency graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: petgraph::Graph::new(),
            nodes: HashMap::new(),
        }
    }

    /// Builds the graph of every service in `project`.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::UnknownService`] if a `depends_on` entry
    /// names a service that is not part of the project.
    pub fn from_project(project: &Project) -> Result<Self> {
        let mut graph = Self::new();
        for name in project.service_names() {
            let _ = graph.add_service(name);
        }
        for service in project.services.values() {
            let dependent = graph.add_service(&service.name);
            for dependency in &service.depends_on {
                if project.service(dependency).is_none() {
                    return Err(StevedoreError::UnknownService {
                        service: service.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
                let dependency = graph.add_service(dependency);
                graph.add_dependency(dependent, dependency);
            }
        }
        Ok(graph)
    }

    /// Adds a service node, returning the existing node if already present.
    pub fn add_service(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        let _ = self.nodes.insert(name.to_string(), idx);
        idx
    }

    /// Adds a dependency edge: `dependent` depends on `dependency`.
    ///
    /// The graph edge points from `dependency` to `dependent`
    /// so that topological sort yields dependencies first.
    pub fn add_dependency(&mut self, dependent: NodeIndex, dependency: NodeIndex) {
        let _ = self.graph.add_edge(dependency, dependent, ());
    }

    /// Returns the number of services in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns `true` if the graph has no services.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns a launch ordering in which dependencies precede dependents.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::CyclicDependency`] if the graph contains a
    /// cycle.
    pub fn launch_order(&self) -> Result<Vec<String>> {
        match petgraph::algo::toposort(&self.graph, None) {
            Ok(indices) => Ok(indices
                .iter()
                .filter_map(|&idx| self.graph.node_weight(idx).cloned())
                .collect()),
            Err(cycle) => Err(StevedoreError::CyclicDependency {
                cycle: self.cycle_through(cycle.node_id()),
            }),
        }
    }

    /// Walks `depends_on` edges from `start` back to itself.
    fn cycle_through(&self, start: NodeIndex) -> Vec<String> {
        let mut path = vec![start];
        let mut visited = HashSet::new();
        if !self.walk_back_to(start, start, &mut path, &mut visited) {
            path.push(start);
        }
        path.iter()
            .filter_map(|&idx| self.graph.node_weight(idx).cloned())
            .collect()
    }

    fn walk_back_to(
        &self,
        start: NodeIndex,
        current: NodeIndex,
        path: &mut Vec<NodeIndex>,
        visited: &mut HashSet<NodeIndex>,
    ) -> bool {
        for next in self.graph.neighbors_directed(current, Direction::Incoming) {
            if next == start {
                path.push(start);
                return true;
            }
            if visited.insert(next) {
                path.push(next);
                if self.walk_back_to(start, next, path, visited) {
                    return true;
                }
                let _ = path.pop();
            }
        }
        false
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}
