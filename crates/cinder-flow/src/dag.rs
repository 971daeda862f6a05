//! Directed acyclic graph checks for planned task graphs.
//!
//! The planner must reject cyclic plans before inserting any task document;
//! a partially inserted cyclic plan is a permanent corruption the scheduler
//! cannot self-repair. This module provides the topological pass used for
//! that validation.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{Error, Result};

/// A directed acyclic graph over planned task ids.
///
/// Supports adding nodes and edges, and a deterministic topological sort
/// used as the cycle check before plan insertion.
#[derive(Debug, Clone)]
pub struct Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    graph: DiGraph<T, ()>,
    index_map: HashMap<T, NodeIndex>,
    /// Insertion order for deterministic tie-breaking in toposort.
    insertion_order: Vec<NodeIndex>,
}

impl<T> Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    /// Creates a new empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index_map: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    /// Adds a node to the DAG.
    ///
    /// If the node already exists, this is a no-op. Returns the node index
    /// for use with [`Dag::add_edge`].
    pub fn add_node(&mut self, value: T) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(&value) {
            return idx;
        }
        let idx = self.graph.add_node(value.clone());
        self.index_map.insert(value, idx);
        self.insertion_order.push(idx);
        idx
    }

    /// Adds a directed edge from `from` to `to`.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) {
        self.graph.add_edge(from, to, ());
    }

    /// Returns the node index for a value, if it exists.
    #[must_use]
    pub fn get_index(&self, value: &T) -> Option<NodeIndex> {
        self.index_map.get(value).copied()
    }

    /// Returns a topologically sorted list of nodes.
    ///
    /// Uses Kahn's algorithm with deterministic tie-breaking: when multiple
    /// nodes have zero in-degree, they are processed in insertion order for
    /// reproducible results.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] if the graph contains a cycle.
    pub fn toposort(&self) -> Result<Vec<T>> {
        let node_count = self.graph.node_count();
        if node_count == 0 {
            return Ok(Vec::new());
        }

        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::with_capacity(node_count);
        for idx in self.graph.node_indices() {
            in_degree.insert(idx, 0);
        }
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<NodeIndex> = self
            .insertion_order
            .iter()
            .filter(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        let mut result = Vec::with_capacity(node_count);

        while let Some(idx) = queue.pop_front() {
            if let Some(node) = self.graph.node_weight(idx) {
                result.push(node.clone());
            }

            let mut neighbors: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, petgraph::Direction::Outgoing)
                .collect();
            neighbors.sort_by_key(|n| {
                self.insertion_order
                    .iter()
                    .position(|&i| i == *n)
                    .unwrap_or(usize::MAX)
            });

            for neighbor in neighbors {
                if let Some(deg) = in_degree.get_mut(&neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        if result.len() != node_count {
            let cycle_members: Vec<String> = self
                .insertion_order
                .iter()
                .filter(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) > 0)
                .filter_map(|&idx| self.graph.node_weight(idx))
                .map(ToString::to_string)
                .collect();

            return Err(Error::CycleDetected {
                cycle: cycle_members,
            });
        }

        Ok(result)
    }
}

impl<T> Default for Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_dag_sorts_to_nothing() {
        let dag: Dag<String> = Dag::new();
        assert!(dag.toposort().unwrap().is_empty());
    }

    #[test]
    fn linear_chain_sorts_in_order() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        let b = dag.add_node("b".into());
        let c = dag.add_node("c".into());
        dag.add_edge(a, b);
        dag.add_edge(b, c);

        assert_eq!(dag.toposort().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicate_nodes_collapse() {
        let mut dag: Dag<String> = Dag::new();
        let a1 = dag.add_node("a".into());
        let a2 = dag.add_node("a".into());
        assert_eq!(a1, a2);
        assert_eq!(dag.toposort().unwrap().len(), 1);
    }

    #[test]
    fn detects_direct_cycle() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        let b = dag.add_node("b".into());
        dag.add_edge(a, b);
        dag.add_edge(b, a);

        let result = dag.toposort();
        assert!(matches!(result, Err(Error::CycleDetected { .. })));
    }

    #[test]
    fn detects_self_cycle() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        dag.add_edge(a, a);

        assert!(matches!(dag.toposort(), Err(Error::CycleDetected { .. })));
    }

    #[test]
    fn cycle_error_names_the_members() {
        let mut dag: Dag<String> = Dag::new();
        let ok = dag.add_node("ok".into());
        let x = dag.add_node("x".into());
        let y = dag.add_node("y".into());
        dag.add_edge(ok, x);
        dag.add_edge(x, y);
        dag.add_edge(y, x);

        let Err(Error::CycleDetected { cycle }) = dag.toposort() else {
            panic!("expected a cycle");
        };
        assert!(cycle.contains(&"x".to_string()));
        assert!(cycle.contains(&"y".to_string()));
        assert!(!cycle.contains(&"ok".to_string()));
    }

    #[test]
    fn diamond_sorts_deterministically() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        let b = dag.add_node("b".into());
        let c = dag.add_node("c".into());
        let d = dag.add_node("d".into());
        dag.add_edge(a, b);
        dag.add_edge(a, c);
        dag.add_edge(b, d);
        dag.add_edge(c, d);

        let sorted1 = dag.toposort().unwrap();
        let sorted2 = dag.toposort().unwrap();
        assert_eq!(sorted1, sorted2);
        assert_eq!(sorted1, vec!["a", "b", "c", "d"]);
    }
}
