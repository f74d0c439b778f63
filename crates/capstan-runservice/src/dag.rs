//! Task dependency DAG.
//!
//! Used to validate run configs at creation time (dependency closure,
//! acyclicity) and to give the scheduler a deterministic topological
//! order for state propagation.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use capstan_core::{Error, Result};

/// A directed acyclic graph of task keys.
///
/// Topological sorting uses Kahn's algorithm with insertion order as
/// the tie-breaker, so two engines building the same graph walk it in
/// the same order.
#[derive(Debug, Clone)]
pub struct Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    graph: DiGraph<T, ()>,
    index_map: HashMap<T, NodeIndex>,
    insertion_order: Vec<NodeIndex>,
}

impl<T> Dag<T>
where
    T: Clone + Eq + Hash + Display,
{
    /// Creates an empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index_map: HashMap::new(),
            insertion_order: Vec::new(),
        }
    }

    /// Adds a node; a no-op if it already exists.
    pub fn add_node(&mut self, value: T) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(&value) {
            return idx;
        }
        let idx = self.graph.add_node(value.clone());
        self.index_map.insert(value, idx);
        self.insertion_order.push(idx);
        idx
    }

    /// Adds a dependency edge from `from` to `to` (from must complete
    /// first).
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) {
        self.graph.add_edge(from, to, ());
    }

    /// Returns true if the node exists.
    #[must_use]
    pub fn contains(&self, value: &T) -> bool {
        self.index_map.contains_key(value)
    }

    /// Returns the nodes in topological order.
    ///
    /// # Errors
    ///
    /// Returns `Fatal` naming a blocked node if the graph has a cycle.
    pub fn toposort(&self) -> Result<Vec<T>> {
        let node_count = self.graph.node_count();
        let mut in_degree: HashMap<NodeIndex, usize> =
            self.graph.node_indices().map(|idx| (idx, 0)).collect();
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: std::collections::VecDeque<NodeIndex> = self
            .insertion_order
            .iter()
            .filter(|idx| in_degree.get(idx).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        let mut result = Vec::with_capacity(node_count);
        while let Some(idx) = queue.pop_front() {
            if let Some(node) = self.graph.node_weight(idx) {
                result.push(node.clone());
            }

            let mut neighbors: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            neighbors.sort_by_key(|n| {
                self.insertion_order
                    .iter()
                    .position(|i| i == n)
                    .unwrap_or(usize::MAX)
            });
            for neighbor in neighbors {
                if let Some(degree) = in_degree.get_mut(&neighbor) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        if result.len() != node_count {
            let blocked = self
                .insertion_order
                .iter()
                .find(|idx| in_degree.get(idx).copied().unwrap_or(0) > 0)
                .and_then(|idx| self.graph.node_weight(*idx))
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            return Err(Error::fatal(format!(
                "dependency graph has a cycle through {blocked}"
            )));
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
    fn linear_chain_sorts_in_order() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        let b = dag.add_node("b".into());
        let c = dag.add_node("c".into());
        dag.add_edge(a, b);
        dag.add_edge(b, c);

        assert_eq!(dag.toposort().expect("sort"), vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_is_detected() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        let b = dag.add_node("b".into());
        dag.add_edge(a, b);
        dag.add_edge(b, a);

        let err = dag.toposort().unwrap_err();
        assert!(matches!(err, Error::Fatal { .. }));
    }

    #[test]
    fn toposort_is_deterministic_across_runs() {
        let mut dag: Dag<String> = Dag::new();
        let a = dag.add_node("a".into());
        let b = dag.add_node("b".into());
        let c = dag.add_node("c".into());
        let d = dag.add_node("d".into());
        dag.add_edge(a, c);
        dag.add_edge(b, d);

        let first = dag.toposort().expect("sort");
        for _ in 0..5 {
            assert_eq!(dag.toposort().expect("sort"), first);
        }
        assert_eq!(first, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn duplicate_add_node_is_noop() {
        let mut dag: Dag<String> = Dag::new();
        let first = dag.add_node("a".into());
        let second = dag.add_node("a".into());
        assert_eq!(first, second);
        assert!(dag.contains(&"a".to_string()));
    }
}
