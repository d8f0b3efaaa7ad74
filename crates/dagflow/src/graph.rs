//! Directed graph of configuration directories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

/// A directed graph whose nodes are absolute directory paths.
///
/// An edge `a -> b` means `b` depends on `a`: `a` must reach a terminal
/// success state before `b` may start.
#[derive(Debug, Default)]
pub struct DirGraph {
    graph: DiGraph<PathBuf, ()>,
    indices: HashMap<PathBuf, NodeIndex>,
}

impl DirGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Adding an existing node is a no-op.
    pub fn add_node(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.indices.contains_key(&path) {
            let idx = self.graph.add_node(path.clone());
            self.indices.insert(path, idx);
        }
    }

    /// Add an edge `from -> to`, creating either endpoint if missing.
    /// Parallel edges are collapsed.
    pub fn add_edge(&mut self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) {
        let from = from.into();
        let to = to.into();
        self.add_node(from.clone());
        self.add_node(to.clone());
        let a = self.indices[&from];
        let b = self.indices[&to];
        self.graph.update_edge(a, b, ());
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.indices.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All node paths, in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &PathBuf> {
        self.graph.node_indices().map(|idx| &self.graph[idx])
    }

    /// Direct dependencies of `path` (nodes with an edge into it).
    pub fn predecessors(&self, path: &Path) -> Vec<PathBuf> {
        self.neighbors(path, Direction::Incoming)
    }

    /// Direct dependents of `path` (nodes it has an edge into).
    pub fn successors(&self, path: &Path) -> Vec<PathBuf> {
        self.neighbors(path, Direction::Outgoing)
    }

    fn neighbors(&self, path: &Path, dir: Direction) -> Vec<PathBuf> {
        let Some(&idx) = self.indices.get(path) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, dir)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// Nodes with no predecessors. These form the first scheduling frontier.
    pub fn sources(&self) -> Vec<PathBuf> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// True if the graph contains a cycle.
    ///
    /// A non-empty graph with zero source nodes is immediately cyclic (no
    /// node could ever be scheduled); otherwise a full cycle search runs.
    pub fn has_cycle(&self) -> bool {
        if !self.is_empty() && self.sources().is_empty() {
            return true;
        }
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// One offending cycle, for error messages. `None` if the graph is
    /// acyclic.
    pub fn find_cycle(&self) -> Option<Vec<PathBuf>> {
        petgraph::algo::kosaraju_scc(&self.graph)
            .into_iter()
            .find(|scc| scc.len() > 1 || scc.iter().any(|&n| self.graph.contains_edge(n, n)))
            .map(|scc| scc.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    /// The same node set with every edge reversed. Used to run `destroy`
    /// over dependents before their dependencies.
    pub fn reversed(&self) -> Self {
        let mut reversed = Self::new();
        for node in self.nodes() {
            reversed.add_node(node.clone());
        }
        for edge in self.graph.edge_indices() {
            if let Some((a, b)) = self.graph.edge_endpoints(edge) {
                reversed.add_edge(self.graph[b].clone(), self.graph[a].clone());
            }
        }
        reversed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let mut graph = DirGraph::new();
        graph.add_node("/a");
        graph.add_node("/a");
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_add_edge_creates_nodes_and_collapses_duplicates() {
        let mut graph = DirGraph::new();
        graph.add_edge("/a", "/b");
        graph.add_edge("/a", "/b");
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.successors(&path("/a")), vec![path("/b")]);
        assert_eq!(graph.predecessors(&path("/b")), vec![path("/a")]);
    }

    #[test]
    fn test_sources() {
        let mut graph = DirGraph::new();
        graph.add_edge("/a", "/b");
        graph.add_edge("/a", "/c");
        graph.add_node("/d");
        let mut sources = graph.sources();
        sources.sort();
        assert_eq!(sources, vec![path("/a"), path("/d")]);
    }

    #[test]
    fn test_has_cycle_acyclic() {
        let mut graph = DirGraph::new();
        graph.add_edge("/a", "/b");
        graph.add_edge("/b", "/c");
        graph.add_edge("/a", "/c");
        assert!(!graph.has_cycle());
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_has_cycle_no_sources() {
        let mut graph = DirGraph::new();
        graph.add_edge("/a", "/b");
        graph.add_edge("/b", "/a");
        assert!(graph.sources().is_empty());
        assert!(graph.has_cycle());
    }

    #[test]
    fn test_has_cycle_reachable_from_source() {
        let mut graph = DirGraph::new();
        graph.add_edge("/a", "/b");
        graph.add_edge("/b", "/c");
        graph.add_edge("/c", "/b");
        assert!(graph.has_cycle());
        let cycle = graph.find_cycle().unwrap();
        assert!(cycle.contains(&path("/b")));
        assert!(cycle.contains(&path("/c")));
        assert!(!cycle.contains(&path("/a")));
    }

    #[test]
    fn test_reversed() {
        let mut graph = DirGraph::new();
        graph.add_edge("/a", "/b");
        graph.add_edge("/a", "/c");
        let reversed = graph.reversed();
        assert_eq!(reversed.len(), 3);
        assert_eq!(reversed.predecessors(&path("/a")).len(), 2);
        assert_eq!(reversed.sources().len(), 2);
    }

    #[test]
    fn test_missing_node_queries_are_empty() {
        let graph = DirGraph::new();
        assert!(graph.predecessors(&path("/nope")).is_empty());
        assert!(graph.successors(&path("/nope")).is_empty());
        assert!(!graph.contains(&path("/nope")));
    }
}
