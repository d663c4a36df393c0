//! Replicated undirected graph.
//!
//! Node records live in an arena indexed by a sparse id map; each record
//! owns its neighbor set. Neighbor sets are ordered so that snapshots and
//! traversals are deterministic, which the cross-rank replication
//! invariant depends on.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::model::Pid;

#[derive(Debug, Clone)]
struct GraphNode {
    id: Pid,
    adj: BTreeSet<Pid>,
}

/// Arena-backed undirected adjacency graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    index: HashMap<Pid, usize>,
    nodes: Vec<GraphNode>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.nodes.clear();
    }

    fn ensure_node(&mut self, id: Pid) -> usize {
        if let Some(&idx) = self.index.get(&id) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(GraphNode {
            id,
            adj: BTreeSet::new(),
        });
        self.index.insert(id, idx);
        idx
    }

    pub fn add_edge(&mut self, a: Pid, b: Pid) {
        let ia = self.ensure_node(a);
        self.nodes[ia].adj.insert(b);
        let ib = self.ensure_node(b);
        self.nodes[ib].adj.insert(a);
    }

    /// Removes the edge in both directions; returns whether it existed.
    pub fn remove_edge(&mut self, a: Pid, b: Pid) -> bool {
        let mut removed = false;
        if let Some(&ia) = self.index.get(&a) {
            removed |= self.nodes[ia].adj.remove(&b);
        }
        if let Some(&ib) = self.index.get(&b) {
            removed |= self.nodes[ib].adj.remove(&a);
        }
        removed
    }

    pub fn contains(&self, id: Pid) -> bool {
        self.index.contains_key(&id)
    }

    pub fn has_edge(&self, a: Pid, b: Pid) -> bool {
        self.index
            .get(&a)
            .map(|&ia| self.nodes[ia].adj.contains(&b))
            .unwrap_or(false)
    }

    pub fn neighbors(&self, id: Pid) -> Option<&BTreeSet<Pid>> {
        self.index.get(&id).map(|&idx| &self.nodes[idx].adj)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Sum of directed degrees; identical on every rank when the graphs
    /// are synchronized.
    pub fn degree_sum(&self) -> usize {
        self.nodes.iter().map(|n| n.adj.len()).sum()
    }

    /// Breadth-first search from `root`; the component always contains
    /// `root`, even when it has no recorded edges.
    pub fn component(&self, root: Pid) -> BTreeSet<Pid> {
        let mut visited = BTreeSet::new();
        visited.insert(root);
        let mut queue = VecDeque::new();
        queue.push_back(root);
        while let Some(current) = queue.pop_front() {
            if let Some(adj) = self.neighbors(current) {
                for &node in adj {
                    if visited.insert(node) {
                        queue.push_back(node);
                    }
                }
            }
        }
        visited
    }

    /// Subgraph induced by the component containing `root`.
    pub fn subgraph(&self, root: Pid) -> Graph {
        let mut sub = Graph::new();
        sub.ensure_node(root);
        for node in self.component(root) {
            sub.ensure_node(node);
            if let Some(adj) = self.neighbors(node) {
                for &other in adj {
                    sub.add_edge(node, other);
                }
            }
        }
        sub
    }

    pub fn connected_components(&self) -> Vec<Graph> {
        let mut seen: BTreeSet<Pid> = BTreeSet::new();
        let mut components = Vec::new();
        let mut ids: Vec<Pid> = self.index.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if !seen.contains(&id) {
                let sub = self.subgraph(id);
                for (node, _) in sub.snapshot() {
                    seen.insert(node);
                }
                components.push(sub);
            }
        }
        components
    }

    pub fn path_exists(&self, a: Pid, b: Pid) -> bool {
        if a == b {
            return true;
        }
        self.component(a).contains(&b)
    }

    /// Nodes reachable within `max_depth` hops of `root` (excluding the
    /// root itself) with their hop distances, in BFS discovery order.
    pub fn bfs_up_to(&self, root: Pid, max_depth: i64) -> Vec<(Pid, i64)> {
        let mut result = Vec::new();
        let mut visited: HashMap<Pid, i64> = HashMap::new();
        visited.insert(root, 0);
        let mut queue = VecDeque::new();
        queue.push_back(root);
        while let Some(current) = queue.pop_front() {
            let new_distance = visited[&current] + 1;
            if let Some(adj) = self.neighbors(current) {
                for &node in adj {
                    if !visited.contains_key(&node) {
                        visited.insert(node, new_distance);
                        result.push((node, new_distance));
                        if new_distance < max_depth {
                            queue.push_back(node);
                        }
                    }
                }
            }
        }
        result
    }

    /// Deterministic adjacency listing; equal snapshots mean equal
    /// graphs.
    pub fn snapshot(&self) -> Vec<(Pid, Vec<Pid>)> {
        let mut listing: Vec<(Pid, Vec<Pid>)> = self
            .nodes
            .iter()
            .map(|n| (n.id, n.adj.iter().copied().collect()))
            .collect();
        listing.sort_unstable_by_key(|(id, _)| *id);
        listing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(ids: &[Pid]) -> Graph {
        let mut g = Graph::new();
        for w in ids.windows(2) {
            g.add_edge(w[0], w[1]);
        }
        g
    }

    #[test]
    fn edges_are_undirected() {
        let mut g = Graph::new();
        g.add_edge(1, 2);
        assert!(g.has_edge(1, 2));
        assert!(g.has_edge(2, 1));
        assert!(g.remove_edge(2, 1));
        assert!(!g.has_edge(1, 2));
        assert!(!g.remove_edge(1, 2));
    }

    #[test]
    fn component_includes_isolated_root() {
        let g = Graph::new();
        let comp = g.component(5);
        assert_eq!(comp.into_iter().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn components_partition_the_graph() {
        let mut g = chain(&[1, 2, 3]);
        g.add_edge(10, 11);
        let components = g.connected_components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].node_count(), 3);
        assert_eq!(components[1].node_count(), 2);
    }

    #[test]
    fn path_queries() {
        let g = chain(&[1, 2, 3, 4]);
        assert!(g.path_exists(1, 4));
        assert!(g.path_exists(4, 1));
        assert!(!g.path_exists(1, 9));
        assert!(g.path_exists(7, 7));
    }

    #[test]
    fn bfs_distances_are_bounded() {
        let g = chain(&[1, 2, 3, 4, 5]);
        let mut found = g.bfs_up_to(1, 2);
        found.sort_unstable();
        assert_eq!(found, vec![(2, 1), (3, 2)]);
    }

    #[test]
    fn snapshots_are_order_independent() {
        let mut a = Graph::new();
        a.add_edge(1, 2);
        a.add_edge(2, 3);
        let mut b = Graph::new();
        b.add_edge(3, 2);
        b.add_edge(2, 1);
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn subgraph_restricts_to_component() {
        let mut g = chain(&[1, 2, 3]);
        g.add_edge(10, 11);
        let sub = g.subgraph(2);
        assert_eq!(sub.node_count(), 3);
        assert!(sub.has_edge(1, 2));
        assert!(!sub.contains(10));
    }
}
