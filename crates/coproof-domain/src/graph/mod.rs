//! In-memory statement graph: parent edges point parent -> child and
//! dependency edges point dependency -> dependent.

mod closure;
mod dag;

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::statement::{StatementId, StatementNode};

pub use closure::{resolve_proof_closure, AmbiguousClosure, ClosureReport};
pub use dag::{
    validate_candidate, BuildPlan, Candidate, GraphViolation, MissingReference, PlanEntry,
    PlanOrigin,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeRole {
    Parent,
    Dependency,
}

#[derive(Debug, Default)]
pub struct StatementGraph {
    graph: DiGraph<StatementId, EdgeRole>,
    index: HashMap<StatementId, NodeIndex>,
}

impl StatementGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph of persisted nodes. Edges to ids outside `nodes` are
    /// skipped; nodes are inserted in id order so traversals are stable.
    pub fn from_nodes(nodes: &[StatementNode]) -> Self {
        let mut sorted: Vec<&StatementNode> = nodes.iter().collect();
        sorted.sort_by(|a, b| a.statement_id.cmp(&b.statement_id));

        let mut graph = Self::new();
        for node in &sorted {
            graph.add_node(&node.statement_id);
        }
        for node in &sorted {
            if let Some(parent) = &node.parent_statement_id {
                graph.link(parent, &node.statement_id, EdgeRole::Parent);
            }
            for dep in &node.dependencies {
                graph.link(dep, &node.statement_id, EdgeRole::Dependency);
            }
        }
        graph
    }

    pub fn add_node(&mut self, id: &StatementId) -> NodeIndex {
        if let Some(idx) = self.index.get(id) {
            return *idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.index.insert(id.clone(), idx);
        idx
    }

    /// Adds `from -> to` when both ends are present. Returns whether the edge
    /// was added.
    pub fn link(&mut self, from: &StatementId, to: &StatementId, role: EdgeRole) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => {
                if self.graph.find_edge(a, b).is_none() {
                    self.graph.add_edge(a, b, role);
                }
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, id: &StatementId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Topological order of every node, or the first cycle found.
    pub fn topological_order(&self) -> Result<Vec<StatementId>, Vec<StatementId>> {
        match toposort(&self.graph, None) {
            Ok(order) => Ok(order
                .into_iter()
                .map(|idx| self.graph[idx].clone())
                .collect()),
            Err(_) => Err(find_cycle(self).unwrap_or_default()),
        }
    }

    /// Every node with a path into `id` (parents, dependencies and their
    /// own ancestors), excluding `id` itself.
    pub fn ancestors(&self, id: &StatementId) -> HashSet<StatementId> {
        let Some(&start) = self.index.get(id) else {
            return HashSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut out = HashSet::new();
        while let Some(idx) = dfs.next(reversed) {
            if idx != start {
                out.insert(self.graph[idx].clone());
            }
        }
        out
    }

    fn sorted_successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        next.sort_unstable();
        next.dedup();
        next
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Finds one directed cycle and returns its nodes in path order, starting at
/// the node where the cycle closes. Runs an explicit-stack DFS so deep
/// statement chains cannot overflow the call stack.
pub fn find_cycle(graph: &StatementGraph) -> Option<Vec<StatementId>> {
    let count = graph.graph.node_count();
    let mut marks = vec![Mark::Unvisited; count];

    for root in graph.graph.node_indices() {
        if marks[root.index()] != Mark::Unvisited {
            continue;
        }
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> =
            vec![(root, graph.sorted_successors(root), 0)];
        marks[root.index()] = Mark::OnStack;

        while let Some((node, successors, cursor)) = stack.last_mut() {
            if let Some(&next) = successors.get(*cursor) {
                *cursor += 1;
                match marks[next.index()] {
                    Mark::Unvisited => {
                        marks[next.index()] = Mark::OnStack;
                        let succ = graph.sorted_successors(next);
                        stack.push((next, succ, 0));
                    }
                    Mark::OnStack => {
                        let from = stack
                            .iter()
                            .position(|(idx, _, _)| *idx == next)
                            .unwrap_or(0);
                        return Some(
                            stack[from..]
                                .iter()
                                .map(|(idx, _, _)| graph.graph[*idx].clone())
                                .collect(),
                        );
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node.index()] = Mark::Done;
                stack.pop();
            }
        }
    }
    None
}

/// Renders a cycle as `a -> b -> c -> a`.
pub fn format_cycle(path: &[StatementId]) -> String {
    let mut parts: Vec<&str> = path.iter().map(StatementId::as_str).collect();
    if let Some(first) = path.first() {
        parts.push(first.as_str());
    }
    parts.join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> StatementId {
        StatementId::parse(&format!("00000000-0000-4000-8000-0000000000{n:02x}")).expect("id")
    }

    #[test]
    fn finds_three_node_cycle() {
        let mut graph = StatementGraph::new();
        for n in 1..=4 {
            graph.add_node(&id(n));
        }
        graph.link(&id(4), &id(1), EdgeRole::Dependency);
        graph.link(&id(1), &id(2), EdgeRole::Dependency);
        graph.link(&id(2), &id(3), EdgeRole::Dependency);
        graph.link(&id(3), &id(1), EdgeRole::Dependency);

        let cycle = find_cycle(&graph).expect("cycle");
        assert_eq!(cycle, vec![id(1), id(2), id(3)]);
        assert_eq!(
            format_cycle(&cycle),
            format!("{} -> {} -> {} -> {}", id(1), id(2), id(3), id(1))
        );
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn acyclic_graph_orders_and_reports_ancestors() {
        let mut graph = StatementGraph::new();
        for n in 1..=4 {
            graph.add_node(&id(n));
        }
        graph.link(&id(1), &id(2), EdgeRole::Parent);
        graph.link(&id(2), &id(3), EdgeRole::Dependency);
        graph.link(&id(4), &id(4), EdgeRole::Dependency);
        assert_eq!(find_cycle(&graph), Some(vec![id(4)]));

        let mut clean = StatementGraph::new();
        for n in 1..=3 {
            clean.add_node(&id(n));
        }
        clean.link(&id(1), &id(2), EdgeRole::Parent);
        clean.link(&id(2), &id(3), EdgeRole::Dependency);
        assert_eq!(find_cycle(&clean), None);
        let order = clean.topological_order().expect("dag");
        assert_eq!(order, vec![id(1), id(2), id(3)]);
        let ancestors = clean.ancestors(&id(3));
        assert_eq!(ancestors, HashSet::from([id(1), id(2)]));
    }

    #[test]
    fn links_to_unknown_nodes_are_skipped() {
        let mut graph = StatementGraph::new();
        graph.add_node(&id(1));
        assert!(!graph.link(&id(1), &id(9), EdgeRole::Dependency));
        assert_eq!(graph.edge_count(), 0);
    }
}
