use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::DfsPostOrder;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::statement::{StatementId, StatementNode};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousClosure {
    pub parent: StatementId,
    pub candidates: Vec<StatementId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureReport {
    /// `(parent, child)` pairs where the child discharged the parent.
    pub closed: Vec<(StatementId, StatementId)>,
    pub ambiguous: Vec<AmbiguousClosure>,
}

/// Applies the proof-closure rule in place.
///
/// On entry `is_resolved` must reflect only the textual state of each node
/// (no open marker) and `proven_by` must be empty. Nodes are visited in
/// postorder over the parent tree so every child is final before its parent
/// is examined. An open node closes when exactly one direct child of a
/// closing kind is resolved; two or more leave it open and are reported.
pub fn resolve_proof_closure(nodes: &mut [StatementNode]) -> ClosureReport {
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by(|a, b| nodes[*a].statement_id.cmp(&nodes[*b].statement_id));

    let mut tree: DiGraph<usize, ()> = DiGraph::with_capacity(nodes.len(), nodes.len());
    let mut by_id: HashMap<StatementId, NodeIndex> = HashMap::with_capacity(nodes.len());
    for &pos in &order {
        let idx = tree.add_node(pos);
        by_id.insert(nodes[pos].statement_id.clone(), idx);
    }
    for &pos in &order {
        let parent = nodes[pos]
            .parent_statement_id
            .as_ref()
            .and_then(|parent| by_id.get(parent));
        if let (Some(&parent), Some(&child)) = (parent, by_id.get(&nodes[pos].statement_id)) {
            if parent != child {
                tree.add_edge(parent, child, ());
            }
        }
    }

    let roots: Vec<NodeIndex> = tree
        .node_indices()
        .filter(|idx| {
            tree.neighbors_directed(*idx, Direction::Incoming)
                .next()
                .is_none()
        })
        .collect();
    // Parent loops have no root; they are swept up by the second pass.
    let starts = roots.into_iter().chain(tree.node_indices());

    let mut report = ClosureReport::default();
    let mut dfs = DfsPostOrder::empty(&tree);
    for start in starts {
        if dfs.finished.contains(start.index()) {
            continue;
        }
        dfs.move_to(start);
        while let Some(idx) = dfs.next(&tree) {
            let pos = tree[idx];
            if nodes[pos].is_resolved {
                continue;
            }
            let mut candidates: Vec<usize> = tree
                .neighbors_directed(idx, Direction::Outgoing)
                .map(|child| tree[child])
                .filter(|&child| nodes[child].kind.can_close_parent() && nodes[child].is_resolved)
                .collect();
            candidates.sort_by(|a, b| nodes[*a].statement_id.cmp(&nodes[*b].statement_id));

            match candidates.as_slice() {
                [] => {}
                [only] => {
                    let child_id = nodes[*only].statement_id.clone();
                    debug!(
                        statement_id = %nodes[pos].statement_id,
                        proven_by = %child_id,
                        "statement closed by child"
                    );
                    nodes[pos].is_resolved = true;
                    nodes[pos].proven_by = Some(child_id.clone());
                    report
                        .closed
                        .push((nodes[pos].statement_id.clone(), child_id));
                }
                many => {
                    let ids: Vec<StatementId> = many
                        .iter()
                        .map(|child| nodes[*child].statement_id.clone())
                        .collect();
                    warn!(
                        statement_id = %nodes[pos].statement_id,
                        candidates = ?ids.iter().map(StatementId::as_str).collect::<Vec<_>>(),
                        "ambiguous proof closure; statement left unresolved"
                    );
                    report.ambiguous.push(AmbiguousClosure {
                        parent: nodes[pos].statement_id.clone(),
                        candidates: ids,
                    });
                }
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::StatementKind;

    fn id(n: u8) -> StatementId {
        StatementId::parse(&format!("00000000-0000-4000-8000-0000000000{n:02x}")).expect("id")
    }

    fn node(n: u8, parent: Option<u8>, kind: StatementKind, open: bool) -> StatementNode {
        StatementNode {
            statement_id: id(n),
            title: format!("s{n}"),
            kind,
            parent_statement_id: parent.map(id),
            dependencies: Vec::new(),
            is_resolved: !open,
            proven_by: None,
            source_path: String::new(),
            companion_path: String::new(),
        }
    }

    #[test]
    fn single_resolved_child_closes_parent() {
        let mut nodes = vec![
            node(1, None, StatementKind::Goal, true),
            node(2, Some(1), StatementKind::Lemma, false),
        ];
        let report = resolve_proof_closure(&mut nodes);
        assert!(nodes[0].is_resolved);
        assert_eq!(nodes[0].proven_by, Some(id(2)));
        assert_eq!(report.closed, vec![(id(1), id(2))]);
        assert!(report.ambiguous.is_empty());
    }

    #[test]
    fn two_resolved_children_are_ambiguous() {
        let mut nodes = vec![
            node(1, None, StatementKind::Goal, true),
            node(2, Some(1), StatementKind::Lemma, false),
            node(3, Some(1), StatementKind::Theorem, false),
        ];
        let report = resolve_proof_closure(&mut nodes);
        assert!(!nodes[0].is_resolved);
        assert_eq!(nodes[0].proven_by, None);
        assert_eq!(report.ambiguous.len(), 1);
        assert_eq!(report.ambiguous[0].candidates, vec![id(2), id(3)]);
    }

    #[test]
    fn closure_propagates_bottom_up_and_ignores_other_kinds() {
        // 1 <- 2 <- 3 chain; 3 closed textually, 4 is a definition child of 1.
        let mut nodes = vec![
            node(1, None, StatementKind::Goal, true),
            node(4, Some(1), StatementKind::Definition, false),
            node(2, Some(1), StatementKind::Theorem, true),
            node(3, Some(2), StatementKind::Lemma, false),
        ];
        resolve_proof_closure(&mut nodes);
        assert_eq!(nodes[2].proven_by, Some(id(3)));
        assert_eq!(nodes[0].proven_by, Some(id(2)));
        assert!(nodes.iter().all(|n| n.is_resolved));
    }

    #[test]
    fn textually_closed_node_is_never_reopened() {
        let mut nodes = vec![
            node(1, None, StatementKind::Theorem, false),
            node(2, Some(1), StatementKind::Lemma, true),
        ];
        resolve_proof_closure(&mut nodes);
        assert!(nodes[0].is_resolved);
        assert_eq!(nodes[0].proven_by, None);
        assert!(!nodes[1].is_resolved);
    }

    #[test]
    fn parent_loops_terminate() {
        let mut nodes = vec![
            node(1, Some(2), StatementKind::Lemma, true),
            node(2, Some(1), StatementKind::Lemma, true),
        ];
        let report = resolve_proof_closure(&mut nodes);
        assert_eq!(report, ClosureReport::default());
    }
}
