use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{find_cycle, format_cycle, EdgeRole, StatementGraph};
use crate::statement::{StatementId, StatementNode};

/// A statement that is not yet indexed, checked against the persisted graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub statement_id: StatementId,
    pub parent_statement_id: Option<StatementId>,
    pub dependencies: Vec<StatementId>,
    pub source_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingReference {
    pub statement_id: StatementId,
    pub role: EdgeRole,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GraphViolation {
    #[error("statement {0} already exists; indexed statements are immutable")]
    AlreadyExists(StatementId),
    #[error("unknown {}", describe_missing(.0))]
    MissingReferences(Vec<MissingReference>),
    #[error("cycle detected: {}", format_cycle(.path))]
    Cycle { path: Vec<StatementId> },
}

fn describe_missing(missing: &[MissingReference]) -> String {
    missing
        .iter()
        .map(|item| match item.role {
            EdgeRole::Parent => format!("parent {}", item.statement_id),
            EdgeRole::Dependency => format!("dependency {}", item.statement_id),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrigin {
    Indexed,
    Candidate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub statement_id: StatementId,
    pub source_path: String,
    pub origin: PlanOrigin,
}

/// Compilation order for a candidate: its ancestors first, the candidate last.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub entries: Vec<PlanEntry>,
}

impl BuildPlan {
    pub fn ids(&self) -> Vec<StatementId> {
        self.entries
            .iter()
            .map(|entry| entry.statement_id.clone())
            .collect()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.source_path.as_str())
    }
}

/// Validates `candidate` against the indexed statements of one project.
///
/// Unlike reindexing, every reference must already exist: a missing parent
/// or dependency is a hard rejection naming each absent id.
pub fn validate_candidate(
    indexed: &[StatementNode],
    candidate: &Candidate,
) -> Result<BuildPlan, GraphViolation> {
    let id = &candidate.statement_id;
    if indexed.iter().any(|node| &node.statement_id == id) {
        return Err(GraphViolation::AlreadyExists(id.clone()));
    }
    if candidate.parent_statement_id.as_ref() == Some(id) || candidate.dependencies.contains(id) {
        return Err(GraphViolation::Cycle {
            path: vec![id.clone()],
        });
    }

    let mut graph = StatementGraph::from_nodes(indexed);
    let mut missing = Vec::new();
    let references = candidate
        .parent_statement_id
        .iter()
        .map(|parent| (parent, EdgeRole::Parent))
        .chain(
            candidate
                .dependencies
                .iter()
                .map(|dep| (dep, EdgeRole::Dependency)),
        );
    graph.add_node(id);
    for (reference, role) in references {
        if !graph.link(reference, id, role)
            && !missing
                .iter()
                .any(|m: &MissingReference| &m.statement_id == reference && m.role == role)
        {
            missing.push(MissingReference {
                statement_id: reference.clone(),
                role,
            });
        }
    }
    if !missing.is_empty() {
        return Err(GraphViolation::MissingReferences(missing));
    }

    if let Some(path) = find_cycle(&graph) {
        return Err(GraphViolation::Cycle { path });
    }

    if let Some(parent) = candidate
        .parent_statement_id
        .as_ref()
        .and_then(|parent| indexed.iter().find(|node| &node.statement_id == parent))
    {
        if parent.is_resolved {
            info!(
                parent = %parent.statement_id,
                statement_id = %id,
                "parent statement is already resolved"
            );
        }
    }

    let order = graph
        .topological_order()
        .map_err(|path| GraphViolation::Cycle { path })?;
    let needed = graph.ancestors(id);
    let entries: Vec<PlanEntry> = order
        .into_iter()
        .filter_map(|step| {
            if &step == id {
                return Some(PlanEntry {
                    statement_id: step,
                    source_path: candidate.source_path.clone(),
                    origin: PlanOrigin::Candidate,
                });
            }
            if !needed.contains(&step) {
                return None;
            }
            let node = indexed.iter().find(|node| node.statement_id == step)?;
            Some(PlanEntry {
                source_path: node.source_path.clone(),
                statement_id: step,
                origin: PlanOrigin::Indexed,
            })
        })
        .collect();
    debug!(statement_id = %id, steps = entries.len(), "build plan ready");
    Ok(BuildPlan { entries })
}
