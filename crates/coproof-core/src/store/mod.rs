//! Persisted statement graph, one snapshot per project.

mod sqlite;

use coproof_domain::{StatementId, StatementNode};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use sqlite::SqliteStatementStore;

/// Full replacement set for one project's index.
#[derive(Clone, Debug, Default)]
pub struct IndexBatch {
    pub nodes: Vec<StatementNode>,
    /// Default-branch commit the nodes were read from.
    pub commit: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub project: String,
    pub commit: Option<String>,
    /// RFC 3339 timestamp of the last reindex.
    pub indexed_at: String,
    pub node_count: usize,
}

pub trait StatementStore: Send + Sync {
    /// Replaces the project's nodes and edges with `batch` atomically.
    /// Nodes absent from the batch are deleted.
    fn apply_reindex(&self, project: &str, batch: &IndexBatch) -> Result<ProjectSnapshot>;

    /// All nodes of a project, ordered by id.
    fn load_project(&self, project: &str) -> Result<Vec<StatementNode>>;

    fn get(&self, project: &str, id: &StatementId) -> Result<Option<StatementNode>>;

    fn children(&self, project: &str, id: &StatementId) -> Result<Vec<StatementNode>>;

    /// Nodes that list `id` as a dependency.
    fn dependents(&self, project: &str, id: &StatementId) -> Result<Vec<StatementId>>;

    fn snapshot(&self, project: &str) -> Result<Option<ProjectSnapshot>>;
}
