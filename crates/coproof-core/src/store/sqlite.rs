use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use coproof_domain::{StatementId, StatementKind, StatementNode};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};

use super::{IndexBatch, ProjectSnapshot, StatementStore};
use crate::error::{EngineError, Result};

const SCHEMA_VERSION: u32 = 1;
const NODE_COLUMNS: &str = "statement_id, title, kind, parent_statement_id, is_resolved, \
     proven_by, source_path, companion_path";

/// SQLite-backed statement index. Each call opens its own connection, so
/// the store can be shared freely across threads and processes.
#[derive(Clone, Debug)]
pub struct SqliteStatementStore {
    path: PathBuf,
}

impl SqliteStatementStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into() };
        if let Some(parent) = store.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| EngineError::io(format!("failed to create {}", parent.display()), err))?;
        }
        let conn = store.connection()?;
        init_schema(&conn)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(10))?;
        Ok(conn)
    }

    fn with_immediate_tx<T>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn query_nodes(&self, project: &str, filter: &str, arg: Option<&str>) -> Result<Vec<StatementNode>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM statements WHERE project_id = ?1 {filter} ORDER BY statement_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let raw = match arg {
            Some(arg) => stmt
                .query_map(params![project, arg], RawNode::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![project], RawNode::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        attach_dependencies(&conn, project, raw)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS statements (
            project_id TEXT NOT NULL,
            statement_id TEXT NOT NULL,
            title TEXT NOT NULL,
            kind TEXT NOT NULL,
            parent_statement_id TEXT,
            is_resolved INTEGER NOT NULL,
            proven_by TEXT,
            source_path TEXT NOT NULL,
            companion_path TEXT NOT NULL,
            PRIMARY KEY(project_id, statement_id)
        );
        CREATE INDEX IF NOT EXISTS statements_parent
            ON statements(project_id, parent_statement_id);
        CREATE TABLE IF NOT EXISTS statement_dependencies (
            project_id TEXT NOT NULL,
            statement_id TEXT NOT NULL,
            dependency_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY(project_id, statement_id, dependency_id),
            FOREIGN KEY(project_id, statement_id)
                REFERENCES statements(project_id, statement_id) ON DELETE CASCADE,
            FOREIGN KEY(project_id, dependency_id)
                REFERENCES statements(project_id, statement_id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS statement_dependents
            ON statement_dependencies(project_id, dependency_id);
        CREATE TABLE IF NOT EXISTS project_snapshots (
            project_id TEXT PRIMARY KEY,
            commit_sha TEXT,
            indexed_at TEXT NOT NULL,
            node_count INTEGER NOT NULL
        );
        ",
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )?;
    let found: String = conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    if found != SCHEMA_VERSION.to_string() {
        return Err(EngineError::StoreCorrupt(format!(
            "index schema version {found} is not supported (expected {SCHEMA_VERSION})"
        )));
    }
    Ok(())
}

/// Row shape before ids and kinds are validated.
struct RawNode {
    statement_id: String,
    title: String,
    kind: String,
    parent: Option<String>,
    is_resolved: bool,
    proven_by: Option<String>,
    source_path: String,
    companion_path: String,
}

impl RawNode {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            statement_id: row.get(0)?,
            title: row.get(1)?,
            kind: row.get(2)?,
            parent: row.get(3)?,
            is_resolved: row.get(4)?,
            proven_by: row.get(5)?,
            source_path: row.get(6)?,
            companion_path: row.get(7)?,
        })
    }

    fn into_node(self, dependencies: Vec<StatementId>) -> Result<StatementNode> {
        let kind = self
            .kind
            .parse::<StatementKind>()
            .map_err(|err| EngineError::StoreCorrupt(format!("{}: {err}", self.statement_id)))?;
        Ok(StatementNode {
            statement_id: stored_id(&self.statement_id)?,
            title: self.title,
            kind,
            parent_statement_id: self.parent.as_deref().map(stored_id).transpose()?,
            dependencies,
            is_resolved: self.is_resolved,
            proven_by: self.proven_by.as_deref().map(stored_id).transpose()?,
            source_path: self.source_path,
            companion_path: self.companion_path,
        })
    }
}

fn stored_id(raw: &str) -> Result<StatementId> {
    StatementId::parse(raw).map_err(|err| EngineError::StoreCorrupt(err.to_string()))
}

fn attach_dependencies(
    conn: &Connection,
    project: &str,
    raw: Vec<RawNode>,
) -> Result<Vec<StatementNode>> {
    let mut edges: BTreeMap<String, Vec<StatementId>> = BTreeMap::new();
    let mut stmt = conn.prepare(
        "SELECT statement_id, dependency_id FROM statement_dependencies \
         WHERE project_id = ?1 ORDER BY statement_id, position",
    )?;
    let rows = stmt.query_map(params![project], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (from, to) = row?;
        edges.entry(from).or_default().push(stored_id(&to)?);
    }
    raw.into_iter()
        .map(|node| {
            let deps = edges.remove(&node.statement_id).unwrap_or_default();
            node.into_node(deps)
        })
        .collect()
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|err| EngineError::StoreCorrupt(format!("failed to format timestamp: {err}")))
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<ProjectSnapshot> {
    let count: i64 = row.get(3)?;
    Ok(ProjectSnapshot {
        project: row.get(0)?,
        commit: row.get(1)?,
        indexed_at: row.get(2)?,
        node_count: usize::try_from(count).unwrap_or_default(),
    })
}

impl StatementStore for SqliteStatementStore {
    fn apply_reindex(&self, project: &str, batch: &IndexBatch) -> Result<ProjectSnapshot> {
        let indexed_at = now_rfc3339()?;
        let keep: HashSet<&str> = batch
            .nodes
            .iter()
            .map(|node| node.statement_id.as_str())
            .collect();

        let removed = self.with_immediate_tx(|tx| {
            let existing: Vec<String> = {
                let mut stmt =
                    tx.prepare("SELECT statement_id FROM statements WHERE project_id = ?1")?;
                let rows = stmt.query_map(params![project], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            let mut removed = 0usize;
            for stale in existing.iter().filter(|id| !keep.contains(id.as_str())) {
                removed += tx.execute(
                    "DELETE FROM statements WHERE project_id = ?1 AND statement_id = ?2",
                    params![project, stale],
                )?;
            }

            tx.execute(
                "DELETE FROM statement_dependencies WHERE project_id = ?1",
                params![project],
            )?;
            for node in &batch.nodes {
                tx.execute(
                    "INSERT INTO statements(project_id, statement_id, title, kind, \
                     parent_statement_id, is_resolved, proven_by, source_path, companion_path) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(project_id, statement_id) DO UPDATE SET \
                     title = excluded.title, kind = excluded.kind, \
                     parent_statement_id = excluded.parent_statement_id, \
                     is_resolved = excluded.is_resolved, proven_by = excluded.proven_by, \
                     source_path = excluded.source_path, companion_path = excluded.companion_path",
                    params![
                        project,
                        node.statement_id.as_str(),
                        node.title,
                        node.kind.as_str(),
                        node.parent_statement_id.as_ref().map(StatementId::as_str),
                        node.is_resolved,
                        node.proven_by.as_ref().map(StatementId::as_str),
                        node.source_path,
                        node.companion_path,
                    ],
                )?;
            }
            for node in &batch.nodes {
                for (position, dependency) in node.dependencies.iter().enumerate() {
                    if !keep.contains(dependency.as_str()) {
                        debug!(
                            statement = %node.statement_id,
                            dependency = %dependency,
                            "skipping edge to unindexed statement"
                        );
                        continue;
                    }
                    tx.execute(
                        "INSERT OR IGNORE INTO statement_dependencies(project_id, statement_id, \
                         dependency_id, position) VALUES (?1, ?2, ?3, ?4)",
                        params![
                            project,
                            node.statement_id.as_str(),
                            dependency.as_str(),
                            i64::try_from(position).unwrap_or(i64::MAX),
                        ],
                    )?;
                }
            }

            tx.execute(
                "INSERT INTO project_snapshots(project_id, commit_sha, indexed_at, node_count) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(project_id) DO UPDATE SET commit_sha = excluded.commit_sha, \
                 indexed_at = excluded.indexed_at, node_count = excluded.node_count",
                params![
                    project,
                    batch.commit,
                    indexed_at,
                    i64::try_from(batch.nodes.len()).unwrap_or(i64::MAX),
                ],
            )?;
            Ok(removed)
        })?;

        info!(
            project,
            nodes = batch.nodes.len(),
            removed,
            commit = batch.commit.as_deref().unwrap_or("-"),
            "statement index replaced"
        );
        Ok(ProjectSnapshot {
            project: project.to_string(),
            commit: batch.commit.clone(),
            indexed_at,
            node_count: batch.nodes.len(),
        })
    }

    fn load_project(&self, project: &str) -> Result<Vec<StatementNode>> {
        self.query_nodes(project, "", None)
    }

    fn get(&self, project: &str, id: &StatementId) -> Result<Option<StatementNode>> {
        let nodes = self.query_nodes(project, "AND statement_id = ?2", Some(id.as_str()))?;
        Ok(nodes.into_iter().next())
    }

    fn children(&self, project: &str, id: &StatementId) -> Result<Vec<StatementNode>> {
        self.query_nodes(project, "AND parent_statement_id = ?2", Some(id.as_str()))
    }

    fn dependents(&self, project: &str, id: &StatementId) -> Result<Vec<StatementId>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT statement_id FROM statement_dependencies \
             WHERE project_id = ?1 AND dependency_id = ?2 ORDER BY statement_id",
        )?;
        let rows = stmt.query_map(params![project, id.as_str()], |row| row.get::<_, String>(0))?;
        rows.map(|row| stored_id(&row?)).collect()
    }

    fn snapshot(&self, project: &str) -> Result<Option<ProjectSnapshot>> {
        let conn = self.connection()?;
        Ok(conn
            .query_row(
                "SELECT project_id, commit_sha, indexed_at, node_count FROM project_snapshots \
                 WHERE project_id = ?1",
                params![project],
                snapshot_from_row,
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn node(id: &StatementId, parent: Option<&StatementId>, deps: &[&StatementId]) -> StatementNode {
        StatementNode {
            statement_id: id.clone(),
            title: format!("t_{}", &id.as_str()[..8]),
            kind: StatementKind::Lemma,
            parent_statement_id: parent.cloned(),
            dependencies: deps.iter().map(|dep| (*dep).clone()).collect(),
            is_resolved: false,
            proven_by: None,
            source_path: format!("statements/S_{}.lean", id.as_str().replace('-', "_")),
            companion_path: format!("statements/S_{}.tex", id.as_str().replace('-', "_")),
        }
    }

    #[test]
    fn reindex_replaces_previous_snapshot() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStatementStore::open(dir.path().join("idx/index.sqlite")).expect("open");
        let root = StatementId::generate();
        let child = StatementId::generate();
        let dep = StatementId::generate();

        let batch = IndexBatch {
            nodes: vec![
                node(&root, None, &[]),
                node(&dep, Some(&root), &[]),
                node(&child, Some(&root), &[&dep]),
            ],
            commit: Some("abc".into()),
        };
        let snapshot = store.apply_reindex("p", &batch).expect("reindex");
        assert_eq!(snapshot.node_count, 3);
        assert_eq!(store.load_project("p").expect("load").len(), 3);
        assert_eq!(
            store.get("p", &child).expect("get").expect("present").dependencies,
            vec![dep.clone()]
        );
        assert_eq!(store.children("p", &root).expect("children").len(), 2);
        assert_eq!(store.dependents("p", &dep).expect("dependents"), vec![child.clone()]);

        let second = IndexBatch {
            nodes: vec![node(&root, None, &[]), node(&child, Some(&root), &[])],
            commit: Some("def".into()),
        };
        store.apply_reindex("p", &second).expect("reindex");
        assert!(store.get("p", &dep).expect("get").is_none());
        assert!(store.dependents("p", &dep).expect("dependents").is_empty());
        let snapshot = store.snapshot("p").expect("snapshot").expect("present");
        assert_eq!(snapshot.commit.as_deref(), Some("def"));
        assert_eq!(snapshot.node_count, 2);
        assert!(snapshot.indexed_at.contains('T'));
    }

    #[test]
    fn projects_are_isolated() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStatementStore::open(dir.path().join("index.sqlite")).expect("open");
        let shared = StatementId::generate();
        for project in ["a", "b"] {
            store
                .apply_reindex(
                    project,
                    &IndexBatch {
                        nodes: vec![node(&shared, None, &[])],
                        commit: None,
                    },
                )
                .expect("reindex");
        }
        store
            .apply_reindex("a", &IndexBatch::default())
            .expect("empty reindex");
        assert!(store.load_project("a").expect("load").is_empty());
        assert_eq!(store.load_project("b").expect("load").len(), 1);
        assert!(store.snapshot("missing").expect("snapshot").is_none());
    }

    #[test]
    fn corrupt_rows_are_reported() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.sqlite");
        let store = SqliteStatementStore::open(&path).expect("open");
        let conn = Connection::open(&path).expect("conn");
        conn.execute(
            "INSERT INTO statements VALUES ('p', 'not-a-uuid', 't', 'lemma', NULL, 0, NULL, 'x', 'y')",
            [],
        )
        .expect("insert");
        let err = store.load_project("p").expect_err("corrupt");
        assert!(matches!(err, EngineError::StoreCorrupt(_)));
    }
}
