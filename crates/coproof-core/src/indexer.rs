//! Rebuilds a project's statement index from the default branch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use coproof_domain::{
    find_cycle, resolve_proof_closure, AmbiguousClosure, EdgeRole, NamingConvention,
    ParsedStatement, StatementGraph, StatementId, StatementNode, StatementParser,
};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::git::GitRunner;
use crate::store::{IndexBatch, StatementStore};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

/// A tree of statement files at one commit.
pub trait StatementSource {
    fn snapshot_commit(&self) -> Option<String>;
    fn statement_files(&self, naming: &NamingConvention) -> Result<Vec<SourceFile>>;
}

/// Statement files on a branch of a project mirror, read straight from the
/// object database without a checkout.
#[derive(Clone, Debug)]
pub struct MirrorTree {
    git: GitRunner,
    mirror: PathBuf,
    commit: String,
}

impl MirrorTree {
    /// Resolves the tip of `branch`, preferring the fetched remote ref.
    pub fn at_branch(git: &GitRunner, mirror: &Path, branch: &str) -> Result<Self> {
        for reference in [
            format!("refs/remotes/origin/{branch}"),
            format!("refs/heads/{branch}"),
        ] {
            if git.ref_exists(mirror, &reference)? {
                let commit = git.run(mirror, &["rev-parse", &reference])?;
                return Ok(Self {
                    git: git.clone(),
                    mirror: mirror.to_path_buf(),
                    commit,
                });
            }
        }
        Err(EngineError::BranchNotFound {
            branch: branch.to_string(),
        })
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }
}

impl StatementSource for MirrorTree {
    fn snapshot_commit(&self) -> Option<String> {
        Some(self.commit.clone())
    }

    fn statement_files(&self, naming: &NamingConvention) -> Result<Vec<SourceFile>> {
        let dir = format!("{}/", naming.statements_dir);
        let listing = self
            .git
            .run_uncapped(&self.mirror, &["ls-tree", "-z", "--name-only", &self.commit, &dir])?;
        let paths: Vec<&str> = listing
            .split('\0')
            .filter(|path| naming.is_statement_path(path))
            .collect();
        let objects: Vec<String> = paths
            .iter()
            .map(|path| format!("{}:{path}", self.commit))
            .collect();
        let contents = self.git.read_objects(&self.mirror, &objects)?;

        let mut files = Vec::with_capacity(paths.len());
        for ((path, object), content) in paths.into_iter().zip(&objects).zip(contents) {
            let content = content.ok_or_else(|| EngineError::RevisionNotFound {
                revision: object.clone(),
            })?;
            files.push(SourceFile {
                path: path.to_string(),
                content: String::from_utf8_lossy(&content).into_owned(),
            });
        }
        Ok(files)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DuplicateStatement {
    pub statement_id: StatementId,
    pub kept: String,
    pub ignored: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DroppedEdge {
    pub statement_id: StatementId,
    pub target: StatementId,
    pub role: EdgeRole,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    pub project: String,
    pub commit: Option<String>,
    pub indexed: usize,
    pub skipped: Vec<SkippedFile>,
    pub duplicates: Vec<DuplicateStatement>,
    pub dropped_edges: Vec<DroppedEdge>,
    /// Dependency cycle present in the indexed tree, if any. Reindexing
    /// records it rather than refusing the snapshot.
    pub cycle: Option<Vec<StatementId>>,
    pub closed: Vec<(StatementId, StatementId)>,
    pub ambiguous: Vec<AmbiguousClosure>,
}

#[derive(Clone, Debug, Default)]
pub struct GraphIndexer {
    parser: StatementParser,
}

impl GraphIndexer {
    pub fn new(naming: NamingConvention) -> Self {
        Self {
            parser: StatementParser::new(naming),
        }
    }

    pub fn naming(&self) -> &NamingConvention {
        self.parser.naming()
    }

    pub fn parser(&self) -> &StatementParser {
        &self.parser
    }

    /// Parses every statement in `source` and replaces the project's index.
    ///
    /// Reindexing is tolerant: unparseable files are skipped, duplicate ids
    /// keep the first file by path, and references to unknown statements are
    /// dropped. All of it is logged and reported.
    pub fn reindex(
        &self,
        project: &str,
        source: &dyn StatementSource,
        store: &dyn StatementStore,
    ) -> Result<ReindexReport> {
        let files = source.statement_files(self.naming())?;
        let mut report = ReindexReport {
            project: project.to_string(),
            commit: source.snapshot_commit(),
            ..ReindexReport::default()
        };

        let parsed: Vec<std::result::Result<ParsedStatement, SkippedFile>> = files
            .par_iter()
            .map(|file| {
                self.parser
                    .parse(&file.path, &file.content)
                    .map_err(|issue| SkippedFile {
                        path: file.path.clone(),
                        reason: issue.to_string(),
                    })
            })
            .collect();

        let mut statements = Vec::with_capacity(parsed.len());
        for outcome in parsed {
            match outcome {
                Ok(statement) => statements.push(statement),
                Err(skipped) => {
                    warn!(project, path = %skipped.path, reason = %skipped.reason, "skipping statement file");
                    report.skipped.push(skipped);
                }
            }
        }
        statements.sort_by(|a, b| a.source_path.cmp(&b.source_path));

        let mut nodes = self.dedupe(project, statements, &mut report);
        self.drop_unknown_edges(project, &mut nodes, &mut report);

        let mut dependencies = StatementGraph::new();
        for node in &nodes {
            dependencies.add_node(&node.statement_id);
        }
        for node in &nodes {
            for dep in &node.dependencies {
                dependencies.link(dep, &node.statement_id, EdgeRole::Dependency);
            }
        }
        if let Some(cycle) = find_cycle(&dependencies) {
            warn!(project, cycle = %coproof_domain::format_cycle(&cycle), "dependency cycle in indexed tree");
            report.cycle = Some(cycle);
        }

        let closure = resolve_proof_closure(&mut nodes);
        report.closed = closure.closed;
        report.ambiguous = closure.ambiguous;
        report.indexed = nodes.len();

        store.apply_reindex(
            project,
            &IndexBatch {
                nodes,
                commit: report.commit.clone(),
            },
        )?;
        info!(
            project,
            indexed = report.indexed,
            skipped = report.skipped.len(),
            closed = report.closed.len(),
            "reindex complete"
        );
        Ok(report)
    }

    fn dedupe(
        &self,
        project: &str,
        statements: Vec<ParsedStatement>,
        report: &mut ReindexReport,
    ) -> Vec<StatementNode> {
        let mut seen: Vec<StatementNode> = Vec::with_capacity(statements.len());
        let mut ids: HashSet<StatementId> = HashSet::with_capacity(statements.len());
        for statement in statements {
            if !ids.insert(statement.statement_id.clone()) {
                let kept = seen
                    .iter()
                    .find(|node| node.statement_id == statement.statement_id)
                    .map(|node| node.source_path.clone())
                    .unwrap_or_default();
                warn!(
                    project,
                    statement = %statement.statement_id,
                    kept = %kept,
                    ignored = %statement.source_path,
                    "duplicate statement id"
                );
                report.duplicates.push(DuplicateStatement {
                    statement_id: statement.statement_id,
                    kept,
                    ignored: statement.source_path,
                });
                continue;
            }
            seen.push(self.to_node(statement));
        }
        seen
    }

    fn to_node(&self, statement: ParsedStatement) -> StatementNode {
        let companion_path = companion_path(&statement.source_path, self.naming());
        StatementNode {
            is_resolved: !statement.has_open_marker,
            statement_id: statement.statement_id,
            title: statement.title,
            kind: statement.kind,
            parent_statement_id: statement.parent_statement_id,
            dependencies: statement.dependencies,
            proven_by: None,
            source_path: statement.source_path,
            companion_path,
        }
    }

    fn drop_unknown_edges(&self, project: &str, nodes: &mut [StatementNode], report: &mut ReindexReport) {
        let known: HashSet<StatementId> = nodes.iter().map(|node| node.statement_id.clone()).collect();
        for node in nodes.iter_mut() {
            if let Some(parent) = node.parent_statement_id.take() {
                if known.contains(&parent) {
                    node.parent_statement_id = Some(parent);
                } else {
                    warn!(project, statement = %node.statement_id, parent = %parent, "unknown parent; attaching to root");
                    report.dropped_edges.push(DroppedEdge {
                        statement_id: node.statement_id.clone(),
                        target: parent,
                        role: EdgeRole::Parent,
                    });
                }
            }
            let (kept, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut node.dependencies)
                .into_iter()
                .partition(|dep| known.contains(dep));
            for dep in dropped {
                debug!(project, statement = %node.statement_id, dependency = %dep, "dropping unknown dependency");
                report.dropped_edges.push(DroppedEdge {
                    statement_id: node.statement_id.clone(),
                    target: dep,
                    role: EdgeRole::Dependency,
                });
            }
            node.dependencies = kept;
        }
    }
}

fn companion_path(source_path: &str, naming: &NamingConvention) -> String {
    let suffix = format!(".{}", naming.source_extension);
    match source_path.strip_suffix(&suffix) {
        Some(stem) => format!("{stem}.{}", naming.companion_extension),
        None => format!("{source_path}.{}", naming.companion_extension),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStatementStore;
    use tempfile::tempdir;

    struct Fixed(Vec<SourceFile>);

    impl StatementSource for Fixed {
        fn snapshot_commit(&self) -> Option<String> {
            Some("c0ffee".into())
        }

        fn statement_files(&self, _: &NamingConvention) -> Result<Vec<SourceFile>> {
            Ok(self.0.clone())
        }
    }

    fn file(naming: &NamingConvention, id: &StatementId, body: &str) -> SourceFile {
        SourceFile {
            path: naming.source_path(id),
            content: format!("-- statement_id: {id}\n{body}"),
        }
    }

    #[test]
    fn reindex_tolerates_bad_input_and_closes_parents() {
        let naming = NamingConvention::default();
        let root = StatementId::generate();
        let child = StatementId::generate();
        let ghost = StatementId::generate();

        let files = vec![
            file(
                &naming,
                &root,
                "-- parent_statement_id: root\ntheorem main_goal : True := by\n  sorry\n",
            ),
            file(
                &naming,
                &child,
                &format!(
                    "-- parent_statement_id: {root}\nimport {}\nimport {}\nlemma step : True := by\n  trivial\n",
                    naming.import_path(&root),
                    naming.import_path(&ghost)
                ),
            ),
            SourceFile {
                path: format!("{}/notes.lean", naming.statements_dir),
                content: "theorem orphan : True := trivial\n".into(),
            },
        ];

        let dir = tempdir().expect("tempdir");
        let store = SqliteStatementStore::open(dir.path().join("index.sqlite")).expect("store");
        let indexer = GraphIndexer::new(naming.clone());
        let report = indexer.reindex("p", &Fixed(files), &store).expect("reindex");

        assert_eq!(report.indexed, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.commit.as_deref(), Some("c0ffee"));
        assert!(report
            .dropped_edges
            .iter()
            .any(|edge| edge.target == ghost && edge.role == EdgeRole::Dependency));
        assert_eq!(report.closed, vec![(root.clone(), child.clone())]);

        let stored_root = store.get("p", &root).expect("get").expect("root");
        assert!(stored_root.is_resolved);
        assert_eq!(stored_root.proven_by, Some(child.clone()));
        let stored_child = store.get("p", &child).expect("get").expect("child");
        assert_eq!(stored_child.dependencies, vec![root.clone()]);
        assert!(stored_child.companion_path.ends_with(".tex"));
    }

    #[test]
    fn duplicate_ids_keep_the_first_path() {
        let naming = NamingConvention::default();
        let id = StatementId::generate();
        let first = file(&naming, &id, "lemma a : True := trivial\n");
        let second = SourceFile {
            path: format!("{}/S_zz_copy.lean", naming.statements_dir),
            content: first.content.clone(),
        };
        let dir = tempdir().expect("tempdir");
        let store = SqliteStatementStore::open(dir.path().join("index.sqlite")).expect("store");
        let report = GraphIndexer::new(naming)
            .reindex("p", &Fixed(vec![second, first.clone()]), &store)
            .expect("reindex");
        assert_eq!(report.indexed, 1);
        assert_eq!(report.duplicates.len(), 1);
        assert_eq!(report.duplicates[0].kept, first.path);
    }

    #[test]
    fn large_statements_are_read_in_full_from_the_mirror() {
        if !crate::git::testing::git_available() {
            return;
        }
        let naming = NamingConvention::default();
        let small = StatementId::generate();
        let large = StatementId::generate();
        let small_path = naming.source_path(&small);
        let large_path = naming.source_path(&large);
        let small_body = format!("-- statement_id: {small}\nlemma tiny : True := trivial\n");
        let large_body = format!(
            "-- statement_id: {large}\ntheorem huge : True := by\n{}  sorry\n",
            "-- padding line\n".repeat(80_000)
        );
        assert!(large_body.len() > 1024 * 1024);

        let dir = tempdir().expect("tempdir");
        let (_, url) = crate::git::testing::seeded_remote(
            dir.path(),
            &[(small_path.as_str(), small_body.as_str()), (large_path.as_str(), large_body.as_str())],
        );
        let git = GitRunner::default();
        let cache = crate::repo_cache::RepoCache::new(dir.path().join("repos"), git.clone(), 1);
        let mirror = cache.ensure_mirror("p", &url, None).expect("mirror");
        let tree = MirrorTree::at_branch(&git, &mirror, "main").expect("tree");

        let files = tree.statement_files(&naming).expect("files");
        let read = files
            .iter()
            .find(|file| file.path == large_path)
            .expect("large file listed");
        assert_eq!(read.content, large_body);

        let store = SqliteStatementStore::open(dir.path().join("index.sqlite")).expect("store");
        let report = GraphIndexer::new(naming)
            .reindex("p", &tree, &store)
            .expect("reindex");
        assert_eq!(report.indexed, 2);
        let stored = store.get("p", &large).expect("get").expect("large");
        assert!(!stored.is_resolved);
        assert!(store.get("p", &small).expect("get").expect("small").is_resolved);
    }

    #[test]
    fn reindexing_unchanged_tree_is_idempotent() {
        let naming = NamingConvention::default();
        let root = StatementId::generate();
        let proof = StatementId::generate();
        let files = Fixed(vec![
            file(&naming, &root, "theorem goal : True := by\n  sorry\n"),
            file(
                &naming,
                &proof,
                &format!("-- parent_statement_id: {root}\nlemma done : True := trivial\n"),
            ),
        ]);
        let dir = tempdir().expect("tempdir");
        let store = SqliteStatementStore::open(dir.path().join("index.sqlite")).expect("store");
        let indexer = GraphIndexer::new(naming);

        indexer.reindex("p", &files, &store).expect("first");
        let first = store.load_project("p").expect("load");
        indexer.reindex("p", &files, &store).expect("second");
        assert_eq!(store.load_project("p").expect("load"), first);
        assert!(first.iter().all(|node| node.is_resolved));
    }
}
