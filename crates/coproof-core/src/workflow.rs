//! Proposal workflows: submit, verify and merge statements.
//!
//! Mirror maintenance and verification run under the project lock, writes to
//! a proposal branch under that branch's lock, and merges under the default
//! branch's lock. A branch-lock holder that needs to fetch takes the project
//! lock only for the fetch itself; project-lock holders never take a branch
//! lock, so the order is always branch then project.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use coproof_domain::{
    render_statement, validate_candidate, write_entry_point, BuildPlan, Candidate,
    ScaffoldRequest, StatementId,
};
use serde::Serialize;
use tracing::{info, info_span, warn};

use crate::collab::{
    CheckReport, CheckRequest, EnvTokenProvider, HttpProofChecker, ProofChecker, PullRequest,
    PullRequestHost, TokenProvider,
};
use crate::config::{EngineConfig, Identity};
use crate::error::{EngineError, Result};
use crate::git::GitRunner;
use crate::indexer::{GraphIndexer, MirrorTree, ReindexReport};
use crate::lock::{FileLeaseBackend, LockGuard, LockManager};
use crate::reader::{read_statement, StatementFiles};
use crate::repo_cache::RepoCache;
use crate::store::{SqliteStatementStore, StatementStore};
use crate::transaction::{MergeOutcome, MirrorAccess, TransactionEngine};

/// A project and the remote its mirror tracks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProjectRemote {
    pub project: String,
    pub url: String,
}

impl ProjectRemote {
    pub fn new(project: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            url: url.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SubmitOutcome {
    pub statement_id: StatementId,
    pub branch: String,
    /// `None` when the branch already held identical content.
    pub commit: Option<String>,
    pub plan: BuildPlan,
    pub pull_request: Option<PullRequest>,
}

#[derive(Clone, Debug, Serialize)]
pub struct VerifyOutcome {
    pub statement_id: StatementId,
    pub branch: String,
    pub proposal_commit: String,
    pub plan: BuildPlan,
    pub report: CheckReport,
}

#[derive(Clone, Debug, Serialize)]
pub struct MergeReport {
    pub verification: VerifyOutcome,
    /// Absent when the checker rejected the proposal.
    pub merge: Option<MergeOutcome>,
    pub reindex: Option<ReindexReport>,
}

pub struct Engine {
    config: EngineConfig,
    git: GitRunner,
    cache: RepoCache,
    locks: LockManager,
    transactions: TransactionEngine,
    store: Arc<dyn StatementStore>,
    indexer: GraphIndexer,
    tokens: Arc<dyn TokenProvider>,
    checker: Option<Arc<dyn ProofChecker>>,
    host: Option<Arc<dyn PullRequestHost>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("storage_root", &self.config.storage_root)
            .field("default_branch", &self.config.default_branch)
            .field("checker", &self.checker.is_some())
            .field("host", &self.host.is_some())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StatementStore>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let git = GitRunner::new(config.git_timeout);
        let cache = RepoCache::new(config.repos_dir(), git.clone(), config.fetch_attempts);
        let locks = LockManager::new(
            Arc::new(FileLeaseBackend::new(config.locks_dir())),
            config.lock.clone(),
        );
        let transactions = TransactionEngine::new(
            git.clone(),
            config.worktrees_dir(),
            config.committer.clone(),
            config.default_branch.clone(),
        );
        let indexer = GraphIndexer::new(config.naming.clone());
        Self {
            config,
            git,
            cache,
            locks,
            transactions,
            store,
            indexer,
            tokens,
            checker: None,
            host: None,
        }
    }

    /// Engine with the SQLite index, environment token provider and, when
    /// configured, the HTTP proof checker.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(SqliteStatementStore::open(&config.index_path)?);
        let checker = match &config.checker {
            Some(settings) => Some(Arc::new(HttpProofChecker::from_settings(settings)?)),
            None => None,
        };
        let mut engine = Self::new(config, store, Arc::new(EnvTokenProvider::default()));
        if let Some(checker) = checker {
            engine = engine.with_checker(checker);
        }
        Ok(engine)
    }

    #[must_use]
    pub fn with_checker(mut self, checker: Arc<dyn ProofChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: Arc<dyn PullRequestHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn StatementStore {
        self.store.as_ref()
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn cache(&self) -> &RepoCache {
        &self.cache
    }

    pub fn ensure_mirror(&self, remote: &ProjectRemote) -> Result<PathBuf> {
        self.locks
            .with_project_lock(&remote.project, |_| self.refresh_mirror(remote))
    }

    /// Fetches an existing mirror; fails with `MirrorMissing` otherwise.
    pub fn fetch_mirror(&self, remote: &ProjectRemote) -> Result<PathBuf> {
        self.locks.with_project_lock(&remote.project, |_| {
            self.cache.existing_mirror(&remote.project)?;
            self.fetch_locked(remote)
        })
    }

    pub fn evict_mirror(&self, project: &str) -> Result<bool> {
        self.locks
            .with_project_lock(project, |_| self.cache.evict(project))
    }

    /// Fetches the remote and rebuilds the index from the default branch.
    pub fn sync_project(&self, remote: &ProjectRemote) -> Result<ReindexReport> {
        let _span = info_span!("sync", project = %remote.project).entered();
        self.locks.with_project_lock(&remote.project, |_| {
            self.refresh_mirror(remote)?;
            self.reindex_locked(&remote.project)
        })
    }

    /// Reindexes from the mirror as it is, without fetching.
    pub fn reindex(&self, project: &str) -> Result<ReindexReport> {
        self.locks
            .with_project_lock(project, |_| self.reindex_locked(project))
    }

    pub fn read_statement(
        &self,
        remote: &ProjectRemote,
        id: &StatementId,
        revision: Option<&str>,
    ) -> Result<StatementFiles> {
        self.locks.with_project_lock(&remote.project, |_| {
            let mirror = self.cache.existing_mirror(&remote.project)?;
            read_statement(
                &self.git,
                &mirror,
                &self.config.naming,
                &self.config.default_branch,
                id,
                revision,
                || self.fetch_locked(remote).map(drop),
            )
        })
    }

    /// Renders a new statement, checks it against the indexed graph and
    /// pushes it to its proposal branch (`proposal/<id>` by default).
    pub fn submit_statement(
        &self,
        remote: &ProjectRemote,
        author: &Identity,
        request: &ScaffoldRequest,
        branch: Option<&str>,
    ) -> Result<SubmitOutcome> {
        let naming = &self.config.naming;
        let rendered = render_statement(request, naming)?;
        let candidate = Candidate {
            statement_id: rendered.statement_id.clone(),
            parent_statement_id: rendered.parent_statement_id.clone(),
            dependencies: rendered.dependencies.clone(),
            source_path: rendered.paths.source.clone(),
        };
        let indexed = self.store.load_project(&remote.project)?;
        let plan = validate_candidate(&indexed, &candidate)?;

        let branch = branch.map_or_else(
            || format!("proposal/{}", rendered.statement_id),
            str::to_string,
        );
        let _span = info_span!("submit", project = %remote.project, branch = %branch).entered();
        let mirror = self.ensure_mirror(remote)?;

        let message = format!("Add statement {} ({})", request.name, rendered.statement_id);
        let refresh = || self.locked_fetch(remote);
        let outcome = self.locks.with_branch_lock(&remote.project, &branch, |guard| {
            self.transactions.write_transaction(
                MirrorAccess {
                    mirror: &mirror,
                    refresh: &refresh,
                    fence: guard,
                },
                author,
                &branch,
                Some(&self.config.default_branch),
                &message,
                |checkout| {
                    checkout.write_file(&rendered.paths.source, &rendered.source)?;
                    if let Some(companion) = &rendered.companion {
                        checkout.write_file(&rendered.paths.companion, companion)?;
                    }
                    Ok(())
                },
            )
        })?;

        let pull_request = match (&self.host, &outcome.commit) {
            (Some(host), Some(_)) => Some(host.open(
                &remote.project,
                &branch,
                &self.config.default_branch,
                &message,
            )?),
            _ => None,
        };
        info!(statement_id = %rendered.statement_id, commit = ?outcome.commit, "statement submitted");
        Ok(SubmitOutcome {
            statement_id: rendered.statement_id,
            branch,
            commit: outcome.commit,
            plan,
            pull_request,
        })
    }

    /// Compiles the proposal as it would look after merging: the default
    /// branch is merged into a throwaway checkout of the proposal (never
    /// pushed), the entry file is written in plan order and the plan's files
    /// go to the proof checker.
    pub fn verify_proposal(
        &self,
        remote: &ProjectRemote,
        branch: &str,
        id: &StatementId,
    ) -> Result<VerifyOutcome> {
        let _span = info_span!("verify", project = %remote.project, branch).entered();
        self.locks.with_project_lock(&remote.project, |guard| {
            self.verify_locked(remote, branch, id, guard)
        })
    }

    /// Verifies, merges into the default branch and reindexes.
    pub fn merge_proposal(
        &self,
        remote: &ProjectRemote,
        branch: &str,
        id: &StatementId,
    ) -> Result<MergeReport> {
        let verification = self.verify_proposal(remote, branch, id)?;
        if !verification.report.valid {
            warn!(project = %remote.project, branch, "checker rejected proposal; not merging");
            return Ok(MergeReport {
                verification,
                merge: None,
                reindex: None,
            });
        }

        let default_branch = &self.config.default_branch;
        let mirror = self.cache.existing_mirror(&remote.project)?;
        let refresh = || self.locked_fetch(remote);
        let merge = self
            .locks
            .with_branch_lock(&remote.project, default_branch, |guard| {
                self.transactions.merge_to_default(
                    MirrorAccess {
                        mirror: &mirror,
                        refresh: &refresh,
                        fence: guard,
                    },
                    branch,
                )
            })?;
        let reindex = self.reindex(&remote.project)?;
        Ok(MergeReport {
            verification,
            merge: Some(merge),
            reindex: Some(reindex),
        })
    }

    fn verify_locked(
        &self,
        remote: &ProjectRemote,
        branch: &str,
        id: &StatementId,
        guard: &LockGuard,
    ) -> Result<VerifyOutcome> {
        let naming = &self.config.naming;
        let default_branch = &self.config.default_branch;
        let mirror = self.refresh_mirror(remote)?;

        let tree = MirrorTree::at_branch(&self.git, &mirror, branch)?;
        let files = read_statement(
            &self.git,
            &mirror,
            naming,
            default_branch,
            id,
            Some(tree.commit()),
            || Ok(()),
        )?;
        let Some(source) = files.source else {
            return Err(EngineError::InvalidInput(format!(
                "branch '{branch}' has no {}",
                files.source_path
            )));
        };
        let parsed = self.indexer.parser().parse(&files.source_path, &source)?;
        if &parsed.statement_id != id {
            return Err(EngineError::InvalidInput(format!(
                "{} declares statement {} instead of {id}",
                files.source_path, parsed.statement_id
            )));
        }

        let indexed = self.store.load_project(&remote.project)?;
        let plan = validate_candidate(
            &indexed,
            &Candidate {
                statement_id: parsed.statement_id,
                parent_statement_id: parsed.parent_statement_id,
                dependencies: parsed.dependencies,
                source_path: parsed.source_path,
            },
        )?;
        guard.ensure_held()?;

        let checkout = self.transactions.read_only_checkout(&mirror, branch)?;
        let base = format!("refs/remotes/origin/{default_branch}");
        checkout
            .merge_ref(&base, &self.config.committer)
            .map_err(|err| match err {
                EngineError::MergeConflict { files, .. } => EngineError::MergeConflict {
                    source_branch: branch.to_string(),
                    target_branch: default_branch.clone(),
                    files,
                },
                other => other,
            })?;
        let ordered = plan.ids();
        write_entry_point(checkout.path(), &ordered, naming)?;

        let mut sources = BTreeMap::new();
        for path in plan
            .paths()
            .map(str::to_string)
            .chain(std::iter::once(naming.entry_file.clone()))
        {
            let contents = checkout.read_file(&path)?.ok_or_else(|| {
                EngineError::InvalidInput(format!("{path} vanished from the verification checkout"))
            })?;
            sources.insert(path, contents);
        }
        drop(checkout);
        guard.ensure_held()?;

        let checker = self.checker.as_ref().ok_or_else(|| EngineError::CheckerUnavailable {
            reason: "no proof checker is configured".to_string(),
            timed_out: false,
        })?;
        let report = checker.check(&CheckRequest::Project {
            files: sources,
            entry: naming.entry_file.clone(),
        })?;
        info!(
            statement_id = %id,
            valid = report.valid,
            open = report.contains_open_marker,
            plan = plan.entries.len(),
            "proposal verified"
        );
        Ok(VerifyOutcome {
            statement_id: id.clone(),
            branch: branch.to_string(),
            proposal_commit: tree.commit().to_string(),
            plan,
            report,
        })
    }

    fn refresh_mirror(&self, remote: &ProjectRemote) -> Result<PathBuf> {
        let token = self.tokens.token(&remote.project)?;
        let fresh = !self.cache.has_mirror(&remote.project)?;
        let mirror = self
            .cache
            .ensure_mirror(&remote.project, &remote.url, token.as_deref())?;
        if !fresh {
            self.cache
                .fetch_all(&remote.project, &remote.url, token.as_deref())?;
        }
        Ok(mirror)
    }

    fn fetch_locked(&self, remote: &ProjectRemote) -> Result<PathBuf> {
        let token = self.tokens.token(&remote.project)?;
        self.cache
            .fetch_all(&remote.project, &remote.url, token.as_deref())
    }

    /// Fetches under a short-lived project lock, for callers holding a
    /// branch lock.
    fn locked_fetch(&self, remote: &ProjectRemote) -> Result<()> {
        self.locks
            .with_project_lock(&remote.project, |_| self.fetch_locked(remote).map(drop))
    }

    fn reindex_locked(&self, project: &str) -> Result<ReindexReport> {
        let mirror = self.cache.existing_mirror(project)?;
        let tree = MirrorTree::at_branch(&self.git, &mirror, &self.config.default_branch)?;
        self.indexer.reindex(project, &tree, self.store.as_ref())
    }
}
