//! Isolated git worktree transactions against a project mirror.
//!
//! Every write runs in a fresh worktree: check out the branch, let the caller
//! mutate files, commit and push if anything changed, then remove the
//! worktree whatever happened. Callers hold the branch lock for the duration
//! and hand in its guard as the [`Fence`] checked before each push.

mod merge;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Identity;
use crate::error::{EngineError, Result};
use crate::git::{identity_env, GitRunner};
use crate::lock::Fence;

pub use merge::MergeOutcome;

/// The shared project mirror as one transaction sees it.
#[derive(Clone, Copy)]
pub struct MirrorAccess<'a> {
    pub mirror: &'a Path,
    /// Fetches every branch from the remote. Must be serialized with all
    /// other fetches of the project (the project lock).
    pub refresh: &'a dyn Fn() -> Result<()>,
    pub fence: &'a dyn Fence,
}

impl std::fmt::Debug for MirrorAccess<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorAccess")
            .field("mirror", &self.mirror)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Start,
    CheckoutCreated,
    Mutated,
    Committed,
    Pushed,
    CleanedUp,
}

#[derive(Debug)]
pub struct WriteOutcome<T> {
    pub value: T,
    /// New commit on the branch; `None` when the body changed nothing.
    pub commit: Option<String>,
    pub state: TransactionState,
}

/// A temporary worktree attached to a project mirror. Removed on drop.
#[derive(Debug)]
pub struct Checkout {
    git: GitRunner,
    mirror: PathBuf,
    path: PathBuf,
    branch: Option<String>,
    cleaned: bool,
}

impl Checkout {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn git(&self) -> &GitRunner {
        &self.git
    }

    /// Writes `contents` at `relative`, creating parent directories.
    pub fn write_file(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let target = self.resolve(relative)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| EngineError::io(format!("failed to create {}", parent.display()), err))?;
        }
        fs::write(&target, contents)
            .map_err(|err| EngineError::io(format!("failed to write {}", target.display()), err))?;
        Ok(target)
    }

    pub fn read_file(&self, relative: &str) -> Result<Option<String>> {
        let target = self.resolve(relative)?;
        match fs::read_to_string(&target) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(EngineError::io(format!("failed to read {}", target.display()), err)),
        }
    }

    pub fn exists(&self, relative: &str) -> Result<bool> {
        Ok(self.resolve(relative)?.exists())
    }

    pub fn is_dirty(&self) -> Result<bool> {
        let status = self
            .git
            .run(&self.path, &["status", "--porcelain", "--untracked-files=all"])?;
        Ok(!status.is_empty())
    }

    pub fn head(&self) -> Result<String> {
        self.git.run(&self.path, &["rev-parse", "HEAD"])
    }

    /// Merges `reference` into the checkout. A conflict aborts the merge and
    /// reports the conflicting paths.
    pub fn merge_ref(&self, reference: &str, identity: &Identity) -> Result<()> {
        let env = identity_env(identity, identity);
        let output = self.git.output(
            &self.path,
            &["merge", "--no-ff", "--no-edit", "--no-gpg-sign", reference],
            &env,
        )?;
        if output.code == 0 {
            return Ok(());
        }
        let files = conflicting_files(&self.git, &self.path)?;
        if files.is_empty() {
            return Err(EngineError::Git {
                operation: "merge".to_string(),
                code: output.code,
                stderr: crate::git::redact_credentials(output.stderr.trim()),
            });
        }
        abort_merge(&self.git, &self.path);
        Err(EngineError::MergeConflict {
            source_branch: reference.to_string(),
            target_branch: self.branch.clone().unwrap_or_else(|| "HEAD".to_string()),
            files,
        })
    }

    /// Removes the worktree. Each step runs even if an earlier one failed.
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        let path = self.path.to_string_lossy().into_owned();
        if let Err(err) = self
            .git
            .run(&self.mirror, &["worktree", "remove", "--force", &path])
        {
            debug!(path, error = %err, "worktree remove failed");
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path, error = %err, "failed to delete worktree directory"),
        }
        if let Err(err) = self.git.run(&self.mirror, &["worktree", "prune"]) {
            warn!(error = %err, "worktree prune failed");
        }
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        let escapes = candidate.is_absolute()
            || candidate
                .components()
                .any(|part| matches!(part, std::path::Component::ParentDir));
        if escapes || relative.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "'{relative}' is not a path inside the checkout"
            )));
        }
        Ok(self.path.join(candidate))
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[derive(Clone, Debug)]
pub struct TransactionEngine {
    git: GitRunner,
    worktree_root: PathBuf,
    committer: Identity,
    default_branch: String,
}

impl TransactionEngine {
    pub fn new(
        git: GitRunner,
        worktree_root: impl Into<PathBuf>,
        committer: Identity,
        default_branch: impl Into<String>,
    ) -> Self {
        Self {
            git,
            worktree_root: worktree_root.into(),
            committer,
            default_branch: default_branch.into(),
        }
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    pub fn committer(&self) -> &Identity {
        &self.committer
    }

    /// Runs `body` in a worktree of `branch`, then commits and pushes any
    /// changes it made. A missing branch is created from `source_branch`
    /// (the default branch when `None`).
    pub fn write_transaction<T>(
        &self,
        access: MirrorAccess<'_>,
        author: &Identity,
        branch: &str,
        source_branch: Option<&str>,
        message: &str,
        body: impl FnOnce(&Checkout) -> Result<T>,
    ) -> Result<WriteOutcome<T>> {
        self.write_inner(access, author, branch, source_branch, message, body)
            .map_err(|err| err.in_transaction(branch))
    }

    fn write_inner<T>(
        &self,
        access: MirrorAccess<'_>,
        author: &Identity,
        branch: &str,
        source_branch: Option<&str>,
        message: &str,
        body: impl FnOnce(&Checkout) -> Result<T>,
    ) -> Result<WriteOutcome<T>> {
        let mirror = access.mirror;
        self.git.check_branch_name(mirror, branch)?;
        let mut state = TransactionState::Start;
        let mut checkout = self.checkout_branch(access, branch, source_branch)?;
        state = advance(branch, state, TransactionState::CheckoutCreated);

        let value = body(&checkout)?;
        let mut commit = None;
        if checkout.is_dirty()? {
            state = advance(branch, state, TransactionState::Mutated);
            let path = checkout.path().to_path_buf();
            self.git.run(&path, &["add", "-A"])?;
            self.git.run_with_env(
                &path,
                &["commit", "--quiet", "--no-gpg-sign", "-m", message],
                &identity_env(author, &self.committer),
            )?;
            state = advance(branch, state, TransactionState::Committed);
            let head = checkout.head()?;
            let refspec = format!("HEAD:refs/heads/{branch}");
            access.fence.check()?;
            self.git.run(&path, &["push", "--quiet", "origin", &refspec])?;
            let tracking = format!("refs/remotes/origin/{branch}");
            self.git.run(mirror, &["update-ref", &tracking, &head])?;
            state = advance(branch, state, TransactionState::Pushed);
            info!(branch, commit = %head, "transaction pushed");
            commit = Some(head);
        } else {
            debug!(branch, "transaction made no changes");
        }

        checkout.cleanup();
        state = advance(branch, state, TransactionState::CleanedUp);
        Ok(WriteOutcome {
            value,
            commit,
            state,
        })
    }

    /// Detached worktree at the tip of `branch`, preferring the remote
    /// tracking ref over a local branch.
    pub fn read_only_checkout(&self, mirror: &Path, branch: &str) -> Result<Checkout> {
        let remote = format!("refs/remotes/origin/{branch}");
        let local = format!("refs/heads/{branch}");
        let reference = if self.git.ref_exists(mirror, &remote)? {
            remote
        } else if self.git.ref_exists(mirror, &local)? {
            local
        } else {
            return Err(EngineError::BranchNotFound {
                branch: branch.to_string(),
            });
        };
        let mut checkout = self.new_checkout(mirror, "read", None)?;
        let path = checkout.path.to_string_lossy().into_owned();
        self.git
            .run(mirror, &["worktree", "add", "--quiet", "--detach", &path, &reference])
            .inspect_err(|_| checkout.cleanup())?;
        Ok(checkout)
    }

    fn checkout_branch(
        &self,
        access: MirrorAccess<'_>,
        branch: &str,
        source_branch: Option<&str>,
    ) -> Result<Checkout> {
        let mirror = access.mirror;
        let mut checkout = self.new_checkout(mirror, "wt", Some(branch))?;
        let path = checkout.path.to_string_lossy().into_owned();
        let local = format!("refs/heads/{branch}");
        let remote = format!("refs/remotes/origin/{branch}");

        let added = if self.git.ref_exists(mirror, &local)? {
            self.fast_forward_local(mirror, branch, &local, &remote)?;
            self.git
                .run(mirror, &["worktree", "add", "--quiet", "--force", &path, branch])
        } else if self.git.ref_exists(mirror, &remote)? {
            self.git.run(
                mirror,
                &["worktree", "add", "--quiet", "--no-track", "-b", branch, &path, &remote],
            )
        } else {
            let source = source_branch.unwrap_or(&self.default_branch);
            let start = format!("refs/remotes/origin/{source}");
            if !self.git.ref_exists(mirror, &start)? {
                debug!(branch, source, "source branch not in mirror; refreshing");
                if let Err(err) = (access.refresh)() {
                    checkout.cleanup();
                    return Err(err);
                }
                if !self.git.ref_exists(mirror, &start)? {
                    checkout.cleanup();
                    return Err(EngineError::BranchNotFound {
                        branch: source.to_string(),
                    });
                }
            }
            debug!(branch, source, "creating branch");
            self.git.run(
                mirror,
                &["worktree", "add", "--quiet", "--no-track", "-b", branch, &path, &start],
            )
        };
        if let Err(err) = added {
            checkout.cleanup();
            return Err(err);
        }
        Ok(checkout)
    }

    /// Moves a stale local branch up to its remote tip when that is a pure
    /// fast-forward. Diverged local branches are left alone.
    fn fast_forward_local(&self, mirror: &Path, branch: &str, local: &str, remote: &str) -> Result<()> {
        if !self.git.ref_exists(mirror, remote)? {
            return Ok(());
        }
        let local_tip = self.git.run(mirror, &["rev-parse", local])?;
        let remote_tip = self.git.run(mirror, &["rev-parse", remote])?;
        if local_tip == remote_tip {
            return Ok(());
        }
        if self
            .git
            .succeeds(mirror, &["merge-base", "--is-ancestor", &local_tip, &remote_tip])?
        {
            debug!(branch, from = %local_tip, to = %remote_tip, "fast-forwarding local branch");
            self.git.run(mirror, &["update-ref", local, &remote_tip, &local_tip])?;
        } else {
            warn!(branch, "local branch diverged from remote; keeping local tip");
        }
        Ok(())
    }

    fn new_checkout(&self, mirror: &Path, prefix: &str, branch: Option<&str>) -> Result<Checkout> {
        fs::create_dir_all(&self.worktree_root).map_err(|err| {
            EngineError::io(
                format!("failed to create {}", self.worktree_root.display()),
                err,
            )
        })?;
        if let Err(err) = self.git.run(mirror, &["worktree", "prune"]) {
            debug!(error = %err, "worktree prune failed");
        }
        let id: u128 = rand::random();
        Ok(Checkout {
            git: self.git.clone(),
            mirror: mirror.to_path_buf(),
            path: self.worktree_root.join(format!("{prefix}-{id:032x}")),
            branch: branch.map(str::to_string),
            cleaned: false,
        })
    }
}

fn advance(branch: &str, from: TransactionState, to: TransactionState) -> TransactionState {
    debug!(branch, ?from, ?to, "transaction state");
    to
}

fn conflicting_files(git: &GitRunner, dir: &Path) -> Result<Vec<String>> {
    let listed = git.run(dir, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(listed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn abort_merge(git: &GitRunner, dir: &Path) {
    if let Err(err) = git.run(dir, &["merge", "--abort"]) {
        warn!(error = %err, "merge --abort failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::{git, git_available, seeded_remote};
    use crate::lock::Unfenced;
    use crate::repo_cache::RepoCache;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        remote: PathBuf,
        url: String,
        cache: RepoCache,
        mirror: PathBuf,
        engine: TransactionEngine,
        worktrees: PathBuf,
    }

    impl Fixture {
        fn write<T>(
            &self,
            branch: &str,
            source_branch: Option<&str>,
            message: &str,
            body: impl FnOnce(&Checkout) -> Result<T>,
        ) -> Result<WriteOutcome<T>> {
            let refresh = || self.cache.fetch_all("p", &self.url, None).map(drop);
            let access = MirrorAccess {
                mirror: &self.mirror,
                refresh: &refresh,
                fence: &Unfenced,
            };
            let author = Identity::new("Ada", "ada@example.com");
            self.engine
                .write_transaction(access, &author, branch, source_branch, message, body)
        }
    }

    fn fixture() -> Option<Fixture> {
        if !git_available() {
            eprintln!("skipping transaction test (git unavailable)");
            return None;
        }
        let dir = tempdir().expect("tempdir");
        let (remote, url) = seeded_remote(dir.path(), &[]);
        let cache = RepoCache::new(dir.path().join("repos"), GitRunner::default(), 1);
        let mirror = cache.ensure_mirror("p", &url, None).expect("mirror");
        let worktrees = dir.path().join("worktrees");
        let engine = TransactionEngine::new(
            GitRunner::default(),
            &worktrees,
            Identity::new("Bot", "bot@example.com"),
            "main",
        );
        Some(Fixture {
            _dir: dir,
            remote,
            url,
            cache,
            mirror,
            engine,
            worktrees,
        })
    }

    fn worktree_dirs(root: &Path) -> usize {
        fs::read_dir(root).map_or(0, Iterator::count)
    }

    #[test]
    fn write_commits_pushes_and_cleans_up() {
        let Some(fx) = fixture() else { return };
        let outcome = fx
            .write("proposal/a", None, "add lemma", |checkout| {
                checkout.write_file("statements/S_a.lean", "theorem a : True := by\n  trivial\n")?;
                Ok(checkout.path().to_path_buf())
            })
            .expect("transaction");

        let commit = outcome.commit.expect("commit");
        assert_eq!(outcome.state, TransactionState::CleanedUp);
        assert!(!outcome.value.exists());
        assert_eq!(worktree_dirs(&fx.worktrees), 0);
        assert_eq!(git(&fx.remote, &["rev-parse", "refs/heads/proposal/a"]), commit);
        assert_eq!(
            git(&fx.remote, &["log", "-1", "--format=%an|%cn", "proposal/a"]),
            "Ada|Bot"
        );
        assert!(git(&fx.mirror, &["worktree", "list"]).lines().count() <= 1);
    }

    #[test]
    fn unchanged_tree_makes_no_commit() {
        let Some(fx) = fixture() else { return };
        let before = git(&fx.remote, &["rev-parse", "refs/heads/main"]);
        let outcome = fx
            .write("proposal/noop", None, "nothing", |_| Ok(()))
            .expect("transaction");
        assert!(outcome.commit.is_none());
        assert_eq!(git(&fx.remote, &["rev-parse", "refs/heads/main"]), before);
        assert!(!GitRunner::default()
            .ref_exists(&fx.remote, "refs/heads/proposal/noop")
            .expect("rev-parse"));
    }

    #[test]
    fn failing_body_is_wrapped_and_cleaned_up() {
        let Some(fx) = fixture() else { return };
        let err = fx
            .write("proposal/bad", None, "x", |checkout| {
                checkout.write_file("partial.txt", "half")?;
                Err::<(), _>(EngineError::InvalidInput("rejected".into()))
            })
            .expect_err("body fails");
        match &err {
            EngineError::Transaction { branch, source } => {
                assert_eq!(branch, "proposal/bad");
                assert!(matches!(**source, EngineError::InvalidInput(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(worktree_dirs(&fx.worktrees), 0);
    }

    #[test]
    fn second_write_builds_on_the_first() {
        let Some(fx) = fixture() else { return };
        for (file, message) in [("one.txt", "first"), ("two.txt", "second")] {
            fx.write("proposal/b", None, message, |checkout| {
                checkout.write_file(file, message).map(drop)
            })
            .expect("transaction");
        }
        let files = git(&fx.remote, &["ls-tree", "--name-only", "proposal/b"]);
        assert!(files.contains("one.txt"));
        assert!(files.contains("two.txt"));
    }

    #[test]
    fn missing_source_branch_is_reported() {
        let Some(fx) = fixture() else { return };
        let err = fx
            .write("proposal/c", Some("nope"), "x", |_| Ok(()))
            .expect_err("no source");
        assert!(matches!(err.root(), EngineError::BranchNotFound { branch } if branch == "nope"));
        assert_eq!(worktree_dirs(&fx.worktrees), 0);
    }

    #[test]
    fn source_branch_missing_from_mirror_is_fetched() {
        let Some(fx) = fixture() else { return };
        let seed = fx.remote.parent().expect("root").join("seed");
        git(&seed, &["checkout", "-q", "-b", "drafts"]);
        std::fs::write(seed.join("draft.txt"), "draft\n").expect("write");
        git(&seed, &["add", "-A"]);
        git(&seed, &["commit", "-q", "-m", "draft"]);
        git(&seed, &["push", "-q", &fx.url, "drafts:drafts"]);

        let outcome = fx
            .write("proposal/d", Some("drafts"), "from drafts", |checkout| {
                checkout.exists("draft.txt")
            })
            .expect("transaction");
        assert!(outcome.value);
        assert!(outcome.commit.is_none());
    }

    #[test]
    fn lost_lease_stops_the_push() {
        struct Lost;
        impl Fence for Lost {
            fn check(&self) -> Result<()> {
                Err(EngineError::LeaseLost {
                    key: "lock:branch:p:proposal/e".into(),
                })
            }
        }
        let Some(fx) = fixture() else { return };
        let refresh = || -> Result<()> { Ok(()) };
        let access = MirrorAccess {
            mirror: &fx.mirror,
            refresh: &refresh,
            fence: &Lost,
        };
        let err = fx
            .engine
            .write_transaction(
                access,
                &Identity::new("Ada", "ada@example.com"),
                "proposal/e",
                None,
                "late",
                |checkout| checkout.write_file("late.txt", "x").map(drop),
            )
            .expect_err("fenced");
        assert!(matches!(err.root(), EngineError::LeaseLost { .. }));
        assert!(!GitRunner::default()
            .ref_exists(&fx.remote, "refs/heads/proposal/e")
            .expect("rev-parse"));
        assert_eq!(worktree_dirs(&fx.worktrees), 0);
    }

    #[test]
    fn paths_outside_the_checkout_are_refused() {
        let Some(fx) = fixture() else { return };
        let checkout = fx.engine.read_only_checkout(&fx.mirror, "main").expect("checkout");
        assert!(checkout.write_file("../escape.txt", "x").is_err());
        assert!(checkout.exists("README.md").expect("exists"));
        assert_eq!(
            checkout.read_file("README.md").expect("read").as_deref(),
            Some("proofs\n")
        );
        let path = checkout.path().to_path_buf();
        drop(checkout);
        assert!(!path.exists());
    }
}
