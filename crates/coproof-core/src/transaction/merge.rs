use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use super::{abort_merge, conflicting_files, MirrorAccess, TransactionEngine};
use crate::error::{EngineError, Result};
use crate::git::{identity_env, redact_credentials};

const PUSH_ATTEMPTS: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub commit: String,
    pub source_branch: String,
    pub target_branch: String,
    pub attempts: u32,
}

impl TransactionEngine {
    /// Merges `source` into the default branch with a merge commit and pushes
    /// it. A push rejected because the default branch moved is retried once
    /// against the refetched tip. The source branch is deleted afterwards.
    ///
    /// Callers hold the default-branch lock and pass its guard as the fence.
    pub fn merge_to_default(&self, access: MirrorAccess<'_>, source: &str) -> Result<MergeOutcome> {
        let target = self.default_branch.clone();
        self.merge_inner(access, source, &target)
            .map_err(|err| err.in_transaction(&target))
    }

    fn merge_inner(&self, access: MirrorAccess<'_>, source: &str, target: &str) -> Result<MergeOutcome> {
        let mirror = access.mirror;
        (access.refresh)()?;
        self.git.check_branch_name(mirror, source)?;
        let source_ref = format!("refs/remotes/origin/{source}");
        let target_ref = format!("refs/remotes/origin/{target}");
        for (branch, reference) in [(source, &source_ref), (target, &target_ref)] {
            if !self.git.ref_exists(mirror, reference)? {
                return Err(EngineError::BranchNotFound {
                    branch: branch.to_string(),
                });
            }
        }

        let mut checkout = self.new_checkout(mirror, "merge", Some(target))?;
        let path = checkout.path().to_string_lossy().into_owned();
        self.git
            .run(mirror, &["worktree", "add", "--quiet", "--detach", &path, &target_ref])
            .inspect_err(|_| checkout.cleanup())?;
        let dir = checkout.path().to_path_buf();
        let message = format!("Merge proposal {source}");
        let env = identity_env(&self.committer, &self.committer);

        let mut attempts = 0;
        let commit = loop {
            attempts += 1;
            self.git.run(&dir, &["reset", "--quiet", "--hard", &target_ref])?;
            self.git.run(&dir, &["clean", "-fdq"])?;

            let merged = self.git.output(
                &dir,
                &["merge", "--no-ff", "--no-gpg-sign", "-m", &message, &source_ref],
                &env,
            )?;
            if merged.code != 0 {
                let files = conflicting_files(&self.git, &dir)?;
                abort_merge(&self.git, &dir);
                if files.is_empty() {
                    return Err(EngineError::Git {
                        operation: "merge".to_string(),
                        code: merged.code,
                        stderr: redact_credentials(merged.stderr.trim()),
                    });
                }
                return Err(EngineError::MergeConflict {
                    source_branch: source.to_string(),
                    target_branch: target.to_string(),
                    files,
                });
            }

            let refspec = format!("HEAD:refs/heads/{target}");
            access.fence.check()?;
            match self.git.run(&dir, &["push", "--quiet", "origin", &refspec]) {
                Ok(_) => break self.git.run(&dir, &["rev-parse", "HEAD"])?,
                Err(err) if attempts < PUSH_ATTEMPTS && err.is_retryable() => {
                    warn!(target, error = %err, "push of merge rejected; refetching");
                    (access.refresh)()?;
                }
                Err(err) => return Err(err),
            }
        };
        self.git.run(mirror, &["update-ref", &target_ref, &commit])?;
        checkout.cleanup();
        info!(source, target, commit = %commit, attempts, "proposal merged");

        self.delete_merged_branch(access, source, &source_ref);
        Ok(MergeOutcome {
            commit,
            source_branch: source.to_string(),
            target_branch: target.to_string(),
            attempts,
        })
    }

    fn delete_merged_branch(&self, access: MirrorAccess<'_>, source: &str, source_ref: &str) {
        let mirror: &Path = access.mirror;
        if let Err(err) = access.fence.check() {
            warn!(branch = source, error = %err, "lock lost after merge; keeping source branch");
            return;
        }
        if let Err(err) = self.git.run(mirror, &["push", "--quiet", "origin", "--delete", source]) {
            warn!(branch = source, error = %err, "failed to delete merged branch on remote");
        }
        if let Err(err) = self.git.run(mirror, &["update-ref", "-d", source_ref]) {
            warn!(branch = source, error = %err, "failed to drop tracking ref");
        }
        let local = format!("refs/heads/{source}");
        if self.git.ref_exists(mirror, &local).unwrap_or(false) {
            if let Err(err) = self.git.run(mirror, &["branch", "-D", source]) {
                warn!(branch = source, error = %err, "failed to delete local branch");
            }
        }
    }
}
