//! One bare mirror per project, shared by every transaction on that project.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::git::{authenticated_url, redact_remote_url, GitRunner};

const TRACKING_REFSPEC: &str = "+refs/heads/*:refs/remotes/origin/*";
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct RepoCache {
    root: PathBuf,
    git: GitRunner,
    fetch_attempts: u32,
}

impl RepoCache {
    pub fn new(root: impl Into<PathBuf>, git: GitRunner, fetch_attempts: u32) -> Self {
        Self {
            root: root.into(),
            git,
            fetch_attempts: fetch_attempts.max(1),
        }
    }

    pub fn git(&self) -> &GitRunner {
        &self.git
    }

    pub fn mirror_path(&self, project: &str) -> Result<PathBuf> {
        validate_project_id(project)?;
        Ok(self.root.join(format!("{project}.git")))
    }

    pub fn has_mirror(&self, project: &str) -> Result<bool> {
        Ok(self.mirror_path(project)?.join("HEAD").is_file())
    }

    /// Existing mirror path, or [`EngineError::MirrorMissing`].
    pub fn existing_mirror(&self, project: &str) -> Result<PathBuf> {
        let path = self.mirror_path(project)?;
        if path.join("HEAD").is_file() {
            Ok(path)
        } else {
            Err(EngineError::MirrorMissing {
                project: project.to_string(),
            })
        }
    }

    /// Clones the mirror on first use; afterwards re-applies the remote URL
    /// (fresh credentials) and the all-branches tracking refspec.
    pub fn ensure_mirror(&self, project: &str, remote: &str, token: Option<&str>) -> Result<PathBuf> {
        let path = self.mirror_path(project)?;
        let url = authenticated_url(remote, token);
        if path.join("HEAD").is_file() {
            self.configure(&path, &url)?;
            debug!(project, remote = %redact_remote_url(remote), "mirror present");
            return Ok(path);
        }

        fs::create_dir_all(&self.root)
            .map_err(|err| EngineError::io(format!("failed to create {}", self.root.display()), err))?;
        if path.exists() {
            warn!(project, path = %path.display(), "removing partial mirror");
            fs::remove_dir_all(&path)
                .map_err(|err| EngineError::io(format!("failed to remove {}", path.display()), err))?;
        }

        info!(project, remote = %redact_remote_url(remote), "cloning mirror");
        let target = path.to_string_lossy();
        let cloned = self
            .retrying("clone", || {
                self.git
                    .run(&self.root, &["clone", "--bare", "--quiet", &url, &target])
                    .map(drop)
                    .inspect_err(|_| {
                        let _ = fs::remove_dir_all(&path);
                    })
            })
            .and_then(|()| self.configure(&path, &url))
            .and_then(|()| self.fetch_origin(&path));
        if let Err(err) = cloned {
            let _ = fs::remove_dir_all(&path);
            return Err(err);
        }
        Ok(path)
    }

    /// Fetches every remote branch into `refs/remotes/origin/*`, pruning
    /// deleted ones. Transport failures are retried a bounded number of times.
    pub fn fetch_all(&self, project: &str, remote: &str, token: Option<&str>) -> Result<PathBuf> {
        let path = self.existing_mirror(project)?;
        self.configure(&path, &authenticated_url(remote, token))?;
        self.fetch_origin(&path)?;
        Ok(path)
    }

    /// Fetches one branch of an existing mirror using the stored remote URL.
    pub fn fetch_branch(&self, mirror: &Path, branch: &str) -> Result<()> {
        let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
        self.retrying("fetch", || {
            self.git
                .run(mirror, &["fetch", "--quiet", "origin", &refspec])
                .map(drop)
        })
    }

    /// Removes a project's mirror. Returns whether anything was removed.
    pub fn evict(&self, project: &str) -> Result<bool> {
        let path = self.mirror_path(project)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&path)
            .map_err(|err| EngineError::io(format!("failed to remove {}", path.display()), err))?;
        info!(project, "mirror evicted");
        Ok(true)
    }

    fn fetch_origin(&self, mirror: &Path) -> Result<()> {
        self.retrying("fetch", || {
            self.git
                .run(mirror, &["fetch", "--prune", "--quiet", "origin"])
                .map(drop)
        })
    }

    fn configure(&self, mirror: &Path, url: &str) -> Result<()> {
        self.git
            .run(mirror, &["config", "remote.origin.url", url])?;
        self.git.run(
            mirror,
            &["config", "--replace-all", "remote.origin.fetch", TRACKING_REFSPEC],
        )?;
        Ok(())
    }

    fn retrying(&self, operation: &str, mut attempt: impl FnMut() -> Result<()>) -> Result<()> {
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt() {
                Ok(()) => return Ok(()),
                Err(err) if tries < self.fetch_attempts && err.is_retryable() => {
                    warn!(operation, attempt = tries, error = %err, "git transport failed; retrying");
                    thread::sleep(RETRY_BACKOFF * tries);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn validate_project_id(project: &str) -> Result<()> {
    let valid = !project.is_empty()
        && !project.starts_with('.')
        && project
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidInput(format!(
            "'{project}' is not a valid project id"
        )))
    }
}
