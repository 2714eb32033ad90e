//! Reads one statement's files at a commit of the project mirror.

use std::path::Path;

use coproof_domain::{NamingConvention, StatementId};
use serde::Serialize;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::git::GitRunner;
use crate::indexer::MirrorTree;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatementFiles {
    pub statement_id: StatementId,
    pub commit: String,
    pub source_path: String,
    pub source: Option<String>,
    pub companion_path: String,
    pub companion: Option<String>,
}

/// Reads the source and companion files of `id` at `revision` (the default
/// branch tip when `None`). A revision the mirror does not know yet triggers
/// one `refresh` (normally a fetch) before giving up.
pub fn read_statement(
    git: &GitRunner,
    mirror: &Path,
    naming: &NamingConvention,
    default_branch: &str,
    id: &StatementId,
    revision: Option<&str>,
    refresh: impl FnOnce() -> Result<()>,
) -> Result<StatementFiles> {
    let commit = match resolve(git, mirror, default_branch, revision)? {
        Some(commit) => commit,
        None => {
            debug!(revision = revision.unwrap_or(default_branch), "revision unknown; refreshing mirror");
            refresh()?;
            resolve(git, mirror, default_branch, revision)?.ok_or_else(|| {
                EngineError::RevisionNotFound {
                    revision: revision.unwrap_or(default_branch).to_string(),
                }
            })?
        }
    };

    let paths = naming.paths(id);
    let mut contents = git
        .read_objects(
            mirror,
            &[
                format!("{commit}:{}", paths.source),
                format!("{commit}:{}", paths.companion),
            ],
        )?
        .into_iter()
        .map(|content| content.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()));
    Ok(StatementFiles {
        statement_id: id.clone(),
        source: contents.next().flatten(),
        companion: contents.next().flatten(),
        source_path: paths.source,
        companion_path: paths.companion,
        commit,
    })
}

fn resolve(
    git: &GitRunner,
    mirror: &Path,
    default_branch: &str,
    revision: Option<&str>,
) -> Result<Option<String>> {
    match revision {
        Some(revision) => {
            if revision.starts_with('-') {
                return Err(EngineError::InvalidInput(format!(
                    "'{revision}' is not a revision"
                )));
            }
            let spec = format!("{revision}^{{commit}}");
            let output = git.output(mirror, &["rev-parse", "--verify", "--quiet", &spec], &[])?;
            Ok((output.code == 0).then(|| output.stdout.trim().to_string()))
        }
        None => match MirrorTree::at_branch(git, mirror, default_branch) {
            Ok(tree) => Ok(Some(tree.commit().to_string())),
            Err(EngineError::BranchNotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        },
    }
}
