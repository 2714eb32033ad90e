//! Engine error taxonomy.
//!
//! Callers branch on [`ErrorKind`], never on message text. Every variant
//! carries a stable code, a snake_case reason and a JSON detail object so the
//! CLI (and any API layer on top) can render actionable failures.

use std::io;

use coproof_domain::{format_cycle, GraphViolation, ParseIssue, ScaffoldError};
use serde::Serialize;
use serde_json::{json, Map, Value};

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    LockContention,
    VersionControl,
    MergeConflict,
    Structural,
    CheckerUnavailable,
    Storage,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("resource {key} is locked (gave up after {waited_ms} ms)")]
    ResourceLocked { key: String, waited_ms: u64 },
    #[error("lease on {key} expired or was taken over")]
    LeaseLost { key: String },
    #[error("git {operation} failed (exit {code}): {stderr}")]
    Git {
        operation: String,
        code: i32,
        stderr: String,
    },
    #[error("git {operation} timed out after {timeout_secs}s")]
    GitTimeout { operation: String, timeout_secs: u64 },
    #[error("git {operation} wrote more than {limit_bytes} bytes to stdout")]
    GitOutputTruncated { operation: String, limit_bytes: usize },
    #[error("git is required but could not be started: {source}")]
    GitUnavailable {
        #[source]
        source: io::Error,
    },
    #[error("branch '{branch}' does not exist")]
    BranchNotFound { branch: String },
    #[error("revision '{revision}' is not present in the mirror")]
    RevisionNotFound { revision: String },
    #[error("no mirror exists for project {project}")]
    MirrorMissing { project: String },
    #[error("transaction on branch '{branch}' failed: {source}")]
    Transaction {
        branch: String,
        #[source]
        source: Box<EngineError>,
    },
    #[error("merging {source_branch} into {target_branch} conflicts in {}", .files.join(", "))]
    MergeConflict {
        source_branch: String,
        target_branch: String,
        files: Vec<String>,
    },
    #[error(transparent)]
    Graph(#[from] GraphViolation),
    #[error(transparent)]
    Scaffold(#[from] ScaffoldError),
    #[error(transparent)]
    Parse(#[from] ParseIssue),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("proof checker unavailable: {reason}")]
    CheckerUnavailable { reason: String, timed_out: bool },
    #[error("statement index error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("statement index is inconsistent: {0}")]
    StoreCorrupt(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl EngineError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wraps a failure raised inside a transaction on `branch`. Already
    /// wrapped errors are returned unchanged.
    pub fn in_transaction(self, branch: &str) -> Self {
        match self {
            wrapped @ Self::Transaction { .. } => wrapped,
            other => Self::Transaction {
                branch: branch.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through transaction wrappers.
    pub fn root(&self) -> &EngineError {
        match self {
            Self::Transaction { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceLocked { .. } | Self::LeaseLost { .. } => ErrorKind::LockContention,
            Self::Git { .. }
            | Self::GitTimeout { .. }
            | Self::GitOutputTruncated { .. }
            | Self::GitUnavailable { .. }
            | Self::BranchNotFound { .. }
            | Self::RevisionNotFound { .. }
            | Self::MirrorMissing { .. } => ErrorKind::VersionControl,
            Self::Transaction { source, .. } => source.kind(),
            Self::MergeConflict { .. } => ErrorKind::MergeConflict,
            Self::Scaffold(ScaffoldError::Io { .. }) | Self::Io { .. } => ErrorKind::Io,
            Self::Graph(_)
            | Self::Scaffold(_)
            | Self::Parse(_)
            | Self::InvalidInput(_)
            | Self::Config(_) => ErrorKind::Structural,
            Self::CheckerUnavailable { .. } => ErrorKind::CheckerUnavailable,
            Self::Storage(_) | Self::StoreCorrupt(_) => ErrorKind::Storage,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::BranchNotFound { .. }
            | Self::RevisionNotFound { .. }
            | Self::MirrorMissing { .. }
            | Self::GitOutputTruncated { .. }
            | Self::GitUnavailable { .. } => false,
            other => matches!(
                other.kind(),
                ErrorKind::LockContention
                    | ErrorKind::VersionControl
                    | ErrorKind::CheckerUnavailable
            ),
        }
    }

    pub fn code(&self) -> &'static str {
        match self.root() {
            Self::ResourceLocked { .. } => "CP101",
            Self::LeaseLost { .. } => "CP102",
            Self::Git { .. } => "CP201",
            Self::GitTimeout { .. } => "CP202",
            Self::GitUnavailable { .. } => "CP203",
            Self::BranchNotFound { .. } | Self::RevisionNotFound { .. } => "CP204",
            Self::MirrorMissing { .. } => "CP205",
            Self::GitOutputTruncated { .. } => "CP206",
            Self::MergeConflict { .. } => "CP301",
            Self::Graph(GraphViolation::Cycle { .. }) => "CP401",
            Self::Graph(GraphViolation::MissingReferences(_)) => "CP402",
            Self::Graph(GraphViolation::AlreadyExists(_)) => "CP403",
            Self::Scaffold(ScaffoldError::MissingStatementFiles { .. }) => "CP404",
            Self::Scaffold(ScaffoldError::Io { .. }) => "CP701",
            Self::Scaffold(_) | Self::Parse(_) | Self::InvalidInput(_) => "CP405",
            Self::Config(_) => "CP406",
            Self::CheckerUnavailable { .. } => "CP501",
            Self::Storage(_) => "CP601",
            Self::StoreCorrupt(_) => "CP602",
            Self::Io { .. } => "CP701",
            Self::Transaction { .. } => "CP200",
        }
    }

    pub fn reason(&self) -> &'static str {
        match self.root() {
            Self::ResourceLocked { .. } => "resource_locked",
            Self::LeaseLost { .. } => "lease_lost",
            Self::Git { .. } => "git_failed",
            Self::GitTimeout { .. } => "git_timeout",
            Self::GitUnavailable { .. } => "git_unavailable",
            Self::BranchNotFound { .. } => "branch_not_found",
            Self::RevisionNotFound { .. } => "revision_not_found",
            Self::MirrorMissing { .. } => "mirror_missing",
            Self::GitOutputTruncated { .. } => "git_output_truncated",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::Graph(GraphViolation::Cycle { .. }) => "dependency_cycle",
            Self::Graph(GraphViolation::MissingReferences(_)) => "missing_references",
            Self::Graph(GraphViolation::AlreadyExists(_)) => "statement_exists",
            Self::Scaffold(ScaffoldError::MissingStatementFiles { .. }) => "missing_statement_files",
            Self::Scaffold(ScaffoldError::Io { .. }) => "scaffold_write_failed",
            Self::Scaffold(_) => "invalid_scaffold_input",
            Self::Parse(_) => "unparseable_statement",
            Self::InvalidInput(_) => "invalid_input",
            Self::Config(_) => "invalid_config",
            Self::CheckerUnavailable { timed_out: true, .. } => "checker_timeout",
            Self::CheckerUnavailable { .. } => "checker_unavailable",
            Self::Storage(_) => "index_storage_failed",
            Self::StoreCorrupt(_) => "index_corrupt",
            Self::Io { .. } => "io_failed",
            Self::Transaction { .. } => "transaction_failed",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self.root() {
            Self::ResourceLocked { .. } => Some("Another operation holds the lock; retry shortly."),
            Self::LeaseLost { .. } => Some("The lease lapsed and another worker may hold the lock now; retry the operation."),
            Self::GitTimeout { .. } => Some("Raise COPROOF_GIT_TIMEOUT_SECS or check remote connectivity."),
            Self::GitUnavailable { .. } => Some("Install git and ensure it is on PATH."),
            Self::MirrorMissing { .. } => Some("Run `coproof mirror ensure` first."),
            Self::MergeConflict { .. } => {
                Some("Rebase the proposal onto the current default branch and verify again.")
            }
            Self::Graph(GraphViolation::Cycle { .. }) => {
                Some("Remove one of the listed dependencies to break the cycle.")
            }
            Self::Graph(GraphViolation::MissingReferences(_)) => {
                Some("Reference only statements already merged into the default branch.")
            }
            Self::Graph(GraphViolation::AlreadyExists(_)) => {
                Some("Indexed statements are immutable; create a new statement instead.")
            }
            Self::CheckerUnavailable { .. } => Some("The proof checker could not be reached; retry later."),
            Self::StoreCorrupt(_) => Some("Run `coproof reindex` to rebuild the statement index."),
            _ => None,
        }
    }

    pub fn details(&self) -> Value {
        let mut map = Map::new();
        map.insert("code".into(), json!(self.code()));
        map.insert("reason".into(), json!(self.reason()));
        map.insert("kind".into(), json!(self.kind()));
        map.insert("retryable".into(), json!(self.is_retryable()));
        if let Some(hint) = self.hint() {
            map.insert("hint".into(), json!(hint));
        }
        if let Self::Transaction { branch, .. } = self {
            map.insert("branch".into(), json!(branch));
        }
        match self.root() {
            Self::ResourceLocked { key, waited_ms } => {
                map.insert("lock".into(), json!(key));
                map.insert("waited_ms".into(), json!(waited_ms));
            }
            Self::LeaseLost { key } => {
                map.insert("lock".into(), json!(key));
            }
            Self::Git {
                operation,
                code,
                stderr,
            } => {
                map.insert("operation".into(), json!(operation));
                map.insert("exit_code".into(), json!(code));
                map.insert("stderr".into(), json!(stderr));
            }
            Self::GitTimeout {
                operation,
                timeout_secs,
            } => {
                map.insert("operation".into(), json!(operation));
                map.insert("timeout_secs".into(), json!(timeout_secs));
            }
            Self::GitOutputTruncated {
                operation,
                limit_bytes,
            } => {
                map.insert("operation".into(), json!(operation));
                map.insert("limit_bytes".into(), json!(limit_bytes));
            }
            Self::BranchNotFound { branch } => {
                map.insert("branch".into(), json!(branch));
            }
            Self::RevisionNotFound { revision } => {
                map.insert("revision".into(), json!(revision));
            }
            Self::MirrorMissing { project } => {
                map.insert("project".into(), json!(project));
            }
            Self::MergeConflict {
                source_branch,
                target_branch,
                files,
            } => {
                map.insert("source_branch".into(), json!(source_branch));
                map.insert("target_branch".into(), json!(target_branch));
                map.insert("conflicting_files".into(), json!(files));
            }
            Self::Graph(GraphViolation::Cycle { path }) => {
                map.insert("cycle".into(), json!(path));
                map.insert("cycle_path".into(), json!(format_cycle(path)));
            }
            Self::Graph(GraphViolation::MissingReferences(missing)) => {
                map.insert("missing".into(), json!(missing));
            }
            Self::Graph(GraphViolation::AlreadyExists(id)) => {
                map.insert("statement_id".into(), json!(id));
            }
            Self::Scaffold(ScaffoldError::MissingStatementFiles { missing, entry }) => {
                map.insert("entry".into(), json!(entry));
                map.insert("missing".into(), json!(missing));
            }
            Self::CheckerUnavailable { timed_out, .. } => {
                map.insert("timed_out".into(), json!(timed_out));
            }
            _ => {}
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coproof_domain::StatementId;

    #[test]
    fn transaction_wrapper_delegates_to_inner_error() {
        let err = EngineError::MergeConflict {
            source_branch: "proposal/a".into(),
            target_branch: "main".into(),
            files: vec!["statements/S_x.lean".into()],
        }
        .in_transaction("proposal/a")
        .in_transaction("ignored");

        assert_eq!(err.kind(), ErrorKind::MergeConflict);
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "CP301");
        let details = err.details();
        assert_eq!(details["branch"], "proposal/a");
        assert_eq!(details["conflicting_files"][0], "statements/S_x.lean");
    }

    #[test]
    fn lock_and_transport_failures_are_retryable() {
        let locked = EngineError::ResourceLocked {
            key: "lock:project:p".into(),
            waited_ms: 10,
        };
        assert_eq!(locked.kind(), ErrorKind::LockContention);
        assert!(locked.is_retryable());

        let push = EngineError::Git {
            operation: "push".into(),
            code: 1,
            stderr: "rejected".into(),
        };
        assert!(push.is_retryable());
        assert!(!EngineError::BranchNotFound {
            branch: "b".into()
        }
        .is_retryable());
    }

    #[test]
    fn cycle_details_carry_the_path() {
        let a = StatementId::generate();
        let b = StatementId::generate();
        let err = EngineError::from(GraphViolation::Cycle {
            path: vec![a.clone(), b.clone()],
        });
        assert_eq!(err.kind(), ErrorKind::Structural);
        assert!(!err.is_retryable());
        assert_eq!(
            err.details()["cycle_path"],
            format!("{a} -> {b} -> {a}").as_str()
        );
    }
}
