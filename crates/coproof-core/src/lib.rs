#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

pub mod collab;
pub mod config;
pub mod error;
pub mod git;
pub mod indexer;
pub mod lock;
pub mod outcome;
pub mod reader;
pub mod repo_cache;
pub mod store;
pub mod transaction;
pub mod workflow;

pub use collab::{
    CheckReport, CheckRequest, Diagnostic, EnvTokenProvider, HttpProofChecker, ProofChecker,
    PullRequest, PullRequestHost, PullRequestState, StaticTokenProvider, TokenProvider,
};
pub use config::{CheckerSettings, EngineConfig, EnvSnapshot, Identity, LockSettings};
pub use error::{EngineError, ErrorKind, Result};
pub use git::GitRunner;
pub use indexer::{
    DroppedEdge, DuplicateStatement, GraphIndexer, MirrorTree, ReindexReport, SkippedFile,
    SourceFile, StatementSource,
};
pub use lock::{
    Fence, FileLeaseBackend, Lease, LockBackend, LockGuard, LockManager, LockOptions, LockScope,
    Unfenced,
};
pub use outcome::{CommandStatus, ExecutionOutcome};
pub use reader::{read_statement, StatementFiles};
pub use repo_cache::RepoCache;
pub use store::{IndexBatch, ProjectSnapshot, SqliteStatementStore, StatementStore};
pub use transaction::{
    Checkout, MergeOutcome, MirrorAccess, TransactionEngine, TransactionState, WriteOutcome,
};
pub use workflow::{Engine, MergeReport, ProjectRemote, SubmitOutcome, VerifyOutcome};
