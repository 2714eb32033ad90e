#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod graph;
pub mod scaffold;
pub mod statement;

pub use graph::{
    find_cycle, format_cycle, resolve_proof_closure, validate_candidate, AmbiguousClosure,
    BuildPlan, Candidate, ClosureReport, EdgeRole, GraphViolation, MissingReference, PlanEntry,
    PlanOrigin, StatementGraph,
};
pub use scaffold::{
    render_entry_point, render_statement, write_entry_point, MissingStatementFile,
    RenderedStatement, ScaffoldError, ScaffoldRequest,
};
pub use statement::{
    IdSource, InvalidStatementId, NamingConvention, ParseIssue, ParsedStatement, StatementId,
    StatementKind, StatementNode, StatementParser, StatementPaths, ROOT_SENTINEL,
};
