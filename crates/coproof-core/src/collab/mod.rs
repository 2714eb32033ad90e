//! Contracts for the services the engine calls out to.

mod checker;
mod host;
mod token;

pub use checker::{CheckReport, CheckRequest, Diagnostic, HttpProofChecker, ProofChecker};
pub use host::{PullRequest, PullRequestHost, PullRequestState};
pub use token::{EnvTokenProvider, StaticTokenProvider, TokenProvider};
