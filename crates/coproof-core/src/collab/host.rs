use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestState {
    Open,
    Merged,
    Closed,
}

/// Request metadata as reported by the hosting service. `number`, `url`
/// and `merge_commit` are passed through untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: Option<String>,
    pub state: PullRequestState,
    pub head: String,
    pub base: String,
    pub merge_commit: Option<String>,
}

/// Pull-request style review workflow on the remote host.
pub trait PullRequestHost: Send + Sync {
    /// Opens a request for `head` into `base`, or returns the existing one.
    fn open(&self, project: &str, head: &str, base: &str, title: &str) -> Result<PullRequest>;
    fn merge(&self, project: &str, number: u64) -> Result<PullRequest>;
    fn get(&self, project: &str, number: u64) -> Result<Option<PullRequest>>;
}
