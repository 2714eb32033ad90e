#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use coproof_core::{
    CheckReport, CheckRequest, Engine, EngineConfig, ProjectRemote, ProofChecker, Result,
    SqliteStatementStore, StaticTokenProvider,
};
use coproof_domain::{ScaffoldRequest, StatementKind};

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success())
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Bare repository with one commit on `main`, reachable over `file://`.
pub fn seeded_remote(root: &Path) -> (PathBuf, String) {
    let remote = root.join("remote.git");
    let seed = root.join("seed");
    fs::create_dir_all(&remote).expect("remote dir");
    fs::create_dir_all(&seed).expect("seed dir");
    git(&remote, &["init", "--bare", "--initial-branch=main"]);
    git(&seed, &["init", "--initial-branch=main"]);
    fs::write(seed.join("README.md"), "proofs\n").expect("readme");
    git(&seed, &["add", "-A"]);
    git(&seed, &["commit", "-m", "seed"]);
    let url = format!("file://{}", remote.display());
    git(&seed, &["push", &url, "main:main"]);
    (remote, url)
}

/// Checker that accepts everything and remembers what it was sent.
#[derive(Default)]
pub struct RecordingChecker {
    pub requests: Mutex<Vec<CheckRequest>>,
    pub reject: bool,
}

impl ProofChecker for RecordingChecker {
    fn check(&self, request: &CheckRequest) -> Result<CheckReport> {
        let open = match request {
            CheckRequest::Source { source } => source.contains("sorry"),
            CheckRequest::Project { files, .. } => files.values().any(|body| body.contains("sorry")),
        };
        self.requests
            .lock()
            .expect("checker mutex")
            .push(request.clone());
        Ok(CheckReport {
            valid: !self.reject,
            diagnostics: Vec::new(),
            contains_open_marker: open,
        })
    }
}

pub fn engine(storage: &Path, checker: Arc<RecordingChecker>) -> Engine {
    let mut config = EngineConfig::rooted_at(storage);
    config.fetch_attempts = 3;
    let store = SqliteStatementStore::open(config.index_path.clone()).expect("store");
    Engine::new(
        config,
        Arc::new(store),
        Arc::new(StaticTokenProvider::default()),
    )
    .with_checker(checker)
}

pub fn remote(url: &str) -> ProjectRemote {
    ProjectRemote::new("proj", url)
}

pub fn request(
    id: &str,
    parent: Option<&str>,
    kind: StatementKind,
    name: &str,
    proof: Option<&str>,
    deps: &[&str],
) -> ScaffoldRequest {
    ScaffoldRequest {
        statement_id: id.to_string(),
        parent_statement_id: parent.map(str::to_string),
        kind,
        name: name.to_string(),
        signature: "True".to_string(),
        proof_body: proof.map(str::to_string),
        dependency_ids: deps.iter().map(|dep| (*dep).to_string()).collect(),
        companion: None,
    }
}
