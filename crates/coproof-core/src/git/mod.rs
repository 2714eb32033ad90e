//! Thin wrapper over the `git` executable.

mod process;
mod remote;

use std::io;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::trace;

use crate::config::Identity;
use crate::error::{EngineError, Result};

pub use process::RunOutput;
pub use remote::{authenticated_url, redact_credentials, redact_remote_url};

use process::{run_bounded, Bounded, Capture, Captured, MAX_CAPTURE_BYTES};

#[derive(Clone, Debug)]
pub struct GitRunner {
    program: String,
    timeout: Duration,
}

impl Default for GitRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl GitRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "git".to_string(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True when a `git` executable can be started.
    pub fn available(&self) -> bool {
        Command::new(&self.program)
            .arg("--version")
            .output()
            .is_ok_and(|output| output.status.success())
    }

    fn command(&self, dir: &Path, args: &[&str], envs: &[(&str, &str)]) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("-C").arg(dir).args(args);
        command.env("GIT_TERMINAL_PROMPT", "0");
        command.env("LC_ALL", "C");
        for (key, value) in envs {
            command.env(key, value);
        }
        command
    }

    fn capture(&self, dir: &Path, args: &[&str], envs: &[(&str, &str)], capture: Capture) -> Result<Captured> {
        let operation = operation_name(args);
        trace!(dir = %dir.display(), operation, "git");
        match run_bounded(self.command(dir, args, envs), Some(self.timeout), capture) {
            Ok(Bounded::Finished(output)) => Ok(output),
            Ok(Bounded::TimedOut) => Err(EngineError::GitTimeout {
                operation,
                timeout_secs: self.timeout.as_secs(),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(EngineError::GitUnavailable { source: err })
            }
            Err(err) => Err(EngineError::io(format!("failed to run git {operation}"), err)),
        }
    }

    /// Runs git in `dir` and returns its raw output, whatever the exit code.
    /// Stdout is capped; check [`RunOutput::stdout_truncated`] before
    /// trusting it.
    pub fn output(&self, dir: &Path, args: &[&str], envs: &[(&str, &str)]) -> Result<RunOutput> {
        self.capture(dir, args, envs, Capture::limited())
            .map(Captured::into_output)
    }

    /// Runs git and returns trimmed stdout; a non-zero exit is an error, and
    /// so is stdout past the capture limit.
    pub fn run(&self, dir: &Path, args: &[&str]) -> Result<String> {
        self.run_with_env(dir, args, &[])
    }

    pub fn run_with_env(&self, dir: &Path, args: &[&str], envs: &[(&str, &str)]) -> Result<String> {
        let output = self.output(dir, args, envs)?;
        check_exit(args, &output)?;
        if output.stdout_truncated {
            return Err(EngineError::GitOutputTruncated {
                operation: operation_name(args),
                limit_bytes: MAX_CAPTURE_BYTES,
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Like [`GitRunner::run`] with no cap on stdout, for listings whose
    /// size grows with the repository.
    pub fn run_uncapped(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.capture(dir, args, &[], Capture::default())?.into_output();
        check_exit(args, &output)?;
        Ok(output.stdout.trim().to_string())
    }

    /// Reads every object in `objects` (any `<rev>:<path>` or object id) in
    /// a single `cat-file --batch`, without a size cap. Objects the mirror
    /// does not have come back as `None`.
    pub fn read_objects(&self, dir: &Path, objects: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }
        let mut input = Vec::new();
        for object in objects {
            if object.contains('\n') {
                return Err(EngineError::InvalidInput(format!(
                    "object name {object:?} spans lines"
                )));
            }
            input.extend_from_slice(object.as_bytes());
            input.push(b'\n');
        }
        let args = ["cat-file", "--batch"];
        let output = self.capture(
            dir,
            &args,
            &[],
            Capture {
                stdout_limit: None,
                stdin: Some(input),
            },
        )?;
        if output.code != 0 {
            return Err(EngineError::Git {
                operation: operation_name(&args),
                code: output.code,
                stderr: redact_credentials(output.stderr.trim()),
            });
        }
        parse_batch(&output.stdout, objects)
    }
    /// Runs git and reports only whether it exited zero.
    pub fn succeeds(&self, dir: &Path, args: &[&str]) -> Result<bool> {
        Ok(self.output(dir, args, &[])?.code == 0)
    }

    pub fn ref_exists(&self, dir: &Path, reference: &str) -> Result<bool> {
        self.succeeds(dir, &["rev-parse", "--verify", "--quiet", reference])
    }

    /// Validates `branch` with git's own ref-name rules.
    pub fn check_branch_name(&self, dir: &Path, branch: &str) -> Result<()> {
        if branch.starts_with('-') || !self.succeeds(dir, &["check-ref-format", "--branch", branch])? {
            return Err(EngineError::InvalidInput(format!(
                "'{branch}' is not a valid branch name"
            )));
        }
        Ok(())
    }
}

/// Author/committer environment for commits and merges.
pub fn identity_env<'a>(author: &'a Identity, committer: &'a Identity) -> [(&'static str, &'a str); 4] {
    [
        ("GIT_AUTHOR_NAME", author.name.as_str()),
        ("GIT_AUTHOR_EMAIL", author.email.as_str()),
        ("GIT_COMMITTER_NAME", committer.name.as_str()),
        ("GIT_COMMITTER_EMAIL", committer.email.as_str()),
    ]
}

fn check_exit(args: &[&str], output: &RunOutput) -> Result<()> {
    if output.code == 0 {
        return Ok(());
    }
    Err(EngineError::Git {
        operation: operation_name(args),
        code: output.code,
        stderr: redact_credentials(output.stderr.trim()),
    })
}

/// Splits `cat-file --batch` output: per object either
/// `<oid> <type> <size>\n<content>\n` or `<name> missing\n`.
fn parse_batch(stdout: &[u8], objects: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
    let malformed = |detail: &str| EngineError::Git {
        operation: "cat-file".to_string(),
        code: 0,
        stderr: format!("unexpected --batch output: {detail}"),
    };
    let mut contents = Vec::with_capacity(objects.len());
    let mut rest = stdout;
    for object in objects {
        let newline = rest
            .iter()
            .position(|byte| *byte == b'\n')
            .ok_or_else(|| malformed("missing header"))?;
        let header = String::from_utf8_lossy(&rest[..newline]).into_owned();
        rest = &rest[newline + 1..];
        if header.ends_with(" missing") {
            contents.push(None);
            continue;
        }
        if header.ends_with(" ambiguous") {
            return Err(EngineError::InvalidInput(format!("object name {object} is ambiguous")));
        }
        let size = header
            .rsplit(' ')
            .next()
            .and_then(|size| size.parse::<usize>().ok())
            .ok_or_else(|| malformed(&header))?;
        if rest.len() <= size {
            return Err(malformed("content shorter than declared"));
        }
        contents.push(Some(rest[..size].to_vec()));
        rest = &rest[size + 1..];
    }
    Ok(contents)
}

fn operation_name(args: &[&str]) -> String {
    args.iter()
        .find(|arg| !arg.starts_with('-'))
        .copied()
        .unwrap_or("git")
        .to_string()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::fs;
    use std::path::{Path, PathBuf};

    use super::GitRunner;

    pub(crate) fn git_available() -> bool {
        GitRunner::default().available()
    }

    pub(crate) fn git(dir: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
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

    /// Creates a bare "remote" holding one commit on `main` and returns its
    /// `file://` URL.
    pub(crate) fn seeded_remote(root: &Path, files: &[(&str, &str)]) -> (PathBuf, String) {
        let remote = root.join("remote.git");
        let seed = root.join("seed");
        fs::create_dir_all(&remote).expect("remote dir");
        fs::create_dir_all(&seed).expect("seed dir");
        git(&remote, &["init", "--bare", "--initial-branch=main"]);
        git(&seed, &["init", "--initial-branch=main"]);
        fs::write(seed.join("README.md"), "proofs\n").expect("readme");
        for (path, content) in files {
            let target = seed.join(path);
            fs::create_dir_all(target.parent().expect("parent")).expect("mkdir");
            fs::write(target, content).expect("write");
        }
        git(&seed, &["add", "-A"]);
        git(&seed, &["commit", "-m", "seed"]);
        let url = format!("file://{}", remote.display());
        git(&seed, &["push", &url, "main:main"]);
        (remote, url)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{git_available, seeded_remote};
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn failing_commands_carry_operation_and_stderr() {
        if !git_available() {
            eprintln!("skipping git runner test (git unavailable)");
            return;
        }
        let dir = tempdir().expect("tempdir");
        let (remote, _) = seeded_remote(dir.path(), &[]);
        let runner = GitRunner::default();
        assert!(runner.ref_exists(&remote, "refs/heads/main").expect("rev-parse"));
        assert!(!runner.ref_exists(&remote, "refs/heads/nope").expect("rev-parse"));

        let err = runner
            .run(&remote, &["rev-parse", "--verify", "refs/heads/nope"])
            .expect_err("missing ref");
        match err {
            EngineError::Git { operation, code, .. } => {
                assert_eq!(operation, "rev-parse");
                assert_ne!(code, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn oversized_output_fails_capped_runs_but_not_object_reads() {
        if !git_available() {
            return;
        }
        let big = "x".repeat(MAX_CAPTURE_BYTES + 4096);
        let dir = tempdir().expect("tempdir");
        let (remote, _) = seeded_remote(dir.path(), &[("big.txt", big.as_str()), ("small.txt", "hi\n")]);
        let runner = GitRunner::default();

        let err = runner
            .run(&remote, &["cat-file", "-p", "main:big.txt"])
            .expect_err("too large for a capped run");
        assert!(matches!(err, EngineError::GitOutputTruncated { .. }));
        assert!(!err.is_retryable());

        let objects = [
            "main:big.txt".to_string(),
            "main:absent.txt".to_string(),
            "main:small.txt".to_string(),
        ];
        let read = runner.read_objects(&remote, &objects).expect("batch read");
        assert_eq!(read.len(), 3);
        assert_eq!(read[0].as_deref(), Some(big.as_bytes()));
        assert!(read[1].is_none());
        assert_eq!(read[2].as_deref(), Some(&b"hi\n"[..]));
    }

    #[test]
    fn branch_names_are_validated() {
        if !git_available() {
            return;
        }
        let dir = tempdir().expect("tempdir");
        let runner = GitRunner::default();
        assert!(runner.check_branch_name(dir.path(), "proposal/abc-1").is_ok());
        assert!(runner.check_branch_name(dir.path(), "bad..name").is_err());
        assert!(runner.check_branch_name(dir.path(), "-f").is_err());
    }

    #[test]
    fn missing_program_is_reported_as_unavailable() {
        let runner = GitRunner {
            program: "coproof-no-such-git".to_string(),
            timeout: Duration::from_secs(5),
        };
        let err = runner
            .run(Path::new("."), &["status"])
            .expect_err("missing program");
        assert!(matches!(err, EngineError::GitUnavailable { .. }));
    }
}
