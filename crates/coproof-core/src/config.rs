use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use coproof_domain::NamingConvention;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{EngineError, Result};

pub const DEFAULT_STORAGE_PATH: &str = "/tmp/coproof-storage";
pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_BOT_NAME: &str = "CoProof Bot";
pub const DEFAULT_BOT_EMAIL: &str = "bot@coproof.com";
pub const TOKEN_ENV: &str = "COPROOF_GIT_TOKEN";

/// Point-in-time copy of the process environment.
#[derive(Clone, Debug, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn secs(&self, key: &str, default: u64) -> Result<Duration> {
        self.number(key, default).map(Duration::from_secs)
    }

    fn number(&self, key: &str, default: u64) -> Result<u64> {
        match self.var(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| EngineError::Config(format!("{key} must be a whole number (got '{raw}')"))),
        }
    }
}

/// Name/email pair used for git author and committer identities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockSettings {
    pub acquire_timeout: Duration,
    pub ttl: Duration,
    pub poll_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            ttl: Duration::from_secs(300),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckerSettings {
    pub endpoint: Url,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub storage_root: PathBuf,
    pub index_path: PathBuf,
    pub default_branch: String,
    pub lock: LockSettings,
    pub git_timeout: Duration,
    pub fetch_attempts: u32,
    pub committer: Identity,
    pub checker: Option<CheckerSettings>,
    pub naming: NamingConvention,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let storage_root = PathBuf::from(
            snapshot
                .var("COPROOF_STORAGE_PATH")
                .unwrap_or(DEFAULT_STORAGE_PATH),
        );
        let index_path = snapshot
            .var("COPROOF_INDEX_PATH")
            .map_or_else(|| storage_root.join("index.sqlite"), PathBuf::from);

        let lock = LockSettings {
            acquire_timeout: snapshot.secs("COPROOF_LOCK_TIMEOUT_SECS", 10)?,
            ttl: snapshot.secs("COPROOF_LOCK_TTL_SECS", 300)?,
            ..LockSettings::default()
        };
        if lock.ttl.is_zero() {
            return Err(EngineError::Config(
                "COPROOF_LOCK_TTL_SECS must be greater than zero".into(),
            ));
        }

        let git_timeout = snapshot.secs("COPROOF_GIT_TIMEOUT_SECS", 120)?;
        let fetch_attempts = u32::try_from(snapshot.number("COPROOF_FETCH_ATTEMPTS", 3)?)
            .map_err(|_| EngineError::Config("COPROOF_FETCH_ATTEMPTS is too large".into()))?
            .max(1);

        let checker = match snapshot.var("COPROOF_CHECKER_URL") {
            None => None,
            Some(raw) => Some(CheckerSettings {
                endpoint: Url::parse(raw).map_err(|err| {
                    EngineError::Config(format!("COPROOF_CHECKER_URL is not a valid URL: {err}"))
                })?,
                timeout: snapshot.secs("COPROOF_CHECKER_TIMEOUT_SECS", 120)?,
            }),
        };

        // A single git call or checker request must fit inside one lease.
        ensure_ttl_covers(&lock, "COPROOF_GIT_TIMEOUT_SECS", git_timeout)?;
        if let Some(checker) = &checker {
            ensure_ttl_covers(&lock, "COPROOF_CHECKER_TIMEOUT_SECS", checker.timeout)?;
        }

        let defaults = NamingConvention::default();
        let naming = NamingConvention {
            statements_dir: snapshot
                .var("COPROOF_STATEMENTS_DIR")
                .map_or(defaults.statements_dir.clone(), |dir| {
                    dir.trim_matches('/').to_string()
                }),
            module_prefix: snapshot
                .var("COPROOF_MODULE_PREFIX")
                .map_or(defaults.module_prefix.clone(), str::to_string),
            package_name: snapshot
                .var("COPROOF_PACKAGE_NAME")
                .map_or(defaults.package_name.clone(), str::to_string),
            ..defaults
        };

        Ok(Self {
            storage_root,
            index_path,
            default_branch: snapshot
                .var("COPROOF_DEFAULT_BRANCH")
                .unwrap_or(DEFAULT_BRANCH)
                .to_string(),
            lock,
            git_timeout,
            fetch_attempts,
            committer: Identity::new(
                snapshot.var("COPROOF_BOT_NAME").unwrap_or(DEFAULT_BOT_NAME),
                snapshot.var("COPROOF_BOT_EMAIL").unwrap_or(DEFAULT_BOT_EMAIL),
            ),
            checker,
            naming,
        })
    }

    /// Configuration rooted at `storage_root` with every other value at its
    /// default.
    pub fn rooted_at(storage_root: impl Into<PathBuf>) -> Self {
        let storage_root = storage_root.into();
        Self {
            index_path: storage_root.join("index.sqlite"),
            storage_root,
            default_branch: DEFAULT_BRANCH.to_string(),
            lock: LockSettings::default(),
            git_timeout: Duration::from_secs(120),
            fetch_attempts: 3,
            committer: Identity::new(DEFAULT_BOT_NAME, DEFAULT_BOT_EMAIL),
            checker: None,
            naming: NamingConvention::default(),
        }
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.storage_root.join("repos")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.storage_root.join("worktrees")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.storage_root.join("locks")
    }
}

fn ensure_ttl_covers(lock: &LockSettings, key: &str, timeout: Duration) -> Result<()> {
    if lock.ttl < timeout {
        return Err(EngineError::Config(format!(
            "COPROOF_LOCK_TTL_SECS ({}s) must be at least {key} ({}s)",
            lock.ttl.as_secs(),
            timeout.as_secs()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let config = EngineConfig::from_snapshot(&EnvSnapshot::default()).expect("config");
        assert_eq!(config.storage_root, PathBuf::from(DEFAULT_STORAGE_PATH));
        assert_eq!(
            config.index_path,
            PathBuf::from(DEFAULT_STORAGE_PATH).join("index.sqlite")
        );
        assert_eq!(config.default_branch, "main");
        assert_eq!(config.lock.acquire_timeout, Duration::from_secs(10));
        assert_eq!(config.lock.ttl, Duration::from_secs(300));
        assert_eq!(config.fetch_attempts, 3);
        assert_eq!(config.committer.email, DEFAULT_BOT_EMAIL);
        assert!(config.checker.is_none());
        assert_eq!(config.naming, NamingConvention::default());
    }

    #[test]
    fn overrides_are_read_from_snapshot() {
        let snapshot = EnvSnapshot::from_pairs(&[
            ("COPROOF_STORAGE_PATH", "/srv/coproof"),
            ("COPROOF_DEFAULT_BRANCH", "trunk"),
            ("COPROOF_LOCK_TIMEOUT_SECS", "3"),
            ("COPROOF_FETCH_ATTEMPTS", "0"),
            ("COPROOF_CHECKER_URL", "http://checker.internal:8080/verify"),
            ("COPROOF_STATEMENTS_DIR", "/proofs/"),
            ("COPROOF_MODULE_PREFIX", "Stmt_"),
            ("COPROOF_BOT_NAME", "   "),
        ]);
        let config = EngineConfig::from_snapshot(&snapshot).expect("config");
        assert_eq!(config.repos_dir(), PathBuf::from("/srv/coproof/repos"));
        assert_eq!(config.default_branch, "trunk");
        assert_eq!(config.lock.acquire_timeout, Duration::from_secs(3));
        assert_eq!(config.fetch_attempts, 1);
        let checker = config.checker.expect("checker");
        assert_eq!(checker.timeout, Duration::from_secs(120));
        assert_eq!(config.naming.statements_dir, "proofs");
        assert_eq!(config.naming.module_prefix, "Stmt_");
        assert_eq!(config.committer.name, DEFAULT_BOT_NAME);
    }

    #[test]
    fn leases_must_outlive_single_operations() {
        let short_git = EnvSnapshot::from_pairs(&[
            ("COPROOF_LOCK_TTL_SECS", "60"),
            ("COPROOF_GIT_TIMEOUT_SECS", "120"),
        ]);
        let err = EngineConfig::from_snapshot(&short_git).expect_err("ttl below git timeout");
        assert!(err.to_string().contains("COPROOF_GIT_TIMEOUT_SECS"));

        let short_checker = EnvSnapshot::from_pairs(&[
            ("COPROOF_LOCK_TTL_SECS", "150"),
            ("COPROOF_CHECKER_URL", "http://checker.internal/verify"),
            ("COPROOF_CHECKER_TIMEOUT_SECS", "200"),
        ]);
        let err = EngineConfig::from_snapshot(&short_checker).expect_err("ttl below checker timeout");
        assert!(matches!(err, EngineError::Config(ref message) if message.contains("COPROOF_CHECKER_TIMEOUT_SECS")));

        let fitting = EnvSnapshot::from_pairs(&[
            ("COPROOF_LOCK_TTL_SECS", "150"),
            ("COPROOF_GIT_TIMEOUT_SECS", "150"),
        ]);
        assert!(EngineConfig::from_snapshot(&fitting).is_ok());
    }

    #[test]
    fn malformed_numbers_are_config_errors() {
        let snapshot = EnvSnapshot::from_pairs(&[("COPROOF_GIT_TIMEOUT_SECS", "soon")]);
        let err = EngineConfig::from_snapshot(&snapshot).expect_err("invalid");
        assert!(matches!(err, EngineError::Config(_)));
    }
}
