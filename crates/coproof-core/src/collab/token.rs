use crate::config::{EnvSnapshot, TOKEN_ENV};
use crate::error::Result;

/// Supplies a currently valid remote access token. Called before every
/// remote operation; the engine never caches or refreshes tokens itself.
pub trait TokenProvider: Send + Sync {
    fn token(&self, project: &str) -> Result<Option<String>>;
}

#[derive(Clone, Debug, Default)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self, _project: &str) -> Result<Option<String>> {
        Ok(self.token.clone())
    }
}

/// Reads the token from an environment variable at call time.
#[derive(Clone, Debug)]
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvTokenProvider {
    fn default() -> Self {
        Self::new(TOKEN_ENV)
    }
}

impl TokenProvider for EnvTokenProvider {
    fn token(&self, _project: &str) -> Result<Option<String>> {
        Ok(EnvSnapshot::capture().var(&self.var).map(str::to_string))
    }
}
