use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::CheckerSettings;
use crate::error::{EngineError, Result};

/// What to compile: one self-contained source, or a file map with the entry
/// point that imports the rest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CheckRequest {
    Source { source: String },
    Project {
        files: BTreeMap<String, String>,
        entry: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
    pub message: String,
    #[serde(default)]
    pub severity: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    #[serde(alias = "compile_success")]
    pub valid: bool,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default, alias = "contains_sorry")]
    pub contains_open_marker: bool,
}

/// The external compiler. Invoked synchronously; failures to obtain a
/// verdict are [`EngineError::CheckerUnavailable`], never a failed report.
pub trait ProofChecker: Send + Sync {
    fn check(&self, request: &CheckRequest) -> Result<CheckReport>;
}

#[derive(Clone, Debug)]
pub struct HttpProofChecker {
    client: Client,
    endpoint: Url,
}

impl HttpProofChecker {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("coproof/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| EngineError::Config(format!("failed to build checker client: {err}")))?;
        Ok(Self { client, endpoint })
    }

    pub fn from_settings(settings: &CheckerSettings) -> Result<Self> {
        Self::new(settings.endpoint.clone(), settings.timeout)
    }
}

impl ProofChecker for HttpProofChecker {
    fn check(&self, request: &CheckRequest) -> Result<CheckReport> {
        debug!(endpoint = %self.endpoint, "submitting to proof checker");
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .map_err(|err| {
                warn!(endpoint = %self.endpoint, error = %err, "proof checker request failed");
                EngineError::CheckerUnavailable {
                    reason: err.to_string(),
                    timed_out: err.is_timeout(),
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let reason = if status.is_server_error() {
                format!("checker returned {status}")
            } else {
                format!("checker rejected the request ({status}): {}", body.trim())
            };
            warn!(endpoint = %self.endpoint, %status, "proof checker error response");
            return Err(EngineError::CheckerUnavailable {
                reason,
                timed_out: false,
            });
        }

        response
            .json::<CheckReport>()
            .map_err(|err| EngineError::CheckerUnavailable {
                reason: format!("checker returned an unreadable report: {err}"),
                timed_out: err.is_timeout(),
            })
    }
}
