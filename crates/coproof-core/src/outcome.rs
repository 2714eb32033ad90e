use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, ErrorKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl ExecutionOutcome {
    pub fn success(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Ok,
            message: message.into(),
            details,
        }
    }

    pub fn failure(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Failure,
            message: message.into(),
            details,
        }
    }

    pub fn user_error(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::UserError,
            message: message.into(),
            details,
        }
    }

    /// Structural problems, merge conflicts and lock contention need action
    /// from whoever sent the request; everything else is a service failure.
    pub fn from_error(err: &EngineError) -> Self {
        let message = err.to_string();
        let details = err.details();
        match err.kind() {
            ErrorKind::Structural | ErrorKind::MergeConflict | ErrorKind::LockContention => {
                Self::user_error(message, details)
            }
            ErrorKind::VersionControl
                if matches!(
                    err.root(),
                    EngineError::BranchNotFound { .. }
                        | EngineError::RevisionNotFound { .. }
                        | EngineError::MirrorMissing { .. }
                ) =>
            {
                Self::user_error(message, details)
            }
            _ => Self::failure(message, details),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Ok,
    UserError,
    Failure,
}

impl CommandStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            CommandStatus::Ok => 0,
            CommandStatus::UserError => 1,
            CommandStatus::Failure => 2,
        }
    }
}
