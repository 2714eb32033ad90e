//! Statement identity, kinds, and the persisted node shape.

mod naming;
mod parser;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use naming::{NamingConvention, StatementPaths};
pub use parser::{IdSource, ParseIssue, ParsedStatement, StatementParser};

/// Header value meaning "attached to the tree root".
pub const ROOT_SENTINEL: &str = "root";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("'{value}' is not a well-formed statement id")]
pub struct InvalidStatementId {
    pub value: String,
}

/// Immutable statement identifier (canonical lowercase hyphenated UUID).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StatementId(String);

impl StatementId {
    pub fn parse(raw: &str) -> Result<Self, InvalidStatementId> {
        let trimmed = raw.trim();
        let uuid = Uuid::parse_str(trimmed).map_err(|_| InvalidStatementId {
            value: trimmed.to_string(),
        })?;
        Ok(Self(uuid.hyphenated().to_string()))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StatementId {
    type Err = InvalidStatementId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StatementId {
    type Error = InvalidStatementId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StatementId> for String {
    fn from(value: StatementId) -> Self {
        value.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Goal,
    Theorem,
    Lemma,
    Corollary,
    Definition,
    Evaluation,
}

impl StatementKind {
    pub const ALL: [StatementKind; 6] = [
        StatementKind::Goal,
        StatementKind::Theorem,
        StatementKind::Lemma,
        StatementKind::Corollary,
        StatementKind::Definition,
        StatementKind::Evaluation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::Goal => "goal",
            StatementKind::Theorem => "theorem",
            StatementKind::Lemma => "lemma",
            StatementKind::Corollary => "corollary",
            StatementKind::Definition => "definition",
            StatementKind::Evaluation => "evaluation",
        }
    }

    /// Declaration keyword emitted when scaffolding a statement of this kind.
    pub fn keyword(self) -> &'static str {
        match self {
            StatementKind::Goal | StatementKind::Theorem | StatementKind::Corollary => "theorem",
            StatementKind::Lemma => "lemma",
            StatementKind::Definition => "def",
            StatementKind::Evaluation => "example",
        }
    }

    /// Maps a declaration keyword found in a statement body.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "theorem" => Some(StatementKind::Theorem),
            "lemma" => Some(StatementKind::Lemma),
            "corollary" => Some(StatementKind::Corollary),
            "def" | "abbrev" => Some(StatementKind::Definition),
            "example" => Some(StatementKind::Evaluation),
            "axiom" => Some(StatementKind::Goal),
            _ => None,
        }
    }

    /// Whether a resolved child of this kind can discharge its parent.
    pub fn can_close_parent(self) -> bool {
        matches!(self, StatementKind::Theorem | StatementKind::Lemma)
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "goal" | "global_goal" => Ok(StatementKind::Goal),
            "theorem" => Ok(StatementKind::Theorem),
            "lemma" => Ok(StatementKind::Lemma),
            "corollary" => Ok(StatementKind::Corollary),
            "definition" | "def" => Ok(StatementKind::Definition),
            "evaluation" | "numerical_eval" => Ok(StatementKind::Evaluation),
            other => Err(format!("unknown statement kind '{other}'")),
        }
    }
}

/// One indexed statement as persisted by the graph index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementNode {
    pub statement_id: StatementId,
    pub title: String,
    pub kind: StatementKind,
    /// `None` means attached to the tree root.
    pub parent_statement_id: Option<StatementId>,
    pub dependencies: Vec<StatementId>,
    pub is_resolved: bool,
    pub proven_by: Option<StatementId>,
    pub source_path: String,
    pub companion_path: String,
}
