use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{NamingConvention, StatementId, StatementKind, ROOT_SENTINEL};

const ID_HEADER: &str = "statement_id";
const PARENT_HEADER: &str = "parent_statement_id";
const KIND_HEADER: &str = "statement_kind";
const DECLARATION_KEYWORDS: &[&str] = &[
    "theorem",
    "lemma",
    "corollary",
    "def",
    "abbrev",
    "axiom",
    "example",
];
const UNKNOWN_TITLE: &str = "unknown";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ParseIssue {
    #[error("{path}: no statement id in header or file name")]
    MissingStatementId { path: String },
}

/// Where a parsed statement's id came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSource {
    Header,
    FileName,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedStatement {
    pub statement_id: StatementId,
    pub id_source: IdSource,
    pub parent_statement_id: Option<StatementId>,
    pub kind: StatementKind,
    pub title: String,
    pub dependencies: Vec<StatementId>,
    pub has_open_marker: bool,
    pub source_path: String,
}

#[derive(Default)]
struct Headers<'a> {
    statement_id: Option<&'a str>,
    parent: Option<&'a str>,
    kind: Option<&'a str>,
}

/// Extracts statement metadata from a statement source file.
#[derive(Clone, Debug, Default)]
pub struct StatementParser {
    naming: NamingConvention,
}

impl StatementParser {
    pub fn new(naming: NamingConvention) -> Self {
        Self { naming }
    }

    pub fn naming(&self) -> &NamingConvention {
        &self.naming
    }

    pub fn parse(&self, rel_path: &str, content: &str) -> Result<ParsedStatement, ParseIssue> {
        let headers = self.headers(content);

        let (statement_id, id_source) = match headers.statement_id.map(StatementId::parse) {
            Some(Ok(id)) => (id, IdSource::Header),
            header => {
                let Some(id) = self.naming.id_from_path(rel_path) else {
                    return Err(ParseIssue::MissingStatementId {
                        path: rel_path.to_string(),
                    });
                };
                if let Some(Err(err)) = header {
                    warn!(path = rel_path, %err, fallback = %id, "malformed statement id header");
                } else {
                    warn!(path = rel_path, fallback = %id, "statement id header missing");
                }
                (id, IdSource::FileName)
            }
        };

        let parent_statement_id = match headers.parent {
            None => None,
            Some(raw) if raw.eq_ignore_ascii_case(ROOT_SENTINEL) => None,
            Some(raw) => match StatementId::parse(raw) {
                Ok(parent) => Some(parent),
                Err(err) => {
                    warn!(path = rel_path, %err, "malformed parent header; attaching to root");
                    None
                }
            },
        };

        let declaration = declaration(content);
        let kind = headers
            .kind
            .and_then(|raw| raw.parse::<StatementKind>().ok())
            .or_else(|| declaration.and_then(|(keyword, _)| StatementKind::from_keyword(keyword)))
            .unwrap_or(StatementKind::Lemma);
        let title = declaration
            .map_or(UNKNOWN_TITLE, |(_, name)| name)
            .to_string();

        let mut dependencies: Vec<StatementId> = Vec::new();
        for module in import_modules(content) {
            if let Some(dep) = self.naming.id_from_import(module) {
                if dep != statement_id && !dependencies.contains(&dep) {
                    dependencies.push(dep);
                }
            }
        }

        Ok(ParsedStatement {
            has_open_marker: contains_word(content, &self.naming.open_marker),
            statement_id,
            id_source,
            parent_statement_id,
            kind,
            title,
            dependencies,
            source_path: rel_path.to_string(),
        })
    }

    fn headers<'a>(&self, content: &'a str) -> Headers<'a> {
        let mut headers = Headers::default();
        for line in content.lines() {
            let Some(comment) = line.trim_start().strip_prefix(&self.naming.comment_prefix) else {
                continue;
            };
            let Some((key, value)) = comment.split_once(':') else {
                continue;
            };
            let value = value.trim();
            let slot = match key.trim() {
                ID_HEADER => &mut headers.statement_id,
                PARENT_HEADER => &mut headers.parent,
                KIND_HEADER => &mut headers.kind,
                _ => continue,
            };
            if slot.is_none() && !value.is_empty() {
                *slot = Some(value);
            }
        }
        headers
    }
}

/// First `keyword name` declaration in the file.
fn declaration(content: &str) -> Option<(&str, &str)> {
    content.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        let keyword = words.next()?;
        if !DECLARATION_KEYWORDS.contains(&keyword) {
            return None;
        }
        if keyword == "example" {
            return Some((keyword, UNKNOWN_TITLE));
        }
        let raw = words.next()?;
        let end = raw
            .find(|ch: char| !(ch.is_alphanumeric() || ch == '_' || ch == '.' || ch == '\''))
            .unwrap_or(raw.len());
        let name = &raw[..end];
        (!name.is_empty()).then_some((keyword, name))
    })
}

fn import_modules(content: &str) -> impl Iterator<Item = &str> {
    content.lines().flat_map(|line| {
        line.trim_start()
            .strip_prefix("import ")
            .map(|rest| rest.split_whitespace())
            .into_iter()
            .flatten()
    })
}

fn contains_word(content: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    let is_ident = |ch: char| ch.is_alphanumeric() || ch == '_';
    content.match_indices(word).any(|(start, _)| {
        let before = content[..start].chars().next_back();
        let after = content[start + word.len()..].chars().next();
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "0b6f0c2e-1d7a-4c43-9f0e-5a8d2b9c7e11";
    const PARENT: &str = "5c2d8e4f-3a1b-4f6e-8d9c-0b1a2c3d4e5f";
    const DEP: &str = "9e8d7c6b-5a4f-4e3d-8c2b-1a0f9e8d7c6b";

    fn parser() -> StatementParser {
        StatementParser::new(NamingConvention::default())
    }

    fn path_for(id: &str) -> String {
        NamingConvention::default().source_path(&StatementId::parse(id).expect("id"))
    }

    #[test]
    fn parses_headers_imports_and_declaration() {
        let content = format!(
            "-- statement_id: {ID}\n-- parent_statement_id: {PARENT}\n\nimport Mathlib\nimport «Project».statements.S_{dep}\n\ntheorem add_comm' : ∀ a b : Nat, a + b = b + a := by\n  sorry\n",
            dep = DEP.replace('-', "_")
        );
        let parsed = parser().parse(&path_for(ID), &content).expect("parse");
        assert_eq!(parsed.statement_id.as_str(), ID);
        assert_eq!(parsed.id_source, IdSource::Header);
        assert_eq!(parsed.parent_statement_id.as_ref().map(StatementId::as_str), Some(PARENT));
        assert_eq!(parsed.kind, StatementKind::Theorem);
        assert_eq!(parsed.title, "add_comm'");
        assert_eq!(
            parsed.dependencies,
            vec![StatementId::parse(DEP).expect("dep")]
        );
        assert!(parsed.has_open_marker);
    }

    #[test]
    fn falls_back_to_file_name_and_root_parent() {
        let content = "import Mathlib\n\nlemma closed : True := by\n  trivial\n";
        let parsed = parser().parse(&path_for(ID), content).expect("parse");
        assert_eq!(parsed.statement_id.as_str(), ID);
        assert_eq!(parsed.id_source, IdSource::FileName);
        assert_eq!(parsed.parent_statement_id, None);
        assert_eq!(parsed.kind, StatementKind::Lemma);
        assert!(!parsed.has_open_marker);
    }

    #[test]
    fn malformed_header_uses_file_name() {
        let content = "-- statement_id: not-an-id\n-- parent_statement_id: root\ndef f : Nat := 1\n";
        let parsed = parser().parse(&path_for(ID), content).expect("parse");
        assert_eq!(parsed.id_source, IdSource::FileName);
        assert_eq!(parsed.kind, StatementKind::Definition);
        assert_eq!(parsed.title, "f");
    }

    #[test]
    fn unrecoverable_id_is_a_parse_issue() {
        let err = parser()
            .parse("statements/notes.lean", "theorem t : True := trivial\n")
            .expect_err("no id");
        assert_eq!(
            err,
            ParseIssue::MissingStatementId {
                path: "statements/notes.lean".to_string()
            }
        );
    }

    #[test]
    fn kind_header_overrides_keyword() {
        let content = format!(
            "-- statement_id: {ID}\n-- statement_kind: corollary\ntheorem c : True := trivial\n"
        );
        let parsed = parser().parse(&path_for(ID), &content).expect("parse");
        assert_eq!(parsed.kind, StatementKind::Corollary);
    }

    #[test]
    fn open_marker_requires_word_boundary() {
        let content = format!(
            "-- statement_id: {ID}\ntheorem t : True := by\n  exact sorryAx True\n"
        );
        let parsed = parser().parse(&path_for(ID), &content).expect("parse");
        assert!(!parsed.has_open_marker);
    }

    #[test]
    fn ignores_self_imports_and_duplicates() {
        let dep_module = format!("S_{}", DEP.replace('-', "_"));
        let self_module = format!("S_{}", ID.replace('-', "_"));
        let content = format!(
            "-- statement_id: {ID}\nimport «Project».statements.{dep_module}\nimport «Project».statements.{self_module}\nimport «Project».statements.{dep_module}\nimport Other.Module\nlemma l : True := trivial\n"
        );
        let parsed = parser().parse(&path_for(ID), &content).expect("parse");
        assert_eq!(parsed.dependencies.len(), 1);
    }
}
