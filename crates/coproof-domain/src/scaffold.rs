//! Statement file scaffolding and the aggregate entry-point file.

use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::statement::{
    InvalidStatementId, NamingConvention, StatementId, StatementKind, StatementPaths,
    ROOT_SENTINEL,
};

#[derive(Debug, thiserror::Error)]
pub enum ScaffoldError {
    #[error("invalid {field}: {source}")]
    InvalidId {
        field: String,
        #[source]
        source: InvalidStatementId,
    },
    #[error("invalid statement name '{0}': must be a valid symbol")]
    InvalidName(String),
    #[error("statement signature cannot be blank")]
    BlankSignature,
    #[error("cannot write {entry}: missing statement files {}", format_missing(.missing))]
    MissingStatementFiles {
        entry: String,
        missing: Vec<MissingStatementFile>,
    },
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn format_missing(missing: &[MissingStatementFile]) -> String {
    missing
        .iter()
        .map(|file| format!("{} (id {})", file.path, file.statement_id))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingStatementFile {
    pub statement_id: StatementId,
    pub path: String,
}

/// Raw user-supplied fields for a new statement. Ids stay strings until
/// validated by [`render_statement`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScaffoldRequest {
    pub statement_id: String,
    pub parent_statement_id: Option<String>,
    pub kind: StatementKind,
    pub name: String,
    pub signature: String,
    #[serde(default)]
    pub proof_body: Option<String>,
    #[serde(default)]
    pub dependency_ids: Vec<String>,
    #[serde(default)]
    pub companion: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedStatement {
    pub statement_id: StatementId,
    pub parent_statement_id: Option<StatementId>,
    pub dependencies: Vec<StatementId>,
    pub paths: StatementPaths,
    pub source: String,
    pub companion: Option<String>,
}

fn validate_id(field: &str, raw: &str) -> Result<StatementId, ScaffoldError> {
    StatementId::parse(raw).map_err(|source| ScaffoldError::InvalidId {
        field: field.to_string(),
        source,
    })
}

fn is_symbol(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_alphanumeric() || ch == '_' || ch == '\'')
}

/// Validates a request and renders the statement source. Nothing is written.
pub fn render_statement(
    request: &ScaffoldRequest,
    naming: &NamingConvention,
) -> Result<RenderedStatement, ScaffoldError> {
    let statement_id = validate_id("statement_id", &request.statement_id)?;
    let parent_statement_id = match request.parent_statement_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) if raw.eq_ignore_ascii_case(ROOT_SENTINEL) => None,
        Some(raw) => Some(validate_id("parent_statement_id", raw)?),
    };
    let mut dependencies = Vec::with_capacity(request.dependency_ids.len());
    for raw in &request.dependency_ids {
        let dep = validate_id(&format!("dependency {raw}"), raw)?;
        if !dependencies.contains(&dep) {
            dependencies.push(dep);
        }
    }
    if !is_symbol(&request.name) {
        return Err(ScaffoldError::InvalidName(request.name.clone()));
    }
    if request.signature.trim().is_empty() {
        return Err(ScaffoldError::BlankSignature);
    }

    let comment = &naming.comment_prefix;
    let mut source = String::new();
    let _ = writeln!(source, "{comment} statement_id: {statement_id}");
    let parent = parent_statement_id
        .as_ref()
        .map_or(ROOT_SENTINEL, StatementId::as_str);
    let _ = writeln!(source, "{comment} parent_statement_id: {parent}");
    let _ = writeln!(source, "{comment} statement_kind: {}", request.kind);
    source.push('\n');
    for base in &naming.base_imports {
        let _ = writeln!(source, "import {base}");
    }
    for dep in &dependencies {
        let _ = writeln!(source, "import {}", naming.import_path(dep));
    }
    source.push('\n');
    let body = request
        .proof_body
        .as_deref()
        .map(str::trim)
        .filter(|body| !body.is_empty())
        .unwrap_or(naming.open_marker.as_str());
    let keyword = request.kind.keyword();
    // `example` declarations are anonymous.
    let head = if request.kind == StatementKind::Evaluation {
        keyword.to_string()
    } else {
        format!("{keyword} {}", request.name)
    };
    let _ = write!(
        source,
        "{head} : {} := by\n  {body}\n",
        request.signature.trim()
    );

    Ok(RenderedStatement {
        paths: naming.paths(&statement_id),
        statement_id,
        parent_statement_id,
        dependencies,
        source,
        companion: request.companion.clone(),
    })
}

fn write_error(path: &Path) -> impl FnOnce(io::Error) -> ScaffoldError {
    let path = path.to_path_buf();
    move |source| ScaffoldError::Io { path, source }
}

/// Entry-point content importing `ordered` in the given order.
pub fn render_entry_point(ordered: &[StatementId], naming: &NamingConvention) -> String {
    let comment = &naming.comment_prefix;
    let mut out = format!("{comment} Auto-generated by CoProof\n{comment} Do not edit: regenerated from the statement graph\n\n");
    for id in ordered {
        let _ = writeln!(out, "import {}", naming.import_path(id));
    }
    out
}

/// Writes the entry-point file into `root` after checking every referenced
/// statement file exists. Either the whole file is written or nothing is.
pub fn write_entry_point(
    root: &Path,
    ordered: &[StatementId],
    naming: &NamingConvention,
) -> Result<PathBuf, ScaffoldError> {
    let missing: Vec<MissingStatementFile> = ordered
        .iter()
        .filter_map(|id| {
            let path = naming.source_path(id);
            (!root.join(&path).is_file()).then(|| MissingStatementFile {
                statement_id: id.clone(),
                path,
            })
        })
        .collect();
    if !missing.is_empty() {
        return Err(ScaffoldError::MissingStatementFiles {
            entry: naming.entry_file.clone(),
            missing,
        });
    }

    let target = root.join(&naming.entry_file);
    let tmp = root.join(format!(".{}.tmp", naming.entry_file));
    let content = render_entry_point(ordered, naming);
    {
        let mut file = fs::File::create(&tmp).map_err(write_error(&tmp))?;
        file.write_all(content.as_bytes()).map_err(write_error(&tmp))?;
        file.sync_all().map_err(write_error(&tmp))?;
    }
    if let Err(err) = fs::rename(&tmp, &target) {
        let _ = fs::remove_file(&tmp);
        return Err(ScaffoldError::Io {
            path: target,
            source: err,
        });
    }
    Ok(target)
}
