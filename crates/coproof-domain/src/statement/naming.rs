use serde::{Deserialize, Serialize};

use super::StatementId;

/// Project convention that maps statement ids to files, modules and imports.
///
/// Every piece of the id-in-module-name encoding lives here so the parser and
/// the scaffold never hard-code one naming scheme.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingConvention {
    pub statements_dir: String,
    pub module_prefix: String,
    /// Character the id separator (`-`) is rewritten to inside module names.
    pub module_separator: char,
    pub package_name: String,
    pub source_extension: String,
    pub companion_extension: String,
    pub entry_file: String,
    pub base_imports: Vec<String>,
    pub open_marker: String,
    pub comment_prefix: String,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self {
            statements_dir: "statements".to_string(),
            module_prefix: "S_".to_string(),
            module_separator: '_',
            package_name: "Project".to_string(),
            source_extension: "lean".to_string(),
            companion_extension: "tex".to_string(),
            entry_file: "Main.lean".to_string(),
            base_imports: vec!["Mathlib".to_string()],
            open_marker: "sorry".to_string(),
            comment_prefix: "--".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementPaths {
    pub source: String,
    pub companion: String,
}

impl NamingConvention {
    pub fn module_name(&self, id: &StatementId) -> String {
        let encoded: String = id
            .as_str()
            .chars()
            .map(|ch| if ch == '-' { self.module_separator } else { ch })
            .collect();
        format!("{}{encoded}", self.module_prefix)
    }

    /// Recovers the id encoded in a module name; `None` when the name does not
    /// follow the convention.
    pub fn id_from_module(&self, module: &str) -> Option<StatementId> {
        let encoded = module.strip_prefix(&self.module_prefix)?;
        let decoded: String = encoded
            .chars()
            .map(|ch| if ch == self.module_separator { '-' } else { ch })
            .collect();
        StatementId::parse(&decoded).ok()
    }

    pub fn paths(&self, id: &StatementId) -> StatementPaths {
        let module = self.module_name(id);
        StatementPaths {
            source: format!(
                "{}/{module}.{}",
                self.statements_dir, self.source_extension
            ),
            companion: format!(
                "{}/{module}.{}",
                self.statements_dir, self.companion_extension
            ),
        }
    }

    pub fn source_path(&self, id: &StatementId) -> String {
        self.paths(id).source
    }

    pub fn import_path(&self, id: &StatementId) -> String {
        format!(
            "«{}».{}.{}",
            self.package_name,
            self.statements_dir.replace('/', "."),
            self.module_name(id)
        )
    }

    /// True for files directly inside the statements directory with the
    /// source extension.
    pub fn is_statement_path(&self, rel_path: &str) -> bool {
        let Some(rest) = rel_path
            .strip_prefix(&self.statements_dir)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return false;
        };
        !rest.contains('/')
            && rest
                .rsplit_once('.')
                .is_some_and(|(stem, ext)| !stem.is_empty() && ext == self.source_extension)
    }

    /// Id derived from a statement file's own name.
    pub fn id_from_path(&self, rel_path: &str) -> Option<StatementId> {
        let file_name = rel_path.rsplit('/').next()?;
        let stem = file_name
            .strip_suffix(&self.source_extension)
            .and_then(|stem| stem.strip_suffix('.'))?;
        self.id_from_module(stem)
    }

    /// Id referenced by an import of a module path such as
    /// `«Project».statements.S_<id>`.
    pub fn id_from_import(&self, module_path: &str) -> Option<StatementId> {
        let last = module_path.trim().rsplit('.').next()?;
        self.id_from_module(last.trim_matches(|ch| ch == '«' || ch == '»'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "8d0b4c3e-7a52-4e59-9a43-1f2d3c4b5a69";

    #[test]
    fn module_name_round_trips_through_paths() {
        let naming = NamingConvention::default();
        let id = StatementId::parse(ID).expect("id");
        let paths = naming.paths(&id);
        assert_eq!(
            paths.source,
            "statements/S_8d0b4c3e_7a52_4e59_9a43_1f2d3c4b5a69.lean"
        );
        assert_eq!(
            paths.companion,
            "statements/S_8d0b4c3e_7a52_4e59_9a43_1f2d3c4b5a69.tex"
        );
        assert_eq!(naming.id_from_path(&paths.source), Some(id.clone()));
        assert_eq!(
            naming.import_path(&id),
            "«Project».statements.S_8d0b4c3e_7a52_4e59_9a43_1f2d3c4b5a69"
        );
        assert_eq!(naming.id_from_import(&naming.import_path(&id)), Some(id));
    }

    #[test]
    fn custom_prefix_is_honored() {
        let naming = NamingConvention {
            module_prefix: "Stmt".to_string(),
            statements_dir: "proofs/nodes".to_string(),
            ..NamingConvention::default()
        };
        let id = StatementId::parse(ID).expect("id");
        assert_eq!(
            naming.import_path(&id),
            "«Project».proofs.nodes.Stmt8d0b4c3e_7a52_4e59_9a43_1f2d3c4b5a69"
        );
        assert_eq!(naming.id_from_module("S_8d0b4c3e_7a52_4e59_9a43_1f2d3c4b5a69"), None);
        assert!(naming.is_statement_path(&naming.source_path(&id)));
    }

    #[test]
    fn statement_paths_are_direct_children_only() {
        let naming = NamingConvention::default();
        assert!(naming.is_statement_path("statements/S_x.lean"));
        assert!(!naming.is_statement_path("statements/nested/S_x.lean"));
        assert!(!naming.is_statement_path("statements/S_x.tex"));
        assert!(!naming.is_statement_path("Main.lean"));
        assert!(!naming.is_statement_path("statementsX/S_x.lean"));
    }
}
