//! Resolving user specifiers (`storage:<name> backup:<tag> files:<glob>`)
//! into concrete sets of file records from the history database.

use glob::Pattern;

use crate::config::parse_storage_def_specifier;
use crate::database::{BackupFileInformation, BackupInformationDatabase, SpecificBackup};
use crate::error::{BackupError, Result};

/// A parsed selection specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionSpec {
    pub storage_def_name: String,
    /// `last` or a full specific-backup name.
    pub backup_tag: String,
    /// Glob patterns matched against paths relative to the discovery root.
    pub file_patterns: Vec<String>,
}

/// Parse a sequence of specifier tokens.
///
/// Tokens group per storage definition: each `storage:<name>` opens a new
/// selection; `backup:<tag>` and `files:<glob>` refine the current one.
/// Missing parts default to `backup:last` and `files:*`.
pub fn parse_specifiers(tokens: &[String]) -> Result<Vec<SelectionSpec>> {
    let mut specs: Vec<SelectionSpec> = Vec::new();
    for token in tokens {
        if let Some(name) = parse_storage_def_specifier(token) {
            specs.push(SelectionSpec {
                storage_def_name: name,
                backup_tag: "last".to_string(),
                file_patterns: Vec::new(),
            });
            continue;
        }
        let current = specs.last_mut().ok_or_else(|| {
            BackupError::Selection(format!(
                "'{token}' must follow a storage:<name> specifier"
            ))
        })?;
        if let Some(tag) = token.strip_prefix("backup:") {
            current.backup_tag = tag.to_string();
        } else if let Some(pattern) = token.strip_prefix("files:") {
            current.file_patterns.push(pattern.to_string());
        } else {
            return Err(BackupError::Selection(format!(
                "unrecognized specifier '{token}'"
            )));
        }
    }
    Ok(specs)
}

/// Resolve the specific backup a tag names. `last` is the newest.
pub fn resolve_backup_tag<'a>(
    db: &'a BackupInformationDatabase,
    tag: &str,
) -> Result<&'a SpecificBackup> {
    if tag == "last" {
        return db
            .newest_backup()
            .ok_or_else(|| BackupError::Selection("the database has no backups".to_string()));
    }
    db.backup_by_name(tag)
        .ok_or_else(|| BackupError::Selection(format!("no specific backup named '{tag}'")))
}

/// Select the records of one specific backup matching the file patterns.
///
/// Patterns match against the path relative to its discovery root; no
/// patterns means everything. Only successful records are selected.
pub fn select_files(
    db: &BackupInformationDatabase,
    spec: &SelectionSpec,
) -> Result<Vec<BackupFileInformation>> {
    let backup = resolve_backup_tag(db, &spec.backup_tag)?;
    let patterns = spec
        .file_patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| BackupError::Selection(format!("bad pattern '{p}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut selected = Vec::new();
    for record in backup.file_records.values() {
        if !record.is_successful {
            continue;
        }
        let relative = record.path_without_root();
        let matched = patterns.is_empty()
            || patterns
                .iter()
                .any(|p| p.matches(&relative) || p.matches(&record.path));
        if matched {
            selected.push(record.clone());
        }
    }
    if selected.is_empty() {
        return Err(BackupError::Selection(format!(
            "no files selected from backup '{}'",
            backup.backup_name
        )));
    }
    Ok(selected)
}
