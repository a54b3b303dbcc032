//! Restore files from storage, and the decrypt-only path over raw stored
//! objects taken from disk.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::StorageDefinition;
use crate::constants::{
    BACKUP_FILE_EXTENSION, BACKUP_FILE_EXTENSION_ENCRYPTED, DEFAULT_MAX_SIMULTANEOUS_FILE_OPERATIONS,
    EXIT_FAILURE, EXIT_SUCCESS,
};
use crate::database::{BackupFileInformation, BackupInformationDatabase};
use crate::error::{BackupError, Result};
use crate::hasher::HasherConfig;
use crate::preamble::ObjectPreamble;
use crate::report::{log_anomalies_report, log_success_banner, log_summary, Anomaly};
use crate::retriever::{RetrieveSink, RetrieveTarget, StorageFileRetriever};
use crate::storage::StorageContainer;
use crate::util::{micros_to_system_time, path_without_leading_separator, system_time_to_micros};

/// Options for a restore run.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub dest_root: PathBuf,
    pub allow_overwrite: bool,
    /// Strip the common discovery-root prefix from restored paths.
    pub auto_path_mapping: bool,
    pub max_simultaneous_files: usize,
}

impl RestoreOptions {
    pub fn new(dest_root: impl Into<PathBuf>) -> Self {
        Self {
            dest_root: dest_root.into(),
            allow_overwrite: false,
            auto_path_mapping: true,
            max_simultaneous_files: DEFAULT_MAX_SIMULTANEOUS_FILE_OPERATIONS,
        }
    }
}

/// Counts for a restore/decrypt run.
#[derive(Debug, Default)]
pub struct RestoreOutcome {
    pub total_files: usize,
    pub successes: usize,
    pub anomalies: Vec<Anomaly>,
    pub exit_code: i32,
}

impl RestoreOutcome {
    pub fn is_all_ok(&self) -> bool {
        self.anomalies.is_empty()
    }
}

/// Writes decrypted plaintext to a destination file, sets its modified
/// time, and cleans up after failed attempts.
pub(crate) struct RestoreFileSink {
    dest_root: PathBuf,
    /// Relative destination; when `None` the preamble's path is used
    /// (decrypt-only and recovery paths).
    relative_path: Option<String>,
    allow_overwrite: bool,
    dest_path: Option<PathBuf>,
    existed_beforehand: Option<bool>,
    file: Option<tokio::fs::File>,
}

impl RestoreFileSink {
    pub(crate) fn new(
        dest_root: impl Into<PathBuf>,
        relative_path: Option<String>,
        allow_overwrite: bool,
    ) -> Self {
        Self {
            dest_root: dest_root.into(),
            relative_path,
            allow_overwrite,
            dest_path: None,
            existed_beforehand: None,
            file: None,
        }
    }

    fn close_file(&mut self) {
        self.file = None;
    }

    async fn remove_partial_output(&mut self) {
        self.close_file();
        if let (Some(path), Some(existed)) = (&self.dest_path, self.existed_beforehand) {
            // Delete only what this run created or was allowed to replace.
            if path.exists() && (self.allow_overwrite || !existed) {
                let _ = tokio::fs::remove_file(path).await;
            }
        }
    }
}

#[async_trait]
impl RetrieveSink for RestoreFileSink {
    async fn prepare(&mut self, _target: &RetrieveTarget, preamble: &ObjectPreamble) -> Result<()> {
        let relative = match &self.relative_path {
            Some(r) => r.clone(),
            None => preamble.relative_path.clone(),
        };
        let relative = sanitize_relative_path(&relative)?;
        let dest = self.dest_root.join(relative);
        if self.existed_beforehand.is_none() {
            self.existed_beforehand = Some(dest.exists());
        }
        if dest.exists() && !self.allow_overwrite {
            return Err(BackupError::RestorePathExists(dest));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.file = Some(tokio::fs::File::create(&dest).await?);
        self.dest_path = Some(dest);
        Ok(())
    }

    async fn process_chunk(&mut self, data: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            BackupError::InvalidState("restore destination file is not open".to_string())
        })?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn completed(
        &mut self,
        target: &RetrieveTarget,
        preamble: &ObjectPreamble,
    ) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
        }
        self.close_file();
        let dest = self
            .dest_path
            .clone()
            .ok_or_else(|| BackupError::InvalidState("restore destination unknown".to_string()))?;

        let modified_us = target.modified_time_us.unwrap_or(preamble.modified_time_us);
        let file = std::fs::OpenOptions::new().write(true).open(&dest)?;
        file.set_times(
            std::fs::FileTimes::new().set_modified(micros_to_system_time(modified_us)),
        )?;
        drop(file);

        // The stamped time must read back as recorded.
        let actual = system_time_to_micros(std::fs::metadata(&dest)?.modified()?);
        if actual != modified_us {
            return Err(BackupError::DateTimeMismatch {
                path: dest.display().to_string(),
                expected: modified_us,
                actual,
            });
        }
        debug!("Restored {}", dest.display());
        Ok(())
    }

    async fn attempt_failed(&mut self) {
        self.remove_partial_output().await;
    }

    async fn final_failed(&mut self) {
        self.remove_partial_output().await;
    }
}

/// Reject absolute and parent-traversal components in a restored path.
fn sanitize_relative_path(relative: &str) -> Result<PathBuf> {
    let stripped = path_without_leading_separator(relative);
    let path = Path::new(stripped);
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(BackupError::InvalidState(format!(
            "refusing restore path with parent traversal: {relative}"
        )));
    }
    if stripped.is_empty() {
        return Err(BackupError::InvalidState(
            "restored path is empty".to_string(),
        ));
    }
    Ok(path.to_path_buf())
}

/// Relative destination paths for the selected records.
///
/// With mapping off, a file keeps its full original path under the
/// destination root. With mapping on, the longest common prefix of the
/// selections' discovery roots is stripped first.
pub fn mapped_relative_paths(
    records: &[BackupFileInformation],
    auto_path_mapping: bool,
) -> Vec<String> {
    let full_relative = |path: &str| -> String {
        path_without_leading_separator(&path.replace('\\', "/")).to_string()
    };
    if !auto_path_mapping {
        return records.iter().map(|r| full_relative(&r.path)).collect();
    }

    // Unique discovery roots, reduced so nested roots collapse into their
    // shortest covering ancestor.
    let mut roots: Vec<String> = records
        .iter()
        .map(|r| full_relative(&r.discovery_root))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    roots.sort();
    let mut kept: Vec<String> = Vec::new();
    for root in roots {
        let covered = kept
            .iter()
            .any(|k| root.starts_with(&format!("{k}/")) || root == *k);
        if !covered {
            kept.push(root);
        }
    }

    let split = |s: &str| -> Vec<String> {
        s.split('/')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    };
    let kept_parts: Vec<Vec<String>> = kept.iter().map(|k| split(k)).collect();
    let strip_count = if kept_parts.len() == 1 {
        kept_parts[0].len()
    } else {
        let min_len = kept_parts.iter().map(Vec::len).min().unwrap_or(0);
        let mut common = 0;
        'outer: while common < min_len {
            let candidate = &kept_parts[0][common];
            for parts in &kept_parts[1..] {
                if &parts[common] != candidate {
                    break 'outer;
                }
            }
            common += 1;
        }
        common
    };

    records
        .iter()
        .map(|r| {
            let parts = split(&full_relative(&r.path));
            parts[strip_count.min(parts.len().saturating_sub(1))..].join("/")
        })
        .collect()
}

/// Restore the selected records into the destination root.
pub async fn restore_files(
    def: Arc<StorageDefinition>,
    db: &BackupInformationDatabase,
    container: Arc<dyn StorageContainer>,
    selections: Vec<BackupFileInformation>,
    options: &RestoreOptions,
    hasher: &HasherConfig,
) -> Result<RestoreOutcome> {
    info!("Starting restore from '{}'...", def.name());
    let relative_paths = mapped_relative_paths(&selections, options.auto_path_mapping);

    let mut outcome = RestoreOutcome {
        total_files: selections.len(),
        ..Default::default()
    };
    let semaphore = Arc::new(Semaphore::new(options.max_simultaneous_files.max(1)));
    let mut tasks = FuturesUnordered::new();
    info!("Scheduling restore jobs...");
    for (record, relative) in selections.into_iter().zip(relative_paths) {
        let target = RetrieveTarget::from_record(db, &record, Arc::clone(&container))?;
        let def = Arc::clone(&def);
        let hasher = hasher.clone();
        let semaphore = Arc::clone(&semaphore);
        let dest_root = options.dest_root.clone();
        let allow_overwrite = options.allow_overwrite;
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let retriever = StorageFileRetriever::new(&def, hasher);
            let mut sink = RestoreFileSink::new(dest_root, Some(relative), allow_overwrite);
            let result = retriever.run(&target, &mut sink).await;
            (record.path, result.map(|_| ()))
        }));
    }

    while let Some(joined) = tasks.next().await {
        match joined {
            Ok((path, Ok(()))) => {
                outcome.successes += 1;
                debug!("Restore completed for {path}");
            }
            Ok((path, Err(err))) => {
                outcome
                    .anomalies
                    .push(Anomaly::exception(Some(path), err.to_string()));
            }
            Err(join_err) => {
                outcome.anomalies.push(Anomaly {
                    kind: crate::report::AnomalyKind::UnexpectedState,
                    path: None,
                    message: format!("restore task failed: {join_err}"),
                });
            }
        }
    }

    info!("All restore file operations have completed.");
    if outcome.is_all_ok() {
        log_success_banner("restore");
    } else {
        log_anomalies_report(&outcome.anomalies);
    }
    log_summary(&[
        ("Total files", outcome.total_files.to_string()),
        ("Total errors", outcome.anomalies.len().to_string()),
        ("Total success", outcome.successes.to_string()),
    ]);
    outcome.exit_code = if outcome.is_all_ok() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    };
    Ok(outcome)
}

/// Decrypt-only mode: take stored objects from the local filesystem and
/// write their plaintext under the destination root, using the storage
/// definition's key but no history database.
pub async fn decrypt_files(
    def: Arc<StorageDefinition>,
    source_dir: &Path,
    dest_root: &Path,
    allow_overwrite: bool,
    hasher: &HasherConfig,
) -> Result<RestoreOutcome> {
    let mut stored: Vec<PathBuf> = Vec::new();
    for entry in walkdir::WalkDir::new(source_dir) {
        let entry = entry.map_err(|e| BackupError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(BACKUP_FILE_EXTENSION) || name.ends_with(BACKUP_FILE_EXTENSION_ENCRYPTED)
        {
            stored.push(entry.path().to_path_buf());
        }
    }
    if stored.is_empty() {
        return Err(BackupError::Selection(format!(
            "no {BACKUP_FILE_EXTENSION} or {BACKUP_FILE_EXTENSION_ENCRYPTED} files found under '{}'",
            source_dir.display()
        )));
    }

    let mut outcome = RestoreOutcome {
        total_files: stored.len(),
        ..Default::default()
    };
    for path in stored {
        let target = RetrieveTarget::from_stored_file(path.clone());
        let retriever = StorageFileRetriever::new(&def, hasher.clone());
        // Destination comes from the preamble's embedded relative path.
        let mut sink = RestoreFileSink::new(dest_root, None, allow_overwrite);
        match retriever.run(&target, &mut sink).await {
            Ok(_) => outcome.successes += 1,
            Err(err) => outcome.anomalies.push(Anomaly::exception(
                Some(path.display().to_string()),
                err.to_string(),
            )),
        }
    }
    outcome.exit_code = if outcome.is_all_ok() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionKind;
    use crate::database::StorageRecord;

    fn record(path: &str, root: &str) -> BackupFileInformation {
        BackupFileInformation {
            path: path.to_string(),
            discovery_root: root.to_string(),
            modified_time_us: 0,
            size_in_bytes: 1,
            primary_digest: "d".to_string(),
            storage: StorageRecord::Physical {
                object_name: "o.atbak".to_string(),
                is_encrypted: false,
                iv_hex: None,
                compression: CompressionKind::None,
                ciphertext_size: 1,
            },
            is_successful: true,
            exception_chain: Vec::new(),
            is_bitrot_detected: false,
            prior_digest_on_bitrot: None,
        }
    }

    #[test]
    fn mapping_off_keeps_full_path() {
        let records = vec![record("/a/b/c/d/e.bin", "/a/b/c")];
        let mapped = mapped_relative_paths(&records, false);
        assert_eq!(mapped, vec!["a/b/c/d/e.bin".to_string()]);
    }

    #[test]
    fn mapping_on_strips_single_discovery_root() {
        let records = vec![record("/a/b/c/d/e.bin", "/a/b/c")];
        let mapped = mapped_relative_paths(&records, true);
        assert_eq!(mapped, vec!["d/e.bin".to_string()]);
    }

    #[test]
    fn mapping_on_strips_common_prefix_of_multiple_roots() {
        let records = vec![
            record("/a/b/c/d/e.bin", "/a/b/c"),
            record("/a/b/x/f.bin", "/a/b/x"),
        ];
        let mapped = mapped_relative_paths(&records, true);
        assert_eq!(mapped, vec!["c/d/e.bin".to_string(), "x/f.bin".to_string()]);
    }

    #[test]
    fn nested_roots_collapse_to_ancestor() {
        let records = vec![
            record("/a/b/one.bin", "/a/b"),
            record("/a/b/sub/two.bin", "/a/b/sub"),
        ];
        let mapped = mapped_relative_paths(&records, true);
        assert_eq!(mapped, vec!["one.bin".to_string(), "sub/two.bin".to_string()]);
    }

    #[test]
    fn parent_traversal_is_rejected() {
        assert!(sanitize_relative_path("../escape").is_err());
        assert!(sanitize_relative_path("/abs/ok").is_ok());
        assert!(sanitize_relative_path("plain/ok.txt").is_ok());
        assert!(sanitize_relative_path("").is_err());
    }
}
