//! Verify stored objects against their recorded digests and sizes, with an
//! optional byte-for-byte compare against local files.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::StorageDefinition;
use crate::constants::{DEFAULT_MAX_SIMULTANEOUS_FILE_OPERATIONS, EXIT_FAILURE, EXIT_SUCCESS};
use crate::database::{BackupFileInformation, BackupInformationDatabase};
use crate::error::{BackupError, Result};
use crate::hasher::HasherConfig;
use crate::preamble::ObjectPreamble;
use crate::report::{log_anomalies_report, log_success_banner, log_summary, Anomaly};
use crate::retriever::{RetrieveSink, RetrieveTarget, StorageFileRetriever};
use crate::storage::StorageContainer;

/// Options for a verify run.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Compare decrypted bytes against local files.
    pub compare: bool,
    /// Root to compare under; `None` compares against the original backup
    /// paths.
    pub compare_root: Option<PathBuf>,
    pub max_simultaneous_files: usize,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            compare: false,
            compare_root: None,
            max_simultaneous_files: DEFAULT_MAX_SIMULTANEOUS_FILE_OPERATIONS,
        }
    }
}

/// Counts for a verify run.
#[derive(Debug, Default)]
pub struct VerifyOutcome {
    pub total_files: usize,
    pub successes: usize,
    pub anomalies: Vec<Anomaly>,
    pub exit_code: i32,
}

impl VerifyOutcome {
    pub fn is_all_ok(&self) -> bool {
        self.anomalies.is_empty()
    }
}

/// Discards or compares the decrypted stream; digest and size checks happen
/// in the retriever.
struct VerifyFileSink {
    compare_path: Option<PathBuf>,
    expected_size: u64,
    file: Option<tokio::fs::File>,
    compared_bytes: u64,
}

#[async_trait]
impl RetrieveSink for VerifyFileSink {
    async fn prepare(&mut self, _target: &RetrieveTarget, _preamble: &ObjectPreamble) -> Result<()> {
        if let Some(path) = &self.compare_path {
            if !path.is_file() {
                return Err(BackupError::VerifyFilePathNotFound(path.clone()));
            }
            self.file = Some(tokio::fs::File::open(path).await?);
        }
        Ok(())
    }

    async fn process_chunk(&mut self, data: &[u8]) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let mut local = vec![0u8; data.len()];
        let mut filled = 0usize;
        while filled < local.len() {
            let n = file.read(&mut local[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if &local[..filled] != data {
            return Err(BackupError::CompareBytesMismatch {
                path: self
                    .compare_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                compared: self.compared_bytes + filled as u64,
                expected: self.expected_size,
            });
        }
        self.compared_bytes += data.len() as u64;
        Ok(())
    }

    async fn completed(
        &mut self,
        _target: &RetrieveTarget,
        _preamble: &ObjectPreamble,
    ) -> Result<()> {
        self.file = None;
        if let Some(path) = &self.compare_path {
            if self.compared_bytes != self.expected_size {
                return Err(BackupError::CompareBytesMismatch {
                    path: path.display().to_string(),
                    compared: self.compared_bytes,
                    expected: self.expected_size,
                });
            }
        }
        Ok(())
    }

    async fn attempt_failed(&mut self) {
        self.file = None;
        self.compared_bytes = 0;
    }

    async fn final_failed(&mut self) {
        self.file = None;
    }
}

/// Verify the selected records.
pub async fn verify_files(
    def: Arc<StorageDefinition>,
    db: &BackupInformationDatabase,
    container: Arc<dyn StorageContainer>,
    selections: Vec<BackupFileInformation>,
    options: &VerifyOptions,
    hasher: &HasherConfig,
) -> Result<VerifyOutcome> {
    info!("Starting verify from '{}'...", def.name());
    let mut outcome = VerifyOutcome {
        total_files: selections.len(),
        ..Default::default()
    };
    let semaphore = Arc::new(Semaphore::new(options.max_simultaneous_files.max(1)));
    let mut tasks = FuturesUnordered::new();
    info!("Scheduling verification jobs...");
    for record in selections {
        let target = RetrieveTarget::from_record(db, &record, Arc::clone(&container))?;
        let compare_path = if options.compare {
            Some(match &options.compare_root {
                Some(root) => root.join(record.path_without_root()),
                None => PathBuf::from(&record.path),
            })
        } else {
            None
        };
        let def = Arc::clone(&def);
        let hasher = hasher.clone();
        let semaphore = Arc::clone(&semaphore);
        let expected_size = record.size_in_bytes;
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let retriever = StorageFileRetriever::new(&def, hasher);
            let mut sink = VerifyFileSink {
                compare_path,
                expected_size,
                file: None,
                compared_bytes: 0,
            };
            let result = retriever.run(&target, &mut sink).await;
            (record.path, result.map(|_| ()))
        }));
    }

    while let Some(joined) = tasks.next().await {
        match joined {
            Ok((path, Ok(()))) => {
                outcome.successes += 1;
                debug!("Verify completed for {path}");
            }
            Ok((path, Err(err))) => outcome
                .anomalies
                .push(Anomaly::exception(Some(path), err.to_string())),
            Err(join_err) => outcome.anomalies.push(Anomaly {
                kind: crate::report::AnomalyKind::VerifyFailure,
                path: None,
                message: format!("verify task failed: {join_err}"),
            }),
        }
    }

    info!("All file verify operations have completed.");
    if outcome.is_all_ok() {
        log_success_banner("verify");
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
