//! The backup driver: discovers source files, classifies each against the
//! history database, streams uploads through the pipeline, and writes the
//! updated database.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use coffer_crypto::{aes_cbc, AesCbcEncryptor};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use glob::Pattern;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunk_reader::ChunkReader;
use crate::classifier::{Classification, Classifier, DedupMode};
use crate::compression::{compressing_reader, CompressionKind, CompressionSettings};
use crate::config::{InterfaceKind, StorageDefinition};
use crate::constants::{
    BACKUP_FILE_EXTENSION, BACKUP_FILE_EXTENSION_ENCRYPTED, EXIT_DRYRUN_SUCCESS, EXIT_FAILURE,
    EXIT_SUCCESS,
};
use crate::database::{
    BackupFileInformation, BackupInformationDatabase, BackupType, StorageRecord,
};
use crate::error::{BackupError, Result, StorageError};
use crate::hasher::{digest_file, HasherConfig};
use crate::pipeline::{PipelineItem, PipelineStage, StagePipe, WorkPipeline};
use crate::preamble::ObjectPreamble;
use crate::report::{log_anomalies_report, log_success_banner, log_summary, Anomaly};
use crate::storage::{BytesChunkStream, ChunkStream, StorageContainer};
use crate::util::system_time_to_micros;

/// One file found under a source root.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub discovery_root: PathBuf,
    pub modified_time_us: i64,
    pub size_in_bytes: u64,
}

/// Enumerate regular files under the source roots, applying exclude globs.
pub fn discover_files(sources: &[PathBuf], excludes: &[String]) -> Result<Vec<DiscoveredFile>> {
    let patterns = excludes
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| BackupError::Configuration(format!("bad exclude pattern '{p}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut out = Vec::new();
    for source in sources {
        let root = source
            .canonicalize()
            .map_err(|e| BackupError::Configuration(format!("source '{}': {e}", source.display())))?;
        if !root.is_dir() {
            return Err(BackupError::Configuration(format!(
                "source '{}' is not a directory",
                root.display()
            )));
        }
        for entry in WalkDir::new(&root) {
            let entry = entry.map_err(|e| BackupError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if patterns.iter().any(|p| p.matches_path(path)) {
                debug!("Excluded by pattern: {}", path.display());
                continue;
            }
            let meta = entry.metadata().map_err(|e| BackupError::Io(e.into()))?;
            let modified = meta.modified()?;
            out.push(DiscoveredFile {
                path: path.to_path_buf(),
                discovery_root: root.clone(),
                modified_time_us: system_time_to_micros(modified),
                size_in_bytes: meta.len(),
            });
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

/// Options for one backup run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub backup_type: BackupType,
    pub dedup: DedupMode,
    /// When false, bitrot findings are informational only.
    pub detect_bitrot: bool,
    pub dry_run: bool,
    pub exclude_patterns: Vec<String>,
    pub compression_override: Option<CompressionSettings>,
    pub max_simultaneous_files: usize,
}

impl BackupOptions {
    pub fn new(backup_type: BackupType) -> Self {
        Self {
            backup_type,
            dedup: DedupMode::None,
            detect_bitrot: true,
            dry_run: false,
            exclude_patterns: Vec::new(),
            compression_override: None,
            max_simultaneous_files: crate::constants::DEFAULT_MAX_SIMULTANEOUS_FILE_OPERATIONS,
        }
    }
}

/// Counts and anomalies for one backup run.
#[derive(Debug, Default)]
pub struct BackupOutcome {
    pub total_files: usize,
    pub unchanged: usize,
    pub duplicates: usize,
    pub uploads: usize,
    pub successes: usize,
    pub bitrot_warnings: usize,
    pub bitrot_informational: usize,
    pub anomalies: Vec<Anomaly>,
    pub exit_code: i32,
}

impl BackupOutcome {
    pub fn is_all_ok(&self) -> bool {
        self.anomalies.is_empty()
    }
}

/// Work item state carried through the pipeline stages.
#[derive(Clone)]
pub struct BackupWorkItem {
    file: DiscoveredFile,
    digest: Option<String>,
    classification: Option<Classification>,
    object_name: Option<String>,
    compression: CompressionKind,
    iv: Option<[u8; 16]>,
    ciphertext_size: u64,
    uploaded_size: u64,
    gate_claimed: bool,
    errors: Vec<String>,
}

impl BackupWorkItem {
    fn new(file: DiscoveredFile) -> Self {
        Self {
            file,
            digest: None,
            classification: None,
            object_name: None,
            compression: CompressionKind::None,
            iv: None,
            ciphertext_size: 0,
            uploaded_size: 0,
            gate_claimed: false,
            errors: Vec::new(),
        }
    }

    fn is_upload(&self) -> bool {
        self.classification
            .as_ref()
            .map(Classification::is_upload)
            .unwrap_or(false)
    }
}

impl PipelineItem for BackupWorkItem {
    fn record_error(&mut self, error: BackupError) {
        self.errors.push(error.to_string());
    }

    fn is_failed(&self) -> bool {
        !self.errors.is_empty()
    }

    fn absorb(&mut self, producer: Self) {
        self.errors.extend(producer.errors);
        if producer.iv.is_some() {
            self.iv = producer.iv;
        }
        if producer.ciphertext_size > 0 {
            self.ciphertext_size = producer.ciphertext_size;
        }
        self.compression = producer.compression;
    }
}

/// First-writer-wins gate keyed by digest: at most one physical upload per
/// digest per run; later same-digest items wait for the winner to finish.
struct DigestGate {
    inner: DashMap<String, Arc<Notify>>,
}

enum GateClaim {
    Owner,
    Waiter(Arc<Notify>),
}

impl DigestGate {
    fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    fn claim(&self, digest: &str) -> GateClaim {
        use dashmap::mapref::entry::Entry;
        match self.inner.entry(digest.to_string()) {
            Entry::Occupied(occupied) => GateClaim::Waiter(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Notify::new()));
                GateClaim::Owner
            }
        }
    }

    fn contains(&self, digest: &str) -> bool {
        self.inner.contains_key(digest)
    }

    fn release(&self, digest: &str) {
        if let Some((_, notify)) = self.inner.remove(digest) {
            notify.notify_waiters();
        }
    }
}

/// State shared by all pipeline stages of one run.
struct StageShared {
    def: Arc<StorageDefinition>,
    db: Arc<Mutex<BackupInformationDatabase>>,
    /// Absent during a dry run, which never touches the container.
    container: Option<Arc<dyn StorageContainer>>,
    classifier: Classifier,
    gate: Arc<DigestGate>,
    hasher: HasherConfig,
    compression: CompressionSettings,
    dry_run: bool,
}

impl StageShared {
    fn object_name_for_upload(&self) -> String {
        let extension = if self.def.is_encryption_used() {
            BACKUP_FILE_EXTENSION_ENCRYPTED
        } else {
            BACKUP_FILE_EXTENSION
        };
        format!("{}{}", Uuid::new_v4().simple(), extension)
    }
}

/// S1: compute the digest as needed, classify, and claim the digest gate
/// for uploads.
struct ClassifyStage {
    shared: Arc<StageShared>,
}

impl ClassifyStage {
    async fn compute_digest(&self, item: &BackupWorkItem) -> Result<String> {
        let path = item.file.path.clone();
        let hasher = self.shared.hasher.clone();
        tokio::task::spawn_blocking(move || digest_file(&hasher, &path))
            .await
            .map_err(|e| BackupError::InvalidState(format!("hash task failed: {e}")))?
    }

    fn log_bitrot(&self, item: &BackupWorkItem, classification: &Classification) {
        if let Some(finding) = classification.bitrot() {
            if finding.squelched {
                info!(
                    "Potential bitrot (informational): {} has a changed digest with unchanged \
                     mtime and size (prior digest {})",
                    item.file.path.display(),
                    finding.prior_digest
                );
            } else {
                warn!(
                    "WARNING: potential bitrot: {} has a changed digest with unchanged mtime \
                     and size (prior digest {})",
                    item.file.path.display(),
                    finding.prior_digest
                );
            }
        }
    }
}

#[async_trait]
impl PipelineStage<BackupWorkItem> for ClassifyStage {
    fn name(&self) -> &'static str {
        "classify"
    }

    fn is_for_stage(&self, _item: &BackupWorkItem) -> bool {
        true
    }

    async fn run(&self, mut item: BackupWorkItem, _pipe: Option<StagePipe>) -> BackupWorkItem {
        let classifier = &self.shared.classifier;
        // Incremental-plus always compares digests; every other type only
        // needs a pre-computed digest when deduplication is on.
        let needs_pre_digest = classifier.backup_type == BackupType::IncrementalPlus
            || classifier.dedup != DedupMode::None;
        if needs_pre_digest && item.digest.is_none() {
            match self.compute_digest(&item).await {
                Ok(digest) => item.digest = Some(digest),
                Err(e) => {
                    item.record_error(e);
                    return item;
                }
            }
        }

        loop {
            let path_str = item.file.path.to_string_lossy().to_string();
            let extension = item
                .file
                .path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            let facts = crate::classifier::SourceFileFacts {
                path: &path_str,
                modified_time_us: item.file.modified_time_us,
                size_in_bytes: item.file.size_in_bytes,
                primary_digest: item.digest.as_deref().unwrap_or(""),
                extension_lowercase: &extension,
            };
            let classification = {
                let db = self.shared.db.lock().await;
                classifier.classify(&facts, &db)
            };

            if !classification.is_upload() {
                self.log_bitrot(&item, &classification);
                item.classification = Some(classification);
                return item;
            }

            // Upload path: the digest is part of the record and the gate key.
            if item.digest.is_none() {
                match self.compute_digest(&item).await {
                    Ok(digest) => item.digest = Some(digest),
                    Err(e) => {
                        item.record_error(e);
                        return item;
                    }
                }
            }
            let digest = item.digest.clone().unwrap_or_default();
            match self.shared.gate.claim(&digest) {
                GateClaim::Owner => {
                    self.log_bitrot(&item, &classification);
                    item.gate_claimed = true;
                    item.classification = Some(classification);
                    item.object_name = Some(self.shared.object_name_for_upload());
                    item.compression = self.shared.compression.kind;
                    return item;
                }
                GateClaim::Waiter(notify) => {
                    // Wait for the current claimant to finish, then re-run
                    // classification against the updated history.
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if !self.shared.gate.contains(&digest) {
                        continue;
                    }
                    notified.await;
                }
            }
        }
    }
}

/// S2 (paired producer): read, compress, encrypt, and push the object
/// bytes, preamble first, into the byte pipe.
struct ReadStage {
    shared: Arc<StageShared>,
}

#[async_trait]
impl PipelineStage<BackupWorkItem> for ReadStage {
    fn name(&self) -> &'static str {
        "read"
    }

    fn is_for_stage(&self, item: &BackupWorkItem) -> bool {
        item.is_upload()
    }

    fn pipes_with_next(&self) -> bool {
        true
    }

    async fn run(&self, item: BackupWorkItem, pipe: Option<StagePipe>) -> BackupWorkItem {
        let Some(StagePipe::Writer(mut writer)) = pipe else {
            let mut item = item;
            item.record_error(BackupError::Pipeline("read stage requires a pipe writer".to_string()));
            return item;
        };
        let fallback = item.clone();
        let shared = Arc::clone(&self.shared);
        let task = tokio::task::spawn_blocking(move || {
            let mut item = item;
            let result = (|| -> Result<()> {
                let encryptor = if shared.def.is_encryption_used() {
                    let iv = aes_cbc::random_iv();
                    item.iv = Some(iv);
                    Some(AesCbcEncryptor::new(shared.def.encryption_key()?, &iv)?)
                } else {
                    None
                };
                let inline_iv = if shared.def.persist_iv_in_object() {
                    item.iv
                } else {
                    None
                };
                let digest = item.digest.clone().ok_or_else(|| {
                    BackupError::InvalidState("upload item has no digest".to_string())
                })?;
                let relative = item
                    .file
                    .path
                    .strip_prefix(&item.file.discovery_root)
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_else(|_| item.file.path.to_string_lossy().to_string());
                let preamble = ObjectPreamble::new(
                    shared.def.is_encryption_used(),
                    inline_iv,
                    item.compression,
                    relative,
                    item.file.modified_time_us,
                    item.file.size_in_bytes,
                    digest,
                );
                let preamble_bytes = preamble.encode()?;

                let file = std::fs::File::open(&item.file.path)?;
                let settings = CompressionSettings {
                    kind: item.compression,
                    level: shared.compression.level,
                };
                let source = compressing_reader(settings, Box::new(file))?;
                let mut reader = ChunkReader::new(
                    source,
                    shared.def.upload_chunk_size(),
                    encryptor,
                    item.file.path.display().to_string(),
                )?;
                reader.queue_cleartext(&preamble_bytes)?;

                let mut total = 0u64;
                loop {
                    let chunk = reader.read_chunk()?;
                    if chunk.is_empty() {
                        writer.blocking_write_final(Bytes::new())?;
                        break;
                    }
                    total += chunk.len() as u64;
                    writer.blocking_write(chunk)?;
                }
                item.ciphertext_size = total.saturating_sub(preamble_bytes.len() as u64);
                Ok(())
            })();
            if let Err(e) = result {
                item.record_error(e);
            }
            item
        });
        match task.await {
            Ok(item) => item,
            Err(join_err) => {
                let mut item = fallback;
                item.record_error(BackupError::Pipeline(format!(
                    "read stage task failed: {join_err}"
                )));
                item
            }
        }
    }
}

/// Adapts the pipe reader to the storage `ChunkStream` contract.
struct PipeChunkSource {
    reader: crate::pipeline::PipeReader,
}

#[async_trait]
impl ChunkStream for PipeChunkSource {
    async fn next_chunk(&mut self) -> std::result::Result<Bytes, StorageError> {
        self.reader
            .read()
            .await
            .map_err(|e| StorageError::UploadFailed(format!("pipe read failed: {e}")))
    }
}

/// S3 (paired consumer): drain the pipe into the object store.
struct UploadStage {
    shared: Arc<StageShared>,
}

#[async_trait]
impl PipelineStage<BackupWorkItem> for UploadStage {
    fn name(&self) -> &'static str {
        "upload"
    }

    fn is_for_stage(&self, item: &BackupWorkItem) -> bool {
        item.is_upload()
    }

    async fn run(&self, mut item: BackupWorkItem, pipe: Option<StagePipe>) -> BackupWorkItem {
        let Some(StagePipe::Reader(reader)) = pipe else {
            item.record_error(BackupError::Pipeline("upload stage requires a pipe reader".to_string()));
            return item;
        };
        let Some(object_name) = item.object_name.clone() else {
            item.record_error(BackupError::InvalidState("upload item has no object name".to_string()));
            return item;
        };
        let Some(container) = self.shared.container.clone() else {
            item.record_error(BackupError::InvalidState("upload stage has no container".to_string()));
            return item;
        };
        let mut source = PipeChunkSource { reader };
        match container.put_object(&object_name, &mut source).await {
            Ok(summary) => {
                item.uploaded_size = summary.size;
                debug!(
                    "Uploaded {} as {} ({} bytes)",
                    item.file.path.display(),
                    object_name,
                    summary.size
                );
            }
            Err(e) => {
                item.record_error(e.into());
                // Best effort: do not leave a partial object behind.
                let _ = container.delete_object(&object_name).await;
            }
        }
        item
    }
}

/// Stand-in for S2/S3 during a dry run: log the decision, touch nothing.
struct DryRunStage;

#[async_trait]
impl PipelineStage<BackupWorkItem> for DryRunStage {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn is_for_stage(&self, item: &BackupWorkItem) -> bool {
        item.is_upload()
    }

    async fn run(&self, item: BackupWorkItem, _pipe: Option<StagePipe>) -> BackupWorkItem {
        info!(
            "(dry run) would back up {} ({} bytes)",
            item.file.path.display(),
            item.file.size_in_bytes
        );
        item
    }
}

/// S4: turn the item into a history record, insert it, release the gate.
struct FinalizeStage {
    shared: Arc<StageShared>,
}

#[async_trait]
impl PipelineStage<BackupWorkItem> for FinalizeStage {
    fn name(&self) -> &'static str {
        "finalize"
    }

    fn is_for_stage(&self, _item: &BackupWorkItem) -> bool {
        true
    }

    async fn run(&self, item: BackupWorkItem, _pipe: Option<StagePipe>) -> BackupWorkItem {
        let mut item = item;
        if !self.shared.dry_run {
            let record = build_record(&self.shared.def, &item, true);
            let mut db = self.shared.db.lock().await;
            if let Err(e) = db.add_record(record) {
                item.record_error(e);
            }
        }
        if item.gate_claimed {
            if let Some(digest) = &item.digest {
                self.shared.gate.release(digest);
            }
        }
        item
    }
}

/// Build the history record for a completed (or failed) work item.
fn build_record(
    def: &StorageDefinition,
    item: &BackupWorkItem,
    successful: bool,
) -> BackupFileInformation {
    let (storage, digest) = match &item.classification {
        Some(Classification::SkipUnchanged { backing_digest }) => (
            StorageRecord::Duplicate {
                backing_digest: backing_digest.clone(),
                unchanged: true,
            },
            item.digest.clone().unwrap_or_else(|| backing_digest.clone()),
        ),
        Some(Classification::RecordDuplicate { backing_digest, .. }) => (
            StorageRecord::Duplicate {
                backing_digest: backing_digest.clone(),
                unchanged: false,
            },
            item.digest.clone().unwrap_or_else(|| backing_digest.clone()),
        ),
        _ => (
            StorageRecord::Physical {
                object_name: item.object_name.clone().unwrap_or_default(),
                is_encrypted: def.is_encryption_used(),
                iv_hex: item.iv.map(hex::encode),
                compression: item.compression,
                ciphertext_size: item.ciphertext_size,
            },
            item.digest.clone().unwrap_or_default(),
        ),
    };
    let bitrot = item.classification.as_ref().and_then(Classification::bitrot);
    BackupFileInformation {
        path: item.file.path.to_string_lossy().to_string(),
        discovery_root: item.file.discovery_root.to_string_lossy().to_string(),
        modified_time_us: item.file.modified_time_us,
        size_in_bytes: item.file.size_in_bytes,
        primary_digest: digest,
        storage,
        is_successful: successful,
        exception_chain: item.errors.clone(),
        is_bitrot_detected: bitrot.map(|b| !b.squelched).unwrap_or(false),
        prior_digest_on_bitrot: bitrot.map(|b| b.prior_digest.clone()),
    }
}

/// Orchestrates one backup run against one storage definition.
pub struct BackupDriver {
    def: StorageDefinition,
    backup_info_dir: PathBuf,
    options: BackupOptions,
    hasher: HasherConfig,
}

impl BackupDriver {
    pub fn new(
        def: StorageDefinition,
        backup_info_dir: impl Into<PathBuf>,
        options: BackupOptions,
        hasher: HasherConfig,
    ) -> Self {
        Self {
            def,
            backup_info_dir: backup_info_dir.into(),
            options,
            hasher,
        }
    }

    /// Run the backup over the given source roots.
    pub async fn run(mut self, sources: &[PathBuf]) -> Result<BackupOutcome> {
        if self.options.dedup != DedupMode::None
            && !matches!(
                self.options.backup_type,
                BackupType::IncrementalPlus | BackupType::IncrementalHybrid
            )
        {
            return Err(BackupError::Configuration(
                "deduplication requires incremental-plus or incremental-hybrid".to_string(),
            ));
        }

        info!(
            "Starting {} backup to '{}'",
            self.options.backup_type.as_str(),
            self.def.name()
        );
        for (idx, source) in sources.iter().enumerate() {
            info!("{:.<35} {}", format!("  Source location #{idx} "), source.display());
        }
        info!("Searching for files...");
        let files = discover_files(sources, &self.options.exclude_patterns)?;
        let mut outcome = BackupOutcome {
            total_files: files.len(),
            ..Default::default()
        };
        if files.is_empty() {
            info!("No files found, nothing to back up.");
            outcome.exit_code = if self.options.dry_run {
                EXIT_DRYRUN_SUCCESS
            } else {
                EXIT_SUCCESS
            };
            return Ok(outcome);
        }

        // A dry run never opens the container.
        let container: Option<Arc<dyn StorageContainer>> = if self.options.dry_run {
            None
        } else {
            let interface = self.def.create_storage_interface().await?;
            // Expand a trailing auto-find container name; the concrete name
            // sticks to the definition and its saved configuration.
            let container_name = self
                .def
                .resolve_and_persist_container(interface.as_ref())
                .await?;
            let container = match interface.get_container(&container_name).await {
                Ok(c) => Arc::from(c),
                Err(StorageError::ContainerNotFound(_))
                    if self.def.interface_kind() == InterfaceKind::Filesystem =>
                {
                    Arc::from(interface.create_container(&container_name).await?)
                }
                Err(e) => return Err(e.into()),
            };
            Some(container)
        };
        let def = Arc::new(self.def);

        let mut db =
            BackupInformationDatabase::load_latest_or_default(&self.backup_info_dir, def.name())?;
        db.begin_backup(self.options.backup_type)?;
        let db = Arc::new(Mutex::new(db));

        let compression = self.options.compression_override.unwrap_or(def.compression());
        let shared = Arc::new(StageShared {
            def: Arc::clone(&def),
            db: Arc::clone(&db),
            container: container.clone(),
            classifier: Classifier::new(
                self.options.backup_type,
                self.options.dedup,
                self.options.detect_bitrot,
            ),
            gate: Arc::new(DigestGate::new()),
            hasher: self.hasher.clone(),
            compression,
            dry_run: self.options.dry_run,
        });

        let stages: Vec<Arc<dyn PipelineStage<BackupWorkItem>>> = if self.options.dry_run {
            vec![
                Arc::new(ClassifyStage { shared: Arc::clone(&shared) }),
                Arc::new(DryRunStage),
                Arc::new(FinalizeStage { shared: Arc::clone(&shared) }),
            ]
        } else {
            vec![
                Arc::new(ClassifyStage { shared: Arc::clone(&shared) }),
                Arc::new(ReadStage { shared: Arc::clone(&shared) }),
                Arc::new(UploadStage { shared: Arc::clone(&shared) }),
                Arc::new(FinalizeStage { shared: Arc::clone(&shared) }),
            ]
        };
        let pipeline = WorkPipeline::new(stages, self.options.max_simultaneous_files);

        info!("Scheduling backup jobs...");
        let mut pending: FuturesUnordered<_> = files
            .into_iter()
            .map(|file| pipeline.submit(BackupWorkItem::new(file)))
            .collect();

        // Items must be handled as they complete: a failed upload still
        // holds its digest-gate claim, and same-digest waiters inside the
        // pipeline stay blocked until it is released here.
        while let Some(result) = pending.next().await {
            let item = match result {
                Ok(item) => item,
                Err(_) => {
                    outcome.anomalies.push(Anomaly {
                        kind: crate::report::AnomalyKind::UnexpectedState,
                        path: None,
                        message: "a pipeline work item was dropped without completing".to_string(),
                    });
                    continue;
                }
            };
            if item.is_failed() {
                // Failed items skipped the finalize stage; record them for
                // reporting and unblock any same-digest waiters.
                if item.gate_claimed {
                    if let Some(digest) = &item.digest {
                        shared.gate.release(digest);
                    }
                }
                if !self.options.dry_run {
                    let record = build_record(&def, &item, false);
                    db.lock().await.add_record(record)?;
                }
                outcome.anomalies.push(Anomaly::exception(
                    Some(item.file.path.display().to_string()),
                    item.errors.join("; "),
                ));
                continue;
            }
            match &item.classification {
                Some(Classification::SkipUnchanged { .. }) => outcome.unchanged += 1,
                Some(Classification::RecordDuplicate { .. }) => outcome.duplicates += 1,
                Some(Classification::Upload { .. }) => outcome.uploads += 1,
                None => {}
            }
            match item.classification.as_ref().and_then(Classification::bitrot) {
                Some(finding) if finding.squelched => outcome.bitrot_informational += 1,
                Some(_) => outcome.bitrot_warnings += 1,
                None => {}
            }
            outcome.successes += 1;
        }
        pipeline.drain().await;

        db.lock().await.close_backup()?;
        match &container {
            None => info!("Dry run: the backup information database was not saved."),
            Some(container) => {
                let (snapshot, latest) = db.lock().await.save(&self.backup_info_dir)?;
                // The database files go to the container as ordinary backup
                // objects so they can be recovered from storage alone.
                for path in [&snapshot, &latest] {
                    upload_file_as_object(&def, container.as_ref(), path, &self.hasher).await?;
                }
            }
        }

        let had_bitrot_warnings = outcome.bitrot_warnings > 0;
        outcome.exit_code = if outcome.is_all_ok() && !had_bitrot_warnings {
            if self.options.dry_run {
                EXIT_DRYRUN_SUCCESS
            } else {
                EXIT_SUCCESS
            }
        } else {
            EXIT_FAILURE
        };

        if outcome.is_all_ok() {
            log_success_banner("backup");
        } else {
            log_anomalies_report(&outcome.anomalies);
        }
        log_summary(&[
            ("Total files", outcome.total_files.to_string()),
            ("Total unchanged files", outcome.unchanged.to_string()),
            ("Total duplicate files", outcome.duplicates.to_string()),
            ("Total backup operations", outcome.uploads.to_string()),
            ("Total errors", outcome.anomalies.len().to_string()),
            ("Total successful backups", outcome.successes.to_string()),
            ("Total bitrot warnings", outcome.bitrot_warnings.to_string()),
            (
                "Total bitrot informational",
                outcome.bitrot_informational.to_string(),
            ),
        ]);
        Ok(outcome)
    }
}

/// Upload one local file as a stored object named after its filename,
/// preamble and encryption included.
pub async fn upload_file_as_object(
    def: &StorageDefinition,
    container: &dyn StorageContainer,
    path: &Path,
    hasher: &HasherConfig,
) -> Result<()> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| BackupError::InvalidState(format!("no filename in {}", path.display())))?;
    let extension = if def.is_encryption_used() {
        BACKUP_FILE_EXTENSION_ENCRYPTED
    } else {
        BACKUP_FILE_EXTENSION
    };
    let object_name = format!("{filename}{extension}");

    let meta = std::fs::metadata(path)?;
    let modified_us = system_time_to_micros(meta.modified()?);
    let size = meta.len();
    let encryption_key = if def.is_encryption_used() {
        Some(def.encryption_key()?.to_vec())
    } else {
        None
    };
    let chunk_size = def.upload_chunk_size();
    let hasher = hasher.clone();
    let path_owned = path.to_path_buf();
    let filename_for_preamble = filename.clone();

    let body = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let digest = digest_file(&hasher, &path_owned)?;
        let (encryptor, iv) = match &encryption_key {
            Some(key) => {
                let iv = aes_cbc::random_iv();
                (Some(AesCbcEncryptor::new(key, &iv)?), Some(iv))
            }
            None => (None, None),
        };
        // Database objects always carry the IV inline: without a database to
        // recover from, the IV must travel with the object.
        let preamble = ObjectPreamble::new(
            encryption_key.is_some(),
            iv,
            CompressionKind::None,
            filename_for_preamble,
            modified_us,
            size,
            digest,
        );
        let mut reader = ChunkReader::open(&path_owned, chunk_size, encryptor)?;
        reader.queue_cleartext(&preamble.encode()?)?;
        let mut out = Vec::new();
        loop {
            let chunk = reader.read_chunk()?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    })
    .await
    .map_err(|e| BackupError::InvalidState(format!("upload task failed: {e}")))??;

    let mut source = BytesChunkStream::new(body, def.upload_chunk_size());
    container.put_object(&object_name, &mut source).await?;
    debug!("Uploaded backup information object {object_name}");
    Ok(())
}
