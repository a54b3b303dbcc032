//! Common download path for restore, verify, and decrypt: open the stored
//! object, parse the preamble, stream-decrypt and decompress chunk by chunk
//! into a mode-specific sink, then assert digest and size against the
//! recorded expectations.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use coffer_crypto::AesCbcDecryptor;
use tracing::{debug, warn};

use crate::compression::Decompressor;
use crate::config::StorageDefinition;
use crate::constants::DEFAULT_RETRY_LIMIT;
use crate::database::{BackupFileInformation, BackupInformationDatabase, StorageRecord};
use crate::error::{BackupError, Result};
use crate::hasher::HasherConfig;
use crate::preamble::ObjectPreamble;
use crate::storage::filesystem::FileChunkStream;
use crate::storage::{ChunkStream, StorageContainer};

/// Where the stored object's bytes come from.
pub enum RetrieveSource {
    /// An object in the storage container.
    Object {
        container: Arc<dyn StorageContainer>,
        object_name: String,
    },
    /// A stored object taken directly from the local filesystem
    /// (decrypt-only mode).
    LocalFile(PathBuf),
}

/// One file to retrieve, with the expectations recorded in its history.
pub struct RetrieveTarget {
    /// Original absolute path, for reporting.
    pub logical_path: String,
    /// Path the destination is derived from (relative form).
    pub relative_path: String,
    pub modified_time_us: Option<i64>,
    pub expected_size: Option<u64>,
    pub expected_digest: Option<String>,
    /// IV recorded in the database, used when the preamble does not carry
    /// one inline.
    pub iv_from_record: Option<[u8; 16]>,
    pub source: RetrieveSource,
}

impl RetrieveTarget {
    /// Build a target from a (possibly duplicate) record by resolving its
    /// physical carrier.
    pub fn from_record(
        db: &BackupInformationDatabase,
        record: &BackupFileInformation,
        container: Arc<dyn StorageContainer>,
    ) -> Result<Self> {
        let physical = db.resolve_physical(record)?;
        let (object_name, iv_hex) = match &physical.storage {
            StorageRecord::Physical {
                object_name,
                iv_hex,
                ..
            } => (object_name.clone(), iv_hex.clone()),
            StorageRecord::Duplicate { .. } => {
                return Err(BackupError::InvalidState(
                    "resolved record is not physical".to_string(),
                ))
            }
        };
        let iv_from_record = match iv_hex {
            Some(hex_iv) => {
                let raw = hex::decode(&hex_iv)
                    .map_err(|_| BackupError::Database(format!("bad IV hex for {}", record.path)))?;
                let arr: [u8; 16] = raw.try_into().map_err(|_| {
                    BackupError::Database(format!("IV is not 16 bytes for {}", record.path))
                })?;
                Some(arr)
            }
            None => None,
        };
        Ok(Self {
            logical_path: record.path.clone(),
            relative_path: record.path_without_root(),
            modified_time_us: Some(record.modified_time_us),
            expected_size: Some(record.size_in_bytes),
            expected_digest: Some(record.primary_digest.clone()),
            iv_from_record,
            source: RetrieveSource::Object {
                container,
                object_name,
            },
        })
    }

    /// Build a target for decrypt-only mode; expectations come from the
    /// preamble at run time.
    pub fn from_stored_file(path: PathBuf) -> Self {
        Self {
            logical_path: path.display().to_string(),
            relative_path: String::new(),
            modified_time_us: None,
            expected_size: None,
            expected_digest: None,
            iv_from_record: None,
            source: RetrieveSource::LocalFile(path),
        }
    }
}

/// Mode-specific consumer of the decrypted plaintext stream.
#[async_trait]
pub trait RetrieveSink: Send {
    /// Called once the preamble is known, before any plaintext.
    async fn prepare(&mut self, target: &RetrieveTarget, preamble: &ObjectPreamble) -> Result<()>;

    async fn process_chunk(&mut self, data: &[u8]) -> Result<()>;

    /// Called after digest/size checks pass.
    async fn completed(&mut self, target: &RetrieveTarget, preamble: &ObjectPreamble)
        -> Result<()>;

    /// Called after a failed attempt, before a possible retry.
    async fn attempt_failed(&mut self);

    /// Called when every attempt has failed.
    async fn final_failed(&mut self);
}

/// Result of a successful retrieval.
pub struct RetrieveOutcome {
    pub preamble: ObjectPreamble,
    pub plaintext_size: u64,
    pub primary_digest: String,
}

struct ChunkProcessor {
    decryptor: Option<AesCbcDecryptor>,
    decompressor: Decompressor,
}

impl ChunkProcessor {
    fn push(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match &mut self.decryptor {
            Some(dec) => {
                let plain = dec.update(data)?;
                self.decompressor.write(&plain)?;
            }
            None => self.decompressor.write(data)?,
        }
        Ok(self.decompressor.take_output())
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        if let Some(dec) = &mut self.decryptor {
            let last = dec.finalize()?;
            self.decompressor.write(&last)?;
        }
        self.decompressor.finish()
    }
}

/// Downloads one stored object, decrypting and verifying as it streams.
pub struct StorageFileRetriever<'a> {
    def: &'a StorageDefinition,
    hasher: HasherConfig,
    retry_limit: u32,
}

impl<'a> StorageFileRetriever<'a> {
    pub fn new(def: &'a StorageDefinition, hasher: HasherConfig) -> Self {
        Self {
            def,
            hasher,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }

    /// Run the retrieval with per-attempt retry on storage errors.
    pub async fn run(
        &self,
        target: &RetrieveTarget,
        sink: &mut dyn RetrieveSink,
    ) -> Result<RetrieveOutcome> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(target, sink).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    sink.attempt_failed().await;
                    let retryable = matches!(err, BackupError::Storage(_));
                    if !retryable {
                        sink.final_failed().await;
                        return Err(err);
                    }
                    if attempt >= self.retry_limit {
                        sink.final_failed().await;
                        return Err(BackupError::RetryLimitReached {
                            attempts: attempt,
                            last_error: err.to_string(),
                        });
                    }
                    warn!(
                        "Retrying retrieval of {} after storage error (attempt {attempt}): {err}",
                        target.logical_path
                    );
                }
            }
        }
    }

    async fn open_stream(&self, target: &RetrieveTarget) -> Result<Box<dyn ChunkStream>> {
        match &target.source {
            RetrieveSource::Object {
                container,
                object_name,
            } => Ok(container
                .get_object(object_name, self.def.download_chunk_size())
                .await?),
            RetrieveSource::LocalFile(path) => Ok(Box::new(
                FileChunkStream::open(path, self.def.download_chunk_size()).await?,
            )),
        }
    }

    async fn attempt(
        &self,
        target: &RetrieveTarget,
        sink: &mut dyn RetrieveSink,
    ) -> Result<RetrieveOutcome> {
        let mut stream = self.open_stream(target).await?;

        // Accumulate until the whole preamble is in hand; chunk sizes are
        // far larger than any preamble, so this is normally one read.
        let mut head: Vec<u8> = Vec::new();
        let preamble_len = loop {
            if let Some(declared) = ObjectPreamble::declared_len(&head) {
                if head.len() >= declared {
                    break declared;
                }
            }
            let chunk = stream.next_chunk().await?;
            if chunk.is_empty() {
                return Err(BackupError::PreambleParse(format!(
                    "object for {} ended before the preamble was complete",
                    target.logical_path
                )));
            }
            head.extend_from_slice(&chunk);
        };
        let (preamble, consumed) = ObjectPreamble::decode(&head[..preamble_len])?;
        debug!(
            "Retrieved preamble for {}: encrypted={} compression={:?}",
            target.logical_path, preamble.is_encrypted, preamble.compression
        );

        // The preamble's own flags win when they disagree with the storage
        // definition's persisted-IV policy.
        let decryptor = if preamble.is_encrypted {
            let key = self.def.encryption_key()?;
            let iv = preamble
                .iv
                .or(target.iv_from_record)
                .ok_or_else(|| {
                    BackupError::PreambleParse(format!(
                        "no IV available for encrypted object of {}",
                        target.logical_path
                    ))
                })?;
            Some(AesCbcDecryptor::new(key, &iv)?)
        } else {
            None
        };
        let mut processor = ChunkProcessor {
            decryptor,
            decompressor: Decompressor::new(preamble.compression)?,
        };
        let mut hasher = self.hasher.create_hasher();
        let mut plaintext_size = 0u64;

        sink.prepare(target, &preamble).await?;

        // Body bytes already read along with the preamble.
        if head.len() > consumed {
            let plain = processor.push(&head[consumed..])?;
            if !plain.is_empty() {
                hasher.update(&plain);
                plaintext_size += plain.len() as u64;
                sink.process_chunk(&plain).await?;
            }
        }
        loop {
            let chunk = stream.next_chunk().await?;
            if chunk.is_empty() {
                break;
            }
            let plain = processor.push(&chunk)?;
            if !plain.is_empty() {
                hasher.update(&plain);
                plaintext_size += plain.len() as u64;
                sink.process_chunk(&plain).await?;
            }
        }
        let last = processor.finish()?;
        if !last.is_empty() {
            hasher.update(&last);
            plaintext_size += last.len() as u64;
            sink.process_chunk(&last).await?;
        }

        let digest = hasher.primary_hexdigest();
        let expected_digest = target
            .expected_digest
            .as_deref()
            .unwrap_or(&preamble.primary_digest);
        if digest != expected_digest {
            return Err(BackupError::DigestMismatch {
                path: target.logical_path.clone(),
                expected: expected_digest.to_string(),
                actual: digest,
            });
        }
        let expected_size = target.expected_size.unwrap_or(preamble.plaintext_size);
        if plaintext_size != expected_size {
            return Err(BackupError::SizeMismatch {
                path: target.logical_path.clone(),
                expected: expected_size,
                actual: plaintext_size,
            });
        }

        sink.completed(target, &preamble).await?;
        Ok(RetrieveOutcome {
            preamble,
            plaintext_size,
            primary_digest: digest,
        })
    }
}
