//! Decides, for each source file, whether to upload, skip, or record a
//! duplicate, given the backup type, the prior history, and the
//! deduplication mode.

use serde::{Deserialize, Serialize};

use crate::database::{BackupInformationDatabase, BackupType};

/// Policy controlling when an upload is demoted to a duplicate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupMode {
    None,
    /// Match on content digest alone.
    Digest,
    /// Match on content digest plus case-insensitive file extension.
    DigestExt,
}

/// What the classifier observed about possible silent content change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitrotFinding {
    /// Digest the prior record carried.
    pub prior_digest: String,
    /// True when bitrot detection was switched off and the finding is
    /// informational only.
    pub squelched: bool,
}

/// Classification outcome for one source file.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Upload a new physical object.
    Upload { bitrot: Option<BitrotFinding> },
    /// Metadata matches the prior record; point at it without uploading.
    SkipUnchanged { backing_digest: String },
    /// Content already stored under another path; record a duplicate.
    RecordDuplicate {
        backing_digest: String,
        bitrot: Option<BitrotFinding>,
    },
}

impl Classification {
    pub fn is_upload(&self) -> bool {
        matches!(self, Classification::Upload { .. })
    }

    pub fn bitrot(&self) -> Option<&BitrotFinding> {
        match self {
            Classification::Upload { bitrot } => bitrot.as_ref(),
            Classification::RecordDuplicate { bitrot, .. } => bitrot.as_ref(),
            Classification::SkipUnchanged { .. } => None,
        }
    }
}

/// Facts about a source file at classification time.
#[derive(Debug, Clone)]
pub struct SourceFileFacts<'a> {
    pub path: &'a str,
    pub modified_time_us: i64,
    pub size_in_bytes: u64,
    /// Recomputed digest of current content.
    pub primary_digest: &'a str,
    /// Lowercased extension, empty when none.
    pub extension_lowercase: &'a str,
}

/// The classification policy for one backup run.
#[derive(Debug, Clone)]
pub struct Classifier {
    pub backup_type: BackupType,
    pub dedup: DedupMode,
    /// When false, a bitrot observation is logged as informational and the
    /// upload proceeds without the bitrot flag.
    pub detect_bitrot: bool,
}

impl Classifier {
    pub fn new(backup_type: BackupType, dedup: DedupMode, detect_bitrot: bool) -> Self {
        Self {
            backup_type,
            dedup,
            detect_bitrot,
        }
    }

    /// Apply the decision table, then the dedup post-filter.
    pub fn classify(
        &self,
        facts: &SourceFileFacts<'_>,
        db: &BackupInformationDatabase,
    ) -> Classification {
        let prior = db.latest_by_path(facts.path);
        let base = match (self.backup_type, prior) {
            (BackupType::Full, _) => Classification::Upload { bitrot: None },
            (_, None) => Classification::Upload { bitrot: None },
            (BackupType::Incremental, Some(prior)) => {
                if metadata_equal(facts, prior) {
                    Classification::SkipUnchanged {
                        backing_digest: prior.primary_digest.clone(),
                    }
                } else {
                    Classification::Upload { bitrot: None }
                }
            }
            (BackupType::IncrementalPlus, Some(prior)) => self.classify_plus(facts, prior),
            (BackupType::IncrementalHybrid, Some(prior)) => {
                if metadata_equal(facts, prior) {
                    Classification::SkipUnchanged {
                        backing_digest: prior.primary_digest.clone(),
                    }
                } else {
                    self.classify_plus(facts, prior)
                }
            }
        };

        match base {
            Classification::Upload { bitrot } => self.apply_dedup(facts, db, bitrot),
            other => other,
        }
    }

    fn classify_plus(
        &self,
        facts: &SourceFileFacts<'_>,
        prior: &crate::database::BackupFileInformation,
    ) -> Classification {
        if metadata_equal(facts, prior) {
            if facts.primary_digest == prior.primary_digest {
                return Classification::SkipUnchanged {
                    backing_digest: prior.primary_digest.clone(),
                };
            }
            // Same mtime and size but different content: bitrot.
            return Classification::Upload {
                bitrot: Some(BitrotFinding {
                    prior_digest: prior.primary_digest.clone(),
                    squelched: !self.detect_bitrot,
                }),
            };
        }
        Classification::Upload { bitrot: None }
    }

    fn apply_dedup(
        &self,
        facts: &SourceFileFacts<'_>,
        db: &BackupInformationDatabase,
        bitrot: Option<BitrotFinding>,
    ) -> Classification {
        if self.dedup == DedupMode::None {
            return Classification::Upload { bitrot };
        }
        if let Some(physical) = db.physical_by_digest(facts.primary_digest) {
            let extension_ok = match self.dedup {
                DedupMode::DigestExt => {
                    physical.extension_lowercase() == facts.extension_lowercase
                }
                _ => true,
            };
            if extension_ok {
                return Classification::RecordDuplicate {
                    backing_digest: facts.primary_digest.to_string(),
                    bitrot,
                };
            }
        }
        Classification::Upload { bitrot }
    }
}

fn metadata_equal(
    facts: &SourceFileFacts<'_>,
    prior: &crate::database::BackupFileInformation,
) -> bool {
    facts.modified_time_us == prior.modified_time_us
        && facts.size_in_bytes == prior.size_in_bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionKind;
    use crate::database::{BackupFileInformation, StorageRecord};

    const MTIME: i64 = 1_700_000_000_000_000;

    fn db_with(records: Vec<BackupFileInformation>) -> BackupInformationDatabase {
        let mut db = BackupInformationDatabase::new("t");
        db.begin_backup(BackupType::Full).unwrap();
        for r in records {
            db.add_record(r).unwrap();
        }
        db.close_backup().unwrap();
        db
    }

    fn physical(path: &str, digest: &str, mtime: i64, size: u64) -> BackupFileInformation {
        BackupFileInformation {
            path: path.to_string(),
            discovery_root: "/src".to_string(),
            modified_time_us: mtime,
            size_in_bytes: size,
            primary_digest: digest.to_string(),
            storage: StorageRecord::Physical {
                object_name: format!("{digest}.atbak"),
                is_encrypted: false,
                iv_hex: None,
                compression: CompressionKind::None,
                ciphertext_size: size,
            },
            is_successful: true,
            exception_chain: Vec::new(),
            is_bitrot_detected: false,
            prior_digest_on_bitrot: None,
        }
    }

    fn facts<'a>(path: &'a str, digest: &'a str, mtime: i64, size: u64, ext: &'a str) -> SourceFileFacts<'a> {
        SourceFileFacts {
            path,
            modified_time_us: mtime,
            size_in_bytes: size,
            primary_digest: digest,
            extension_lowercase: ext,
        }
    }

    #[test]
    fn full_backup_always_uploads() {
        let db = db_with(vec![physical("/src/a.txt", "d1", MTIME, 10)]);
        let c = Classifier::new(BackupType::Full, DedupMode::None, true);
        assert!(c
            .classify(&facts("/src/a.txt", "d1", MTIME, 10, "txt"), &db)
            .is_upload());
    }

    #[test]
    fn incremental_skips_on_metadata_match() {
        let db = db_with(vec![physical("/src/a.txt", "d1", MTIME, 10)]);
        let c = Classifier::new(BackupType::Incremental, DedupMode::None, true);
        assert!(matches!(
            c.classify(&facts("/src/a.txt", "ignored", MTIME, 10, "txt"), &db),
            Classification::SkipUnchanged { .. }
        ));
        // mtime-only change.
        assert!(c
            .classify(&facts("/src/a.txt", "ignored", MTIME + 1, 10, "txt"), &db)
            .is_upload());
        // size-only change.
        assert!(c
            .classify(&facts("/src/a.txt", "ignored", MTIME, 11, "txt"), &db)
            .is_upload());
        // first-time file.
        assert!(c
            .classify(&facts("/src/new.txt", "ignored", MTIME, 10, "txt"), &db)
            .is_upload());
    }

    #[test]
    fn incremental_plus_detects_bitrot() {
        let db = db_with(vec![physical("/src/a.txt", "d1", MTIME, 10)]);
        let c = Classifier::new(BackupType::IncrementalPlus, DedupMode::None, true);

        // Identical everything: skip.
        assert!(matches!(
            c.classify(&facts("/src/a.txt", "d1", MTIME, 10, "txt"), &db),
            Classification::SkipUnchanged { .. }
        ));

        // Content-only change with matching mtime+size: bitrot warn.
        let got = c.classify(&facts("/src/a.txt", "d2", MTIME, 10, "txt"), &db);
        match &got {
            Classification::Upload { bitrot: Some(b) } => {
                assert_eq!(b.prior_digest, "d1");
                assert!(!b.squelched);
            }
            other => panic!("expected bitrot upload, got {other:?}"),
        }

        // Squelched mode marks the finding informational.
        let c2 = Classifier::new(BackupType::IncrementalPlus, DedupMode::None, false);
        let got = c2.classify(&facts("/src/a.txt", "d2", MTIME, 10, "txt"), &db);
        match &got {
            Classification::Upload { bitrot: Some(b) } => assert!(b.squelched),
            other => panic!("expected squelched bitrot upload, got {other:?}"),
        }

        // Ordinary change uploads without bitrot.
        let got = c.classify(&facts("/src/a.txt", "d2", MTIME + 5, 12, "txt"), &db);
        assert_eq!(got, Classification::Upload { bitrot: None });
    }

    #[test]
    fn incremental_hybrid_skips_on_metadata_without_digest_check() {
        let db = db_with(vec![physical("/src/a.txt", "d1", MTIME, 10)]);
        let c = Classifier::new(BackupType::IncrementalHybrid, DedupMode::None, true);
        // Metadata equal: skip even though the digest differs.
        assert!(matches!(
            c.classify(&facts("/src/a.txt", "d2", MTIME, 10, "txt"), &db),
            Classification::SkipUnchanged { .. }
        ));
        // Metadata differs: behaves like incremental-plus.
        assert!(c
            .classify(&facts("/src/a.txt", "d2", MTIME + 1, 10, "txt"), &db)
            .is_upload());
    }

    #[test]
    fn dedup_digest_demotes_upload_to_duplicate() {
        let db = db_with(vec![physical("/src/a.txt", "d1", MTIME, 10)]);
        let c = Classifier::new(BackupType::IncrementalPlus, DedupMode::Digest, true);
        // Renamed duplicate: new path, same content.
        let got = c.classify(&facts("/src/renamed.txt", "d1", MTIME + 9, 10, "txt"), &db);
        assert!(matches!(
            got,
            Classification::RecordDuplicate { ref backing_digest, .. } if backing_digest == "d1"
        ));
        // Unknown digest still uploads.
        assert!(c
            .classify(&facts("/src/other.txt", "d9", MTIME, 10, "txt"), &db)
            .is_upload());
    }

    #[test]
    fn dedup_digest_ext_requires_matching_extension() {
        let db = db_with(vec![physical("/src/a.txt", "d1", MTIME, 10)]);
        let c = Classifier::new(BackupType::IncrementalPlus, DedupMode::DigestExt, true);
        assert!(matches!(
            c.classify(&facts("/src/copy.TXT", "d1", MTIME, 10, "txt"), &db),
            Classification::RecordDuplicate { .. }
        ));
        // Same digest, different extension: stays an upload.
        assert!(c
            .classify(&facts("/src/copy.bin", "d1", MTIME, 10, "bin"), &db)
            .is_upload());
    }
}
