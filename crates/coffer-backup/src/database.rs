//! The backup history / file-information database: per logical (path,
//! backup) a file record, per physical upload a storage record, duplicate
//! chains by digest, and the in-memory indexes the classifier consumes.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compression::CompressionKind;
use crate::constants::{BACKUP_INFO_EXTENSION, BACKUP_TIMESTAMP_FORMAT, DATABASE_VERSION};
use crate::error::{BackupError, Result};

/// The kind of backup a specific backup was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupType {
    Full,
    Incremental,
    IncrementalPlus,
    IncrementalHybrid,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::IncrementalPlus => "incremental-plus",
            BackupType::IncrementalHybrid => "incremental-hybrid",
        }
    }
}

/// How a record's content is stored: either it carries the uploaded object
/// itself, or it points at the physical carrier of the same digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StorageRecord {
    Physical {
        object_name: String,
        is_encrypted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iv_hex: Option<String>,
        #[serde(default)]
        compression: CompressionKind,
        ciphertext_size: u64,
    },
    Duplicate {
        backing_digest: String,
        /// True when the duplicate exists because the file was unchanged
        /// since the prior backup, rather than found through deduplication.
        #[serde(default)]
        unchanged: bool,
    },
}

/// One logical file within one specific backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFileInformation {
    /// Original absolute path.
    pub path: String,
    /// The source-tree root under which the file was discovered.
    pub discovery_root: String,
    /// Modified time, POSIX microseconds.
    pub modified_time_us: i64,
    pub size_in_bytes: u64,
    /// Primary digest of the plaintext content, lowercase hex.
    pub primary_digest: String,
    pub storage: StorageRecord,
    pub is_successful: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exception_chain: Vec<String>,
    #[serde(default)]
    pub is_bitrot_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_digest_on_bitrot: Option<String>,
}

impl BackupFileInformation {
    pub fn is_physical(&self) -> bool {
        matches!(self.storage, StorageRecord::Physical { .. })
    }

    pub fn is_unchanged_since_last(&self) -> bool {
        matches!(
            self.storage,
            StorageRecord::Duplicate { unchanged: true, .. }
        )
    }

    pub fn object_name(&self) -> Option<&str> {
        match &self.storage {
            StorageRecord::Physical { object_name, .. } => Some(object_name),
            StorageRecord::Duplicate { .. } => None,
        }
    }

    /// Path relative to the discovery root.
    pub fn path_without_root(&self) -> String {
        Path::new(&self.path)
            .strip_prefix(&self.discovery_root)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| self.path.clone())
    }

    /// Lowercased file extension, empty when none.
    pub fn extension_lowercase(&self) -> String {
        Path::new(&self.path)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }
}

/// One backup invocation and the records it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecificBackup {
    pub backup_name: String,
    pub backup_type: BackupType,
    pub start_time_utc: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_utc: Option<DateTime<Utc>>,
    /// Normalized path -> record for this backup's view of the tree.
    pub file_records: BTreeMap<String, BackupFileInformation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatabaseEnvelope {
    name: String,
    version: String,
    specific_backups: Vec<SpecificBackup>,
}

/// Normalize a path string for use as a record key.
pub fn normalize_path_key(path: &str) -> String {
    path.replace('\\', "/")
}

/// The historical record for one backup series at one storage definition.
pub struct BackupInformationDatabase {
    base_name: String,
    specific_backups: Vec<SpecificBackup>,
    // Index maps point at (specific backup index, path key).
    digest_to_physical: HashMap<String, (usize, String)>,
    path_to_latest: HashMap<String, (usize, String)>,
}

impl BackupInformationDatabase {
    pub fn new(base_name: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
            specific_backups: Vec::new(),
            digest_to_physical: HashMap::new(),
            path_to_latest: HashMap::new(),
        }
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn specific_backups(&self) -> &[SpecificBackup] {
        &self.specific_backups
    }

    pub fn newest_backup(&self) -> Option<&SpecificBackup> {
        self.specific_backups.last()
    }

    /// Find a specific backup by its full name.
    pub fn backup_by_name(&self, name: &str) -> Option<&SpecificBackup> {
        self.specific_backups.iter().find(|b| b.backup_name == name)
    }

    /// Filename of the latest-pointer database file.
    pub fn latest_filename(base_name: &str) -> String {
        format!("{base_name}{BACKUP_INFO_EXTENSION}")
    }

    /// Filename of a timestamped snapshot.
    pub fn snapshot_filename(base_name: &str, stamp: &DateTime<Utc>) -> String {
        format!(
            "{base_name}-{}{BACKUP_INFO_EXTENSION}",
            stamp.format(BACKUP_TIMESTAMP_FORMAT)
        )
    }

    /// Parse the timestamp embedded in a snapshot filename.
    pub fn timestamp_from_snapshot_filename(filename: &str) -> Option<DateTime<Utc>> {
        let stem = filename.strip_suffix(BACKUP_INFO_EXTENSION)?;
        if stem.len() < 16 || stem.as_bytes()[stem.len() - 16] != b'-' {
            return None;
        }
        let stamp = &stem[stem.len() - 15..];
        chrono::NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Load from a serialized database file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;
        let value = migrate_envelope(value)?;
        let envelope: DatabaseEnvelope = serde_json::from_value(value)?;
        let mut db = Self::new(envelope.name);
        db.specific_backups = envelope.specific_backups;
        db.rebuild_indexes()?;
        Ok(db)
    }

    /// Load the latest-pointer file from `dir`, or start an empty database.
    pub fn load_latest_or_default(dir: &Path, base_name: &str) -> Result<Self> {
        let latest = dir.join(Self::latest_filename(base_name));
        if latest.is_file() {
            Self::load_file(&latest)
        } else {
            Ok(Self::new(base_name))
        }
    }

    /// Write the timestamped snapshot and latest pointer into `dir`.
    ///
    /// Returns `(snapshot_path, latest_path)`.
    pub fn save(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let stamp = self
            .specific_backups
            .last()
            .map(|b| b.start_time_utc)
            .unwrap_or_else(Utc::now);
        let envelope = DatabaseEnvelope {
            name: self.base_name.clone(),
            version: DATABASE_VERSION.to_string(),
            specific_backups: self.specific_backups.clone(),
        };
        let text = serde_json::to_string_pretty(&envelope)?;

        let snapshot = dir.join(Self::snapshot_filename(&self.base_name, &stamp));
        let latest = dir.join(Self::latest_filename(&self.base_name));
        std::fs::write(&snapshot, &text)?;
        std::fs::write(&latest, &text)?;
        Ok((snapshot, latest))
    }

    /// Open a new specific backup. Its start time is strictly greater than
    /// the previous backup's.
    pub fn begin_backup(&mut self, backup_type: BackupType) -> Result<&SpecificBackup> {
        if let Some(open) = self.specific_backups.last() {
            if open.end_time_utc.is_none() {
                return Err(BackupError::Database(
                    "a specific backup is already open".to_string(),
                ));
            }
        }
        let mut start = Utc::now();
        if let Some(last) = self.specific_backups.last() {
            if start <= last.start_time_utc {
                start = last.start_time_utc + Duration::seconds(1);
            }
        }
        let backup_name = format!(
            "{}-{}",
            self.base_name,
            start.format(BACKUP_TIMESTAMP_FORMAT)
        );
        self.specific_backups.push(SpecificBackup {
            backup_name,
            backup_type,
            start_time_utc: start,
            end_time_utc: None,
            file_records: BTreeMap::new(),
        });
        self.specific_backups
            .last()
            .ok_or_else(|| BackupError::Database("no specific backup after begin".to_string()))
    }

    /// Add a record to the newest (open) specific backup.
    pub fn add_record(&mut self, record: BackupFileInformation) -> Result<()> {
        let idx = self.specific_backups.len().saturating_sub(1);
        let open = self
            .specific_backups
            .last_mut()
            .ok_or_else(|| BackupError::Database("no specific backup is open".to_string()))?;
        if open.end_time_utc.is_some() {
            return Err(BackupError::Database(
                "the newest specific backup is closed".to_string(),
            ));
        }
        let key = normalize_path_key(&record.path);
        if record.is_successful {
            // Failed records are kept for reporting but never become prior
            // state for classification or dedup.
            if record.is_physical() {
                self.digest_to_physical
                    .insert(record.primary_digest.clone(), (idx, key.clone()));
            }
            self.path_to_latest.insert(key.clone(), (idx, key.clone()));
        }
        open.file_records.insert(key, record);
        Ok(())
    }

    /// Close the newest specific backup.
    pub fn close_backup(&mut self) -> Result<()> {
        let open = self
            .specific_backups
            .last_mut()
            .ok_or_else(|| BackupError::Database("no specific backup is open".to_string()))?;
        if open.end_time_utc.is_some() {
            return Err(BackupError::Database("backup already closed".to_string()));
        }
        open.end_time_utc = Some(Utc::now());
        Ok(())
    }

    /// Latest successful record for a path, across all specific backups.
    pub fn latest_by_path(&self, path: &str) -> Option<&BackupFileInformation> {
        let key = normalize_path_key(path);
        self.path_to_latest
            .get(&key)
            .and_then(|(idx, k)| self.specific_backups.get(*idx)?.file_records.get(k))
    }

    /// The canonical physical carrier of a digest, if one exists.
    pub fn physical_by_digest(&self, digest: &str) -> Option<&BackupFileInformation> {
        self.digest_to_physical
            .get(digest)
            .and_then(|(idx, k)| self.specific_backups.get(*idx)?.file_records.get(k))
    }

    /// Resolve a record to the physical record carrying its content.
    ///
    /// Duplicate chains terminate at a physical record; the walk is bounded
    /// by the number of specific backups.
    pub fn resolve_physical<'a>(
        &'a self,
        record: &'a BackupFileInformation,
    ) -> Result<&'a BackupFileInformation> {
        let mut current = record;
        for _ in 0..=self.specific_backups.len() {
            match &current.storage {
                StorageRecord::Physical { .. } => return Ok(current),
                StorageRecord::Duplicate { backing_digest, .. } => {
                    current = self.physical_by_digest(backing_digest).ok_or_else(|| {
                        BackupError::Database(format!(
                            "backing record not found for digest {backing_digest}"
                        ))
                    })?;
                }
            }
        }
        Err(BackupError::Database(format!(
            "duplicate chain for {} did not terminate",
            record.path
        )))
    }

    /// Rebuild both indexes and validate duplicate chains and history
    /// monotonicity.
    fn rebuild_indexes(&mut self) -> Result<()> {
        self.digest_to_physical.clear();
        self.path_to_latest.clear();
        let mut prior_start: Option<DateTime<Utc>> = None;
        for (idx, backup) in self.specific_backups.iter().enumerate() {
            if let Some(prior) = prior_start {
                if backup.start_time_utc <= prior {
                    return Err(BackupError::Database(format!(
                        "specific backup start times are not strictly increasing at '{}'",
                        backup.backup_name
                    )));
                }
            }
            prior_start = Some(backup.start_time_utc);
            for (key, record) in &backup.file_records {
                if !record.is_successful {
                    continue;
                }
                if record.is_physical() {
                    self.digest_to_physical
                        .insert(record.primary_digest.clone(), (idx, key.clone()));
                }
                self.path_to_latest
                    .insert(key.clone(), (idx, key.clone()));
            }
        }
        // Every duplicate must resolve to a physical record.
        for backup in &self.specific_backups {
            for record in backup.file_records.values() {
                if record.is_successful {
                    self.resolve_physical(record)?;
                }
            }
        }
        Ok(())
    }

    /// Merge another database for the same series into this one.
    ///
    /// Specific backups already present (by name) are kept as-is; new ones
    /// are inserted in start-time order. Used when backup information is
    /// tracked in more than one directory.
    pub fn merge_from(&mut self, other: BackupInformationDatabase) -> Result<()> {
        if other.base_name != self.base_name {
            return Err(BackupError::Database(format!(
                "cannot merge series '{}' into '{}'",
                other.base_name, self.base_name
            )));
        }
        if let Some(open) = self.specific_backups.last() {
            if open.end_time_utc.is_none() {
                return Err(BackupError::Database(
                    "cannot merge while a specific backup is open".to_string(),
                ));
            }
        }
        let mut changed = false;
        for backup in other.specific_backups {
            if self.backup_by_name(&backup.backup_name).is_none() {
                self.specific_backups.push(backup);
                changed = true;
            }
        }
        if changed {
            self.specific_backups
                .sort_by_key(|b| b.start_time_utc);
            self.rebuild_indexes()?;
        }
        Ok(())
    }

    /// Structural equality for round-trip testing.
    pub fn structurally_equals(&self, other: &Self) -> bool {
        self.base_name == other.base_name && self.specific_backups == other.specific_backups
    }
}

/// Migrate a readable older envelope forward to [`DATABASE_VERSION`].
fn migrate_envelope(mut value: Value) -> Result<Value> {
    let version = value
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let (major, minor) = match version.split_once('.') {
        Some((ma, mi)) => (ma.to_string(), mi.to_string()),
        None => {
            return Err(BackupError::Database(format!(
                "missing or malformed database version '{version}'"
            )))
        }
    };
    if major != "1" {
        return Err(BackupError::Database(format!(
            "cannot read database version {version}"
        )));
    }
    if minor == "0" {
        // 1.0 predates per-object compression; absent means uncompressed.
        if let Some(backups) = value
            .get_mut("specific_backups")
            .and_then(Value::as_array_mut)
        {
            for backup in backups {
                if let Some(records) = backup.get_mut("file_records").and_then(Value::as_object_mut)
                {
                    for record in records.values_mut() {
                        if let Some(storage) = record.get_mut("storage") {
                            let is_physical = storage.get("kind").and_then(Value::as_str)
                                == Some("physical");
                            if is_physical && storage.get("compression").is_none() {
                                storage["compression"] = Value::String("none".to_string());
                            }
                        }
                    }
                }
            }
        }
        value["version"] = Value::String(DATABASE_VERSION.to_string());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn physical_record(path: &str, digest: &str) -> BackupFileInformation {
        BackupFileInformation {
            path: path.to_string(),
            discovery_root: "/src".to_string(),
            modified_time_us: 1_700_000_000_000_000,
            size_in_bytes: 42,
            primary_digest: digest.to_string(),
            storage: StorageRecord::Physical {
                object_name: format!("{digest}.atbake"),
                is_encrypted: true,
                iv_hex: Some("00".repeat(16)),
                compression: CompressionKind::Zstd,
                ciphertext_size: 64,
            },
            is_successful: true,
            exception_chain: Vec::new(),
            is_bitrot_detected: false,
            prior_digest_on_bitrot: None,
        }
    }

    fn duplicate_record(path: &str, digest: &str, unchanged: bool) -> BackupFileInformation {
        BackupFileInformation {
            storage: StorageRecord::Duplicate {
                backing_digest: digest.to_string(),
                unchanged,
            },
            ..physical_record(path, digest)
        }
    }

    #[test]
    fn add_and_query_records() {
        let mut db = BackupInformationDatabase::new("series");
        db.begin_backup(BackupType::Full).unwrap();
        db.add_record(physical_record("/src/a.txt", "d1")).unwrap();
        db.add_record(physical_record("/src/b.txt", "d2")).unwrap();
        db.close_backup().unwrap();

        db.begin_backup(BackupType::Incremental).unwrap();
        db.add_record(duplicate_record("/src/a.txt", "d1", true)).unwrap();
        db.close_backup().unwrap();

        let latest = db.latest_by_path("/src/a.txt").unwrap();
        assert!(latest.is_unchanged_since_last());
        assert_eq!(db.physical_by_digest("d2").unwrap().path, "/src/b.txt");

        let resolved = db.resolve_physical(latest).unwrap();
        assert!(resolved.is_physical());
        assert_eq!(resolved.primary_digest, "d1");
    }

    #[test]
    fn save_load_roundtrip_preserves_structure() {
        let tmp = tempfile::tempdir().unwrap();
        let mut db = BackupInformationDatabase::new("series");
        db.begin_backup(BackupType::Full).unwrap();
        db.add_record(physical_record("/src/a.txt", "d1")).unwrap();
        db.add_record(duplicate_record("/src/copy.txt", "d1", false)).unwrap();
        db.close_backup().unwrap();

        let (snapshot, latest) = db.save(tmp.path()).unwrap();
        assert!(snapshot.file_name().unwrap().to_string_lossy().contains("series-"));
        assert!(snapshot.to_string_lossy().ends_with(BACKUP_INFO_EXTENSION));

        let loaded = BackupInformationDatabase::load_file(&latest).unwrap();
        assert!(loaded.structurally_equals(&db));
        // Duplicate chains resolve after load.
        let dup = loaded.latest_by_path("/src/copy.txt").unwrap();
        assert_eq!(loaded.resolve_physical(dup).unwrap().path, "/src/a.txt");
    }

    #[test]
    fn broken_duplicate_chain_is_rejected_at_load() {
        let tmp = tempfile::tempdir().unwrap();
        let mut db = BackupInformationDatabase::new("series");
        db.begin_backup(BackupType::Full).unwrap();
        db.add_record(duplicate_record("/src/x.txt", "missing", false))
            .unwrap();
        db.close_backup().unwrap();
        let (_, latest) = db.save(tmp.path()).unwrap();
        assert!(matches!(
            BackupInformationDatabase::load_file(&latest),
            Err(BackupError::Database(_))
        ));
    }

    #[test]
    fn start_times_strictly_increase() {
        let mut db = BackupInformationDatabase::new("series");
        db.begin_backup(BackupType::Full).unwrap();
        db.close_backup().unwrap();
        db.begin_backup(BackupType::Incremental).unwrap();
        db.close_backup().unwrap();
        let times: Vec<_> = db.specific_backups().iter().map(|b| b.start_time_utc).collect();
        assert!(times[0] < times[1]);
        // Backup names embed distinct stamps.
        assert_ne!(
            db.specific_backups()[0].backup_name,
            db.specific_backups()[1].backup_name
        );
    }

    #[test]
    fn merge_unions_specific_backups_in_time_order() {
        let mut a = BackupInformationDatabase::new("series");
        a.begin_backup(BackupType::Full).unwrap();
        a.add_record(physical_record("/src/a.txt", "d1")).unwrap();
        a.close_backup().unwrap();

        // A second database for the same series with a later backup.
        let mut b = BackupInformationDatabase::new("series");
        b.specific_backups = a.specific_backups.clone();
        b.rebuild_indexes().unwrap();
        b.begin_backup(BackupType::Incremental).unwrap();
        b.add_record(duplicate_record("/src/a.txt", "d1", true)).unwrap();
        b.close_backup().unwrap();

        a.merge_from(b).unwrap();
        assert_eq!(a.specific_backups().len(), 2);
        assert!(a.latest_by_path("/src/a.txt").unwrap().is_unchanged_since_last());

        let mut other = BackupInformationDatabase::new("different");
        other.begin_backup(BackupType::Full).unwrap();
        other.close_backup().unwrap();
        assert!(a.merge_from(other).is_err());
    }

    #[test]
    fn snapshot_filename_timestamp_roundtrip() {
        let stamp = "20260801-101112";
        let filename = format!("series-{stamp}{BACKUP_INFO_EXTENSION}");
        let parsed = BackupInformationDatabase::timestamp_from_snapshot_filename(&filename).unwrap();
        assert_eq!(
            parsed.format(BACKUP_TIMESTAMP_FORMAT).to_string(),
            stamp.to_string()
        );
        assert!(BackupInformationDatabase::timestamp_from_snapshot_filename(
            &BackupInformationDatabase::latest_filename("series")
        )
        .is_none());
    }

    #[test]
    fn version_one_zero_is_migrated_forward() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("old.cofinf");
        let old = serde_json::json!({
            "name": "series",
            "version": "1.0",
            "specific_backups": [{
                "backup_name": "series-20250101-000000",
                "backup_type": "full",
                "start_time_utc": "2025-01-01T00:00:00Z",
                "end_time_utc": "2025-01-01T00:01:00Z",
                "file_records": {
                    "/src/a.txt": {
                        "path": "/src/a.txt",
                        "discovery_root": "/src",
                        "modified_time_us": 0,
                        "size_in_bytes": 1,
                        "primary_digest": "d1",
                        "storage": {
                            "kind": "physical",
                            "object_name": "o.atbak",
                            "is_encrypted": false,
                            "ciphertext_size": 1
                        },
                        "is_successful": true
                    }
                }
            }]
        });
        std::fs::write(&path, serde_json::to_string(&old).unwrap()).unwrap();
        let db = BackupInformationDatabase::load_file(&path).unwrap();
        let record = db.latest_by_path("/src/a.txt").unwrap();
        match &record.storage {
            StorageRecord::Physical { compression, .. } => {
                assert_eq!(*compression, CompressionKind::None)
            }
            StorageRecord::Duplicate { .. } => panic!("expected physical"),
        }
    }

    #[test]
    fn unsupported_major_version_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("future.cofinf");
        std::fs::write(
            &path,
            r#"{"name":"x","version":"2.0","specific_backups":[]}"#,
        )
        .unwrap();
        assert!(matches!(
            BackupInformationDatabase::load_file(&path),
            Err(BackupError::Database(_))
        ));
    }
}
