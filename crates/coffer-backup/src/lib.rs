//! # Coffer Backup
//!
//! A local-and-cloud file backup engine with per-file integrity tracking,
//! client-side encryption, content-addressed whole-file deduplication, and
//! bitrot detection.
//!
//! ## Architecture
//!
//! - `chunk_reader`: fixed-size chunk reads over a file, with optional
//!   in-stream AES-CBC encryption
//! - `preamble`: the self-describing cleartext header on every stored object
//! - `credentials`: described credentials, the secret-vault contract, and
//!   cleartext export/import
//! - `config`: storage-definition records and the resolved immutable view
//! - `storage`: the thin container/object abstraction (filesystem, S3)
//! - `database`: the backup history database with digest and path indexes
//! - `classifier`: upload / skip-unchanged / record-duplicate decisions
//! - `pipeline`: the bounded multi-stage work pipeline with paired stages
//! - `backup`, `restore`, `verify`, `recover`: the drivers
//! - `selections`: `storage:` / `backup:` / `files:` specifier resolution
//! - `report`: anomaly accumulation and end-of-run summaries

#![warn(clippy::all)]

pub mod backup;
pub mod chunk_reader;
pub mod classifier;
pub mod compression;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod database;
pub mod error;
pub mod hasher;
pub mod list;
pub mod pipeline;
pub mod preamble;
pub mod recover;
pub mod report;
pub mod restore;
pub mod retriever;
pub mod selections;
pub mod storage;
pub mod util;
pub mod verify;

// Re-export main types for convenience
pub use backup::{BackupDriver, BackupOptions, BackupOutcome};
pub use classifier::{Classification, Classifier, DedupMode};
pub use compression::{CompressionKind, CompressionLevel, CompressionSettings};
pub use config::{ConfigDocument, InterfaceKind, StorageDefinition};
pub use credentials::{CredentialSet, MemoryVault, SecretVault};
pub use database::{BackupFileInformation, BackupInformationDatabase, BackupType, SpecificBackup};
pub use error::{BackupError, Result, StorageError};
pub use hasher::HasherConfig;
pub use preamble::ObjectPreamble;
pub use restore::{RestoreOptions, RestoreOutcome};
pub use verify::{VerifyOptions, VerifyOutcome};

/// Version information for the backup engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
