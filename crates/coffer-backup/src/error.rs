//! Error types for the Coffer backup engine.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for backup operations.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] coffer_crypto::CryptoError),

    #[error("Configuration invalid: {0}")]
    Configuration(String),

    #[error("Storage definition not found: {0}")]
    StorageDefNotFound(String),

    #[error("Credential invalid: {0}")]
    CredentialInvalid(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Preamble parse error: {0}")]
    PreambleParse(String),

    #[error("Digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Size mismatch for {path}: expected {expected}, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Modified-time mismatch for {path}: expected {expected}, got {actual}")]
    DateTimeMismatch {
        path: String,
        expected: i64,
        actual: i64,
    },

    #[error("Compared bytes mismatch for {path}: compared {compared}, expected {expected}")]
    CompareBytesMismatch {
        path: String,
        compared: u64,
        expected: u64,
    },

    #[error("Verify file path not found: {0}")]
    VerifyFilePathNotFound(PathBuf),

    #[error("Restore destination path already exists: {0}")]
    RestorePathExists(PathBuf),

    #[error("Backup information recovery failed: {0}")]
    InfoRecovery(String),

    #[error("Backup selection error: {0}")]
    Selection(String),

    #[error("Backup information database error: {0}")]
    Database(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Pipe connection EOF")]
    PipeConnectionEof,

    #[error("Retry limit reached after {attempts} attempts: {last_error}")]
    RetryLimitReached { attempts: u32, last_error: String },

    #[error("Instance already used: {0}")]
    AlreadyUsed(String),

    #[error("Read past end of stream: {0}")]
    AlreadyEof(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage backend specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Container already exists: {0}")]
    ContainerAlreadyExists(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container auto-create failed: {0}")]
    ContainerAutoCreateFailed(String),

    #[error("Invalid container name: {0}")]
    InvalidContainerName(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
