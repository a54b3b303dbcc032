//! Shared constants: file extensions, sentinels, defaults, exit codes.

/// Extension for stored objects with a plaintext body.
pub const BACKUP_FILE_EXTENSION: &str = ".atbak";

/// Extension for stored objects with an encrypted body.
pub const BACKUP_FILE_EXTENSION_ENCRYPTED: &str = ".atbake";

/// Extension for backup information database files.
pub const BACKUP_INFO_EXTENSION: &str = ".cofinf";

/// Timestamp format used in backup names and database snapshot filenames.
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Sentinel stored in a configuration record when the real secret lives in
/// the credential vault.
pub const SECRET_FROM_VAULT_MARKER: &str = "retrieved-from-keyring";

/// Vault username for the storage-access credential.
pub const CRED_NAME_STORAGE_ACCESS: &str = "storage-access";

/// Vault username for the data-encryption credential.
pub const CRED_NAME_DATA_ENCRYPTION: &str = "data-encryption";

/// Prefix of a storage definition specifier, as in `storage:mybackup`.
pub const STORAGE_SPECIFIER_PREFIX: &str = "storage:";

/// Trailing character of a container name requesting auto-find/create.
pub const CONTAINER_AUTO_FIND_CHAR: char = '*';

/// Attempt budget for container auto-find/create before giving up.
pub const CONTAINER_AUTO_FIND_ATTEMPTS: usize = 8;

/// Default upload chunk size in bytes.
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Default download chunk size in bytes.
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Default bound on simultaneously in-flight file operations.
pub const DEFAULT_MAX_SIMULTANEOUS_FILE_OPERATIONS: usize = 5;

/// Download attempt budget per file before `retry-limit-reached`.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Process exit code: clean run.
pub const EXIT_SUCCESS: i32 = 0;

/// Process exit code: anomalies were detected.
pub const EXIT_FAILURE: i32 = 1;

/// Process exit code: dry run completed without anomalies.
pub const EXIT_DRYRUN_SUCCESS: i32 = 3;

/// Current version of the backup information database envelope.
pub const DATABASE_VERSION: &str = "1.1";

/// Current version of the configuration document.
pub const CONFIG_VERSION: &str = "1.0";
