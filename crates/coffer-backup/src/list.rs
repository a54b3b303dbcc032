//! Listing of storage definitions, specific backups, and their files.

use tracing::info;

use crate::config::StorageDefinition;
use crate::database::BackupInformationDatabase;

/// Log a table of storage definitions.
pub fn log_storage_definitions(defs: &[&StorageDefinition]) {
    info!(
        "{:<24} {:<12} {:<32} {:<12} {:<10} {}",
        "Storage Definition", "Provider", "Container", "Interface", "Encrypted", "Persisted IV"
    );
    info!(
        "{} {} {} {} {} {}",
        "-".repeat(24),
        "-".repeat(12),
        "-".repeat(32),
        "-".repeat(12),
        "-".repeat(10),
        "-".repeat(12)
    );
    for def in defs {
        info!(
            "{:<24} {:<12} {:<32} {:<12} {:<10} {}",
            def.name(),
            def.provider(),
            def.container_name(),
            format!("{:?}", def.interface_kind()).to_lowercase(),
            def.is_encryption_used(),
            def.persist_iv_in_object()
        );
    }
}

/// Log each specific backup of a series with its files, sorted by path.
pub fn log_backup_contents(db: &BackupInformationDatabase) {
    info!("Specific backups from storage definition '{}'", db.base_name());
    for backup in db.specific_backups() {
        info!("  {}", backup.backup_name);
        for record in backup.file_records.values() {
            info!("    {}", record.path);
        }
    }
}
