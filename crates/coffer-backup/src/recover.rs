//! Rebuild the local backup information database from the storage container
//! when the local copy is lost but credentials survive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::info;

use crate::config::StorageDefinition;
use crate::constants::{
    BACKUP_FILE_EXTENSION, BACKUP_FILE_EXTENSION_ENCRYPTED, BACKUP_INFO_EXTENSION,
    DEFAULT_MAX_SIMULTANEOUS_FILE_OPERATIONS,
};
use crate::database::BackupInformationDatabase;
use crate::error::{BackupError, Result};
use crate::hasher::HasherConfig;
use crate::restore::RestoreFileSink;
use crate::retriever::{RetrieveSource, RetrieveTarget, StorageFileRetriever};
use crate::storage::StorageContainer;

/// Strip the stored-object extension from a database object name, giving
/// the local filename.
fn local_backup_info_filename(object_name: &str) -> String {
    object_name
        .strip_suffix(BACKUP_FILE_EXTENSION_ENCRYPTED)
        .or_else(|| object_name.strip_suffix(BACKUP_FILE_EXTENSION))
        .unwrap_or(object_name)
        .to_string()
}

/// Download every database object for this definition, then promote the
/// newest snapshot to the latest-pointer filename.
///
/// Returns the path of the recovered latest-pointer file.
pub async fn recover_backup_info(
    mut def: StorageDefinition,
    backup_info_dir: &Path,
    hasher: &HasherConfig,
) -> Result<PathBuf> {
    info!("Restoring backup information for '{}'...", def.name());
    let interface = def.create_storage_interface().await?;
    // Expand a trailing auto-find container name and keep the concrete
    // name on the definition before opening the container.
    let container_name = def.resolve_and_persist_container(interface.as_ref()).await?;
    let container: Arc<dyn StorageContainer> =
        Arc::from(interface.get_container(&container_name).await?);
    let def = Arc::new(def);

    let prefix = format!("{}-", def.name());
    let objects = container.list_objects(Some(&prefix)).await?;
    let mut snapshots: Vec<(String, String, DateTime<Utc>)> = Vec::new();
    for object in objects {
        let local = local_backup_info_filename(&object.name);
        if !local.ends_with(BACKUP_INFO_EXTENSION) {
            continue;
        }
        if let Some(stamp) = BackupInformationDatabase::timestamp_from_snapshot_filename(&local) {
            snapshots.push((object.name, local, stamp));
        }
    }
    if snapshots.is_empty() {
        return Err(BackupError::InfoRecovery(format!(
            "no backup information objects found in container '{}'",
            container.name()
        )));
    }

    tokio::fs::create_dir_all(backup_info_dir).await?;
    let semaphore = Arc::new(Semaphore::new(DEFAULT_MAX_SIMULTANEOUS_FILE_OPERATIONS));
    let mut tasks = FuturesUnordered::new();
    for (object_name, local_name, _) in &snapshots {
        info!("Building file information for storage object {object_name}");
        let target = RetrieveTarget {
            logical_path: object_name.clone(),
            relative_path: local_name.clone(),
            modified_time_us: None,
            expected_size: None,
            expected_digest: None,
            iv_from_record: None,
            source: RetrieveSource::Object {
                container: Arc::clone(&container),
                object_name: object_name.clone(),
            },
        };
        let def = Arc::clone(&def);
        let hasher = hasher.clone();
        let semaphore = Arc::clone(&semaphore);
        let dir = backup_info_dir.to_path_buf();
        let local_name = local_name.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let retriever = StorageFileRetriever::new(&def, hasher);
            let mut sink = RestoreFileSink::new(dir, Some(local_name.clone()), true);
            retriever
                .run(&target, &mut sink)
                .await
                .map(|_| local_name)
        }));
    }

    let mut failures = Vec::new();
    while let Some(joined) = tasks.next().await {
        match joined {
            Ok(Ok(local_name)) => info!("Successfully recovered {local_name}"),
            Ok(Err(err)) => failures.push(err.to_string()),
            Err(join_err) => failures.push(format!("recovery task failed: {join_err}")),
        }
    }
    if !failures.is_empty() {
        return Err(BackupError::InfoRecovery(failures.join("; ")));
    }

    // Promote the newest snapshot to the latest-pointer name.
    snapshots.sort_by_key(|(_, _, stamp)| *stamp);
    let newest_local = snapshots
        .last()
        .map(|(_, local, _)| local.clone())
        .unwrap_or_default();
    let latest = backup_info_dir.join(BackupInformationDatabase::latest_filename(def.name()));
    let newest_path = backup_info_dir.join(&newest_local);
    info!(
        "Copying {} to {}...",
        newest_path.display(),
        latest.display()
    );
    tokio::fs::copy(&newest_path, &latest).await?;
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_name_to_local_filename() {
        assert_eq!(
            local_backup_info_filename("series-20260801-101112.cofinf.atbake"),
            "series-20260801-101112.cofinf"
        );
        assert_eq!(
            local_backup_info_filename("series-20260801-101112.cofinf.atbak"),
            "series-20260801-101112.cofinf"
        );
        assert_eq!(local_backup_info_filename("plain.bin"), "plain.bin");
    }
}
