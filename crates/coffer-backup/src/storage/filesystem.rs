//! Local filesystem storage: a container is a directory, an object is a
//! file inside it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{ChunkStream, ObjectSummary, StorageContainer, StorageInterface};
use crate::error::{StorageError, StorageResult};

/// Filesystem-backed storage interface. Container names are directory paths.
pub struct FilesystemStorage;

impl FilesystemStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FilesystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageInterface for FilesystemStorage {
    async fn get_container(&self, name: &str) -> StorageResult<Box<dyn StorageContainer>> {
        let root = PathBuf::from(name);
        if !root.is_dir() {
            return Err(StorageError::ContainerNotFound(name.to_string()));
        }
        Ok(Box::new(FilesystemContainer {
            name: name.to_string(),
            root,
        }))
    }

    async fn create_container(&self, name: &str) -> StorageResult<Box<dyn StorageContainer>> {
        let root = PathBuf::from(name);
        if root.exists() {
            return Err(StorageError::ContainerAlreadyExists(name.to_string()));
        }
        fs::create_dir_all(&root).await?;
        Ok(Box::new(FilesystemContainer {
            name: name.to_string(),
            root,
        }))
    }
}

/// A directory acting as an object container.
pub struct FilesystemContainer {
    name: String,
    root: PathBuf,
}

impl FilesystemContainer {
    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl StorageContainer for FilesystemContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_objects(&self, prefix: Option<&str>) -> StorageResult<Vec<ObjectSummary>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(p) = prefix {
                if !name.starts_with(p) {
                    continue;
                }
            }
            out.push(ObjectSummary {
                name,
                size: meta.len(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn get_object(
        &self,
        name: &str,
        chunk_size: usize,
    ) -> StorageResult<Box<dyn ChunkStream>> {
        let stream = FileChunkStream::open(&self.object_path(name), chunk_size)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StorageError::ObjectNotFound(name.to_string()),
                _ => StorageError::Io(e),
            })?;
        Ok(Box::new(stream))
    }

    async fn put_object(
        &self,
        name: &str,
        source: &mut (dyn ChunkStream + '_),
    ) -> StorageResult<ObjectSummary> {
        let path = self.object_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&path).await?;
        let mut size = 0u64;
        loop {
            let chunk = source.next_chunk().await?;
            if chunk.is_empty() {
                break;
            }
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(ObjectSummary {
            name: name.to_string(),
            size,
        })
    }

    async fn delete_object(&self, name: &str) -> StorageResult<()> {
        fs::remove_file(self.object_path(name))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StorageError::ObjectNotFound(name.to_string()),
                _ => StorageError::Io(e),
            })
    }
}

/// Chunked reads over a local file. Also used directly by the decrypt-only
/// path, which takes stored objects from disk instead of a container.
pub struct FileChunkStream {
    file: fs::File,
    chunk_size: usize,
    eof: bool,
}

impl FileChunkStream {
    /// Open a file for chunked reading.
    pub async fn open(path: &Path, chunk_size: usize) -> std::io::Result<Self> {
        let file = fs::File::open(path).await?;
        Ok(Self {
            file,
            chunk_size: chunk_size.max(1),
            eof: false,
        })
    }
}

#[async_trait]
impl ChunkStream for FileChunkStream {
    async fn next_chunk(&mut self) -> StorageResult<Bytes> {
        if self.eof {
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0usize;
        while filled < self.chunk_size {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        if buf.is_empty() {
            self.eof = true;
        }
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{collect_stream, BytesChunkStream};

    #[tokio::test]
    async fn container_create_get_and_object_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("store");
        let storage = FilesystemStorage::new();

        let container = storage
            .create_container(dir.to_str().unwrap())
            .await
            .unwrap();
        // Creating again collides.
        assert!(matches!(
            storage.create_container(dir.to_str().unwrap()).await,
            Err(StorageError::ContainerAlreadyExists(_))
        ));

        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
        let mut source = BytesChunkStream::new(data.clone(), 4096);
        let summary = container.put_object("obj1.atbak", &mut source).await.unwrap();
        assert_eq!(summary.size, data.len() as u64);

        let mut stream = container.get_object("obj1.atbak", 1000).await.unwrap();
        let read_back = collect_stream(stream.as_mut()).await.unwrap();
        assert_eq!(read_back, data);

        let listed = container.list_objects(Some("obj")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "obj1.atbak");
        assert!(container.list_objects(Some("zzz")).await.unwrap().is_empty());

        container.delete_object("obj1.atbak").await.unwrap();
        assert!(matches!(
            container.delete_object("obj1.atbak").await,
            Err(StorageError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_container_and_object_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new();
        let missing = tmp.path().join("nope");
        assert!(matches!(
            storage.get_container(missing.to_str().unwrap()).await,
            Err(StorageError::ContainerNotFound(_))
        ));

        let dir = tmp.path().join("c");
        let container = storage.create_container(dir.to_str().unwrap()).await.unwrap();
        assert!(matches!(
            container.get_object("absent", 16).await,
            Err(StorageError::ObjectNotFound(_))
        ));
    }
}
