//! Thin container/object storage abstraction consumed by the drivers.
//!
//! The contract is deliberately minimal: list, get as a chunk stream, put
//! from a chunk stream, delete, plus container lookup/creation on the
//! interface. Implementations: local filesystem and S3.

pub mod filesystem;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageResult;

/// Minimal metadata for a stored object.
#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub name: String,
    pub size: u64,
}

/// A pull-based stream of byte chunks; an empty chunk signals EOF.
#[async_trait]
pub trait ChunkStream: Send {
    async fn next_chunk(&mut self) -> StorageResult<Bytes>;
}

/// A container (bucket/directory) holding stored objects.
#[async_trait]
pub trait StorageContainer: Send + Sync {
    fn name(&self) -> &str;

    async fn list_objects(&self, prefix: Option<&str>) -> StorageResult<Vec<ObjectSummary>>;

    /// Open an object for reading in chunks of `chunk_size` bytes.
    async fn get_object(
        &self,
        name: &str,
        chunk_size: usize,
    ) -> StorageResult<Box<dyn ChunkStream>>;

    /// Write an object by draining `source` to EOF.
    async fn put_object(
        &self,
        name: &str,
        source: &mut (dyn ChunkStream + '_),
    ) -> StorageResult<ObjectSummary>;

    async fn delete_object(&self, name: &str) -> StorageResult<()>;
}

/// An object-store endpoint able to resolve and create containers.
#[async_trait]
pub trait StorageInterface: Send + Sync {
    async fn get_container(&self, name: &str) -> StorageResult<Box<dyn StorageContainer>>;

    /// Create a container; fails with `container-already-exists` when the
    /// name is taken.
    async fn create_container(&self, name: &str) -> StorageResult<Box<dyn StorageContainer>>;
}

/// Adapt an in-memory buffer to a [`ChunkStream`].
pub struct BytesChunkStream {
    data: Vec<u8>,
    chunk_size: usize,
    offset: usize,
    eof: bool,
}

impl BytesChunkStream {
    pub fn new(data: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            data,
            chunk_size: chunk_size.max(1),
            offset: 0,
            eof: false,
        }
    }
}

#[async_trait]
impl ChunkStream for BytesChunkStream {
    async fn next_chunk(&mut self) -> StorageResult<Bytes> {
        if self.eof {
            return Ok(Bytes::new());
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = Bytes::copy_from_slice(&self.data[self.offset..end]);
        self.offset = end;
        if chunk.is_empty() {
            self.eof = true;
        }
        Ok(chunk)
    }
}

/// Drain a chunk stream into memory. Intended for small objects.
pub async fn collect_stream(stream: &mut dyn ChunkStream) -> StorageResult<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let chunk = stream.next_chunk().await?;
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}
