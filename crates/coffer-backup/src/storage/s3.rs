//! AWS S3 storage backend (the provider-native interface kind).

use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;

use super::{ChunkStream, ObjectSummary, StorageContainer, StorageInterface};
use crate::error::{StorageError, StorageResult};

/// Driver parameters understood by the S3 backend.
#[derive(Debug, Clone, Default)]
pub struct S3DriverParams {
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// AWS S3 storage interface. Container names are bucket names.
pub struct S3Storage {
    client: Client,
}

impl S3Storage {
    /// Build a client from driver parameters, falling back to the ambient
    /// AWS environment for anything not supplied.
    pub async fn new(params: S3DriverParams) -> StorageResult<Self> {
        let mut loader = aws_config::from_env();
        if let Some(region) = params.region {
            loader = loader.region(Region::new(region));
        }
        if let Some(endpoint) = params.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) = (params.access_key, params.secret_key) {
            let creds = aws_sdk_s3::config::Credentials::new(
                access_key, secret_key, None, None, "coffer",
            );
            loader = loader.credentials_provider(creds);
        }
        let config = loader.load().await;
        Ok(Self {
            client: Client::new(&config),
        })
    }

    fn map_error<E: std::fmt::Display>(err: E) -> StorageError {
        StorageError::S3(err.to_string())
    }
}

#[async_trait]
impl StorageInterface for S3Storage {
    async fn get_container(&self, name: &str) -> StorageResult<Box<dyn StorageContainer>> {
        self.client
            .head_bucket()
            .bucket(name)
            .send()
            .await
            .map_err(|_| StorageError::ContainerNotFound(name.to_string()))?;
        Ok(Box::new(S3Container {
            client: self.client.clone(),
            bucket: name.to_string(),
        }))
    }

    async fn create_container(&self, name: &str) -> StorageResult<Box<dyn StorageContainer>> {
        match self.client.create_bucket().bucket(name).send().await {
            Ok(_) => Ok(Box::new(S3Container {
                client: self.client.clone(),
                bucket: name.to_string(),
            })),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_bucket_already_exists()
                    || service_err.is_bucket_already_owned_by_you()
                {
                    return Err(StorageError::ContainerAlreadyExists(name.to_string()));
                }
                let text = service_err.to_string();
                if text.contains("InvalidBucketName") {
                    return Err(StorageError::InvalidContainerName(name.to_string()));
                }
                Err(StorageError::S3(text))
            }
        }
    }
}

/// An S3 bucket acting as an object container.
pub struct S3Container {
    client: Client,
    bucket: String,
}

#[async_trait]
impl StorageContainer for S3Container {
    fn name(&self) -> &str {
        &self.bucket
    }

    async fn list_objects(&self, prefix: Option<&str>) -> StorageResult<Vec<ObjectSummary>> {
        let mut out = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(prefix.map(str::to_string))
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(S3Storage::map_error)?;
            for object in resp.contents() {
                out.push(ObjectSummary {
                    name: object.key().unwrap_or_default().to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                });
            }
            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(out)
    }

    async fn get_object(
        &self,
        name: &str,
        chunk_size: usize,
    ) -> StorageResult<Box<dyn ChunkStream>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    StorageError::ObjectNotFound(name.to_string())
                } else {
                    StorageError::DownloadFailed(service_err.to_string())
                }
            })?;
        Ok(Box::new(S3ChunkStream {
            body: resp.body,
            chunk_size: chunk_size.max(1),
            pending: Vec::new(),
            body_done: false,
            eof: false,
        }))
    }

    async fn put_object(
        &self,
        name: &str,
        source: &mut (dyn ChunkStream + '_),
    ) -> StorageResult<ObjectSummary> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(S3Storage::map_error)?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| StorageError::UploadFailed("no multipart upload id".to_string()))?
            .to_string();

        let mut parts = Vec::new();
        let mut part_number = 1i32;
        let mut size = 0u64;
        let result: StorageResult<()> = async {
            loop {
                let chunk = source.next_chunk().await?;
                if chunk.is_empty() && part_number > 1 {
                    break;
                }
                size += chunk.len() as u64;
                let is_final = chunk.is_empty();
                let resp = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(name)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk))
                    .send()
                    .await
                    .map_err(S3Storage::map_error)?;
                parts.push(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(resp.e_tag().map(str::to_string))
                        .build(),
                );
                part_number += 1;
                if is_final {
                    break;
                }
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            let _ = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(name)
                .upload_id(&upload_id)
                .send()
                .await;
            return Err(err);
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(S3Storage::map_error)?;

        Ok(ObjectSummary {
            name: name.to_string(),
            size,
        })
    }

    async fn delete_object(&self, name: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(S3Storage::map_error)?;
        Ok(())
    }
}

/// Re-chunks the S3 response body to the caller's chunk size.
struct S3ChunkStream {
    body: ByteStream,
    chunk_size: usize,
    pending: Vec<u8>,
    body_done: bool,
    eof: bool,
}

#[async_trait]
impl ChunkStream for S3ChunkStream {
    async fn next_chunk(&mut self) -> StorageResult<Bytes> {
        if self.eof {
            return Ok(Bytes::new());
        }
        while !self.body_done && self.pending.len() < self.chunk_size {
            match self
                .body
                .try_next()
                .await
                .map_err(|e| StorageError::DownloadFailed(e.to_string()))?
            {
                Some(piece) => self.pending.extend_from_slice(&piece),
                None => self.body_done = true,
            }
        }
        let chunk: Vec<u8> = if self.pending.len() <= self.chunk_size {
            std::mem::take(&mut self.pending)
        } else {
            self.pending.drain(..self.chunk_size).collect()
        };
        if chunk.is_empty() {
            self.eof = true;
        }
        Ok(Bytes::from(chunk))
    }
}
