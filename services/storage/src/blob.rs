use crate::config::BlobConfig;
use crate::error::TransferError;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use futures::stream::{self, TryStreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

/// Public URL layout of stored photos
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEndpoint {
    base: String,
}

impl BlobEndpoint {
    /// Expand `{account}` and `{container}` in `template`
    pub fn new(template: &str, account: &str, container: &str) -> Self {
        let base = template
            .replace("{account}", account)
            .replace("{container}", container)
            .trim_end_matches('/')
            .to_string();
        Self { base }
    }

    pub fn from_config(config: &BlobConfig) -> Self {
        Self::new(&config.url_template, &config.account, &config.container)
    }

    /// Final URL of a blob
    pub fn url_for(&self, blob_name: &str) -> String {
        format!("{}/{}", self.base, blob_name)
    }
}

/// Moves one file into blob storage. It only reports success or failure and
/// knows nothing about job status, photo rows or the bus.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobTransfer: Send + Sync {
    /// Upload the full content of `file` as `blob_name`
    async fn upload_file(&self, file: File, blob_name: &str) -> Result<(), TransferError>;
}

/// A block accepted by the storage service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBlock {
    pub part_number: i32,
    pub e_tag: String,
}

/// Block-level operations of an object storage API
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Store `body` as `blob_name` in one request
    async fn put_blob(&self, blob_name: &str, body: Vec<u8>) -> Result<(), TransferError>;

    /// Start a block upload and return its upload id
    async fn begin_blocks(&self, blob_name: &str) -> Result<String, TransferError>;

    async fn put_block(
        &self,
        blob_name: &str,
        upload_id: &str,
        part_number: i32,
        block: Vec<u8>,
    ) -> Result<UploadedBlock, TransferError>;

    /// Assemble the blob from `blocks`, which are ordered by part number
    async fn commit_blocks(
        &self,
        blob_name: &str,
        upload_id: &str,
        blocks: Vec<UploadedBlock>,
    ) -> Result<(), TransferError>;

    async fn abort_blocks(&self, blob_name: &str, upload_id: &str) -> Result<(), TransferError>;
}

/// S3-compatible object storage
pub struct S3BlockStore {
    client: S3Client,
    container: String,
}

impl S3BlockStore {
    /// Create a new S3 client for the configured container
    pub async fn new(config: &BlobConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        info!(container = %config.container, "S3 client initialized");

        Self {
            client: S3Client::from_conf(s3_config_builder.build()),
            container: config.container.clone(),
        }
    }
}

#[async_trait]
impl BlockStore for S3BlockStore {
    async fn put_blob(&self, blob_name: &str, body: Vec<u8>) -> Result<(), TransferError> {
        self.client
            .put_object()
            .bucket(&self.container)
            .key(blob_name)
            .content_type(content_type(blob_name))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| backend(blob_name, e))?;

        Ok(())
    }

    async fn begin_blocks(&self, blob_name: &str) -> Result<String, TransferError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.container)
            .key(blob_name)
            .content_type(content_type(blob_name))
            .send()
            .await
            .map_err(|e| backend(blob_name, e))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| backend(blob_name, "no upload id in response"))
    }

    async fn put_block(
        &self,
        blob_name: &str,
        upload_id: &str,
        part_number: i32,
        block: Vec<u8>,
    ) -> Result<UploadedBlock, TransferError> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.container)
            .key(blob_name)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(block))
            .send()
            .await
            .map_err(|e| backend(blob_name, e))?;

        Ok(UploadedBlock {
            part_number,
            e_tag: response.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn commit_blocks(
        &self,
        blob_name: &str,
        upload_id: &str,
        blocks: Vec<UploadedBlock>,
    ) -> Result<(), TransferError> {
        let parts = blocks
            .into_iter()
            .map(|block| {
                CompletedPart::builder()
                    .part_number(block.part_number)
                    .e_tag(block.e_tag)
                    .build()
            })
            .collect();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.container)
            .key(blob_name)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| backend(blob_name, e))?;

        Ok(())
    }

    async fn abort_blocks(&self, blob_name: &str, upload_id: &str) -> Result<(), TransferError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.container)
            .key(blob_name)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| backend(blob_name, e))?;

        Ok(())
    }
}

/// Block uploader: one request for files that fit in a block, otherwise
/// fixed-size blocks with at most `parallelism` in flight
pub struct BlockBlobTransfer {
    store: Arc<dyn BlockStore>,
    block_size: usize,
    parallelism: usize,
}

impl BlockBlobTransfer {
    pub fn new(store: Arc<dyn BlockStore>, block_size: usize, parallelism: usize) -> Self {
        Self {
            store,
            block_size: block_size.max(1),
            parallelism: parallelism.max(1),
        }
    }

    /// Transfer client for the S3-compatible service in `config`
    pub async fn s3(config: &BlobConfig) -> Self {
        let store = S3BlockStore::new(config).await;

        info!(
            block_size = config.block_size_bytes,
            parallelism = config.parallelism,
            "Blob transfer client initialized"
        );

        Self::new(Arc::new(store), config.block_size_bytes, config.parallelism)
    }

    async fn put_single(&self, mut file: File, blob_name: &str) -> Result<(), TransferError> {
        let mut body = Vec::new();
        file.read_to_end(&mut body).await?;

        self.store.put_blob(blob_name, body).await
    }

    async fn put_blocks(&self, file: File, blob_name: &str) -> Result<(), TransferError> {
        let upload_id = self.store.begin_blocks(blob_name).await?;

        let committed = match self.upload_blocks(file, blob_name, &upload_id).await {
            Ok(blocks) => {
                self.store
                    .commit_blocks(blob_name, &upload_id, blocks)
                    .await
            }
            Err(e) => Err(e),
        };

        if committed.is_err() {
            if let Err(abort_err) = self.store.abort_blocks(blob_name, &upload_id).await {
                warn!(blob = %blob_name, error = %abort_err, "Failed to abort block upload");
            }
        }
        committed
    }

    /// Read fixed-size blocks lazily and keep at most `parallelism` in flight
    async fn upload_blocks(
        &self,
        file: File,
        blob_name: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedBlock>, TransferError> {
        let block_size = self.block_size;

        let blocks = stream::try_unfold((file, 1i32), move |(mut file, part_number)| async move {
            let block = match read_block(&mut file, block_size).await {
                Ok(block) => block,
                Err(e) => return Err(TransferError::from(e)),
            };
            if block.is_empty() {
                return Ok(None);
            }
            Ok::<_, TransferError>(Some(((part_number, block), (file, part_number + 1))))
        });

        let mut uploaded: Vec<UploadedBlock> = blocks
            .map_ok(|(part_number, block)| {
                let size = block.len();
                async move {
                    let uploaded = self
                        .store
                        .put_block(blob_name, upload_id, part_number, block)
                        .await?;
                    debug!(blob = %blob_name, part_number, size, "Block uploaded");
                    Ok::<_, TransferError>(uploaded)
                }
            })
            .try_buffer_unordered(self.parallelism)
            .try_collect()
            .await?;

        uploaded.sort_by_key(|block| block.part_number);
        Ok(uploaded)
    }
}

#[async_trait]
impl BlobTransfer for BlockBlobTransfer {
    #[instrument(skip(self, file))]
    async fn upload_file(&self, file: File, blob_name: &str) -> Result<(), TransferError> {
        let size = file.metadata().await?.len();

        if size <= self.block_size as u64 {
            self.put_single(file, blob_name).await?;
        } else {
            self.put_blocks(file, blob_name).await?;
        }

        info!(blob = %blob_name, size_bytes = size, "Blob uploaded");
        Ok(())
    }
}

/// Read up to `block_size` bytes; an empty block means end of file
async fn read_block(file: &mut File, block_size: usize) -> std::io::Result<Vec<u8>> {
    let mut block = Vec::with_capacity(block_size);
    file.take(block_size as u64).read_to_end(&mut block).await?;
    Ok(block)
}

fn backend(blob_name: &str, err: impl std::fmt::Display) -> TransferError {
    TransferError::Backend {
        blob: blob_name.to_string(),
        message: err.to_string(),
    }
}

/// Content type from the blob's file extension
fn content_type(blob_name: &str) -> &'static str {
    let extension = blob_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// In-process blob storage
#[derive(Default)]
pub struct MemoryBlobTransfer {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryBlobTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every upload of `blob_name`
    pub fn fail_blob(&self, blob_name: impl Into<String>) {
        self.failing.lock().insert(blob_name.into());
    }

    pub fn blob(&self, blob_name: &str) -> Option<Vec<u8>> {
        self.blobs.lock().get(blob_name).cloned()
    }
}

#[async_trait]
impl BlobTransfer for MemoryBlobTransfer {
    async fn upload_file(&self, mut file: File, blob_name: &str) -> Result<(), TransferError> {
        if self.failing.lock().contains(blob_name) {
            return Err(TransferError::Backend {
                blob: blob_name.to_string(),
                message: "upload rejected".to_string(),
            });
        }

        let mut content = Vec::new();
        file.read_to_end(&mut content).await?;
        self.blobs.lock().insert(blob_name.to_string(), content);
        Ok(())
    }
}
