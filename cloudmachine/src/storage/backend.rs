use crate::common::CloudMachineResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Properties of a stored blob, as returned by listings and uploads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageFile {
    pub name: String,
    pub content_length: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub url: String,
    /// Present only when the caller asked for the payload.
    pub content: Option<Vec<u8>>,
}

/// One page of a blob listing.
#[derive(Debug, Clone, Default)]
pub struct BlobPage {
    pub items: Vec<StorageFile>,
    pub next_marker: Option<String>,
}

/// A slice of a blob's payload plus the blob's full size.
#[derive(Debug, Clone, Default)]
pub struct BlobRange {
    pub data: Vec<u8>,
    pub total_length: u64,
}

/// Account-level blob operations.
#[async_trait]
pub trait BlobService: Send + Sync {
    fn account_url(&self) -> &str;

    /// Returns a client bound to `name` without contacting the service.
    fn container_client(&self, name: &str) -> Arc<dyn ContainerClient>;

    async fn create_container(&self, name: &str) -> CloudMachineResult<Arc<dyn ContainerClient>>;

    async fn delete_container(&self, name: &str) -> CloudMachineResult<()>;

    async fn close(&self) -> CloudMachineResult<()>;
}

/// Operations scoped to one container.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    fn container_name(&self) -> &str;

    async fn list_blobs(
        &self,
        prefix: Option<&str>,
        marker: Option<String>,
    ) -> CloudMachineResult<BlobPage>;

    async fn upload_blob(
        &self,
        name: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
        overwrite: bool,
    ) -> CloudMachineResult<StorageFile>;

    /// Reads up to `length` bytes starting at `offset`. Reading past the end
    /// returns an empty range.
    async fn download_range(
        &self,
        name: &str,
        offset: u64,
        length: u64,
    ) -> CloudMachineResult<BlobRange>;

    async fn delete_blob(&self, name: &str) -> CloudMachineResult<()>;

    async fn delete_container(&self) -> CloudMachineResult<()>;
}
