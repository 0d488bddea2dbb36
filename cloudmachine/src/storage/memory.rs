use super::backend::{BlobPage, BlobRange, BlobService, ContainerClient, StorageFile};
use crate::common::{CloudMachineError, CloudMachineResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct StoredBlob {
    data: Vec<u8>,
    content_type: Option<String>,
    etag: String,
}

type Containers = Arc<Mutex<HashMap<String, BTreeMap<String, StoredBlob>>>>;

/// Process-local blob service.
///
/// Starts with an empty `default` container. Missing containers and blobs
/// answer with the same status codes the real service uses (404 for
/// missing, 409 for an existing container or a conflicting upload).
pub struct InMemoryBlobService {
    account_url: String,
    containers: Containers,
    page_size: usize,
    versions: Arc<AtomicUsize>,
    close_count: AtomicUsize,
}

impl InMemoryBlobService {
    pub fn new(account_url: impl Into<String>) -> Self {
        let mut containers = HashMap::new();
        containers.insert("default".to_string(), BTreeMap::new());
        Self {
            account_url: account_url.into(),
            containers: Arc::new(Mutex::new(containers)),
            page_size: 5000,
            versions: Arc::new(AtomicUsize::new(0)),
            close_count: AtomicUsize::new(0),
        }
    }

    /// Caps the number of blobs returned per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn has_container(&self, name: &str) -> bool {
        lock(&self.containers).contains_key(name)
    }

    /// Names of every blob in `container`, sorted.
    pub fn blob_names(&self, container: &str) -> Vec<String> {
        lock(&self.containers)
            .get(container)
            .map(|blobs| blobs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn blob_content(&self, container: &str, name: &str) -> Option<Vec<u8>> {
        lock(&self.containers)
            .get(container)
            .and_then(|blobs| blobs.get(name))
            .map(|blob| blob.data.clone())
    }

    fn client(&self, name: &str) -> InMemoryContainerClient {
        InMemoryContainerClient {
            name: name.to_string(),
            url: format!("{}/{}", self.account_url.trim_end_matches('/'), name),
            containers: Arc::clone(&self.containers),
            page_size: self.page_size,
            versions: Arc::clone(&self.versions),
        }
    }
}

#[async_trait]
impl BlobService for InMemoryBlobService {
    fn account_url(&self) -> &str {
        &self.account_url
    }

    fn container_client(&self, name: &str) -> Arc<dyn ContainerClient> {
        Arc::new(self.client(name))
    }

    async fn create_container(&self, name: &str) -> CloudMachineResult<Arc<dyn ContainerClient>> {
        {
            let mut containers = lock(&self.containers);
            if containers.contains_key(name) {
                return Err(service_error(
                    "create_container",
                    409,
                    "ContainerAlreadyExists",
                ));
            }
            containers.insert(name.to_string(), BTreeMap::new());
        }
        Ok(Arc::new(self.client(name)))
    }

    async fn delete_container(&self, name: &str) -> CloudMachineResult<()> {
        self.client(name).delete_container().await
    }

    async fn close(&self) -> CloudMachineResult<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct InMemoryContainerClient {
    name: String,
    url: String,
    containers: Containers,
    page_size: usize,
    versions: Arc<AtomicUsize>,
}

impl InMemoryContainerClient {
    fn with_container<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut BTreeMap<String, StoredBlob>) -> CloudMachineResult<T>,
    ) -> CloudMachineResult<T> {
        let mut containers = lock(&self.containers);
        let blobs = containers
            .get_mut(&self.name)
            .ok_or_else(|| service_error(operation, 404, "ContainerNotFound"))?;
        f(blobs)
    }

    fn file(&self, name: &str, blob: &StoredBlob) -> StorageFile {
        StorageFile {
            name: name.to_string(),
            content_length: blob.data.len() as u64,
            content_type: blob.content_type.clone(),
            etag: Some(blob.etag.clone()),
            url: format!("{}/{}", self.url, name),
            content: None,
        }
    }
}

#[async_trait]
impl ContainerClient for InMemoryContainerClient {
    fn container_name(&self) -> &str {
        &self.name
    }

    async fn list_blobs(
        &self,
        prefix: Option<&str>,
        marker: Option<String>,
    ) -> CloudMachineResult<BlobPage> {
        self.with_container("list_blobs", |blobs| {
            let prefix = prefix.unwrap_or("");
            let mut matching = blobs
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .filter(|(name, _)| marker.as_deref().is_none_or(|m| name.as_str() >= m));

            let items: Vec<StorageFile> = matching
                .by_ref()
                .take(self.page_size)
                .map(|(name, blob)| self.file(name, blob))
                .collect();
            let next_marker = matching.next().map(|(name, _)| name.clone());

            Ok(BlobPage { items, next_marker })
        })
    }

    async fn upload_blob(
        &self,
        name: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
        overwrite: bool,
    ) -> CloudMachineResult<StorageFile> {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        self.with_container("upload_blob", |blobs| {
            if !overwrite && blobs.contains_key(name) {
                return Err(service_error("upload_blob", 409, "BlobAlreadyExists"));
            }
            let blob = StoredBlob {
                data,
                content_type: Some(content_type.unwrap_or("application/octet-stream").to_string()),
                etag: format!("\"0x{version:X}\""),
            };
            let file = self.file(name, &blob);
            blobs.insert(name.to_string(), blob);
            Ok(file)
        })
    }

    async fn download_range(
        &self,
        name: &str,
        offset: u64,
        length: u64,
    ) -> CloudMachineResult<BlobRange> {
        self.with_container("download_blob", |blobs| {
            let blob = blobs
                .get(name)
                .ok_or_else(|| service_error("download_blob", 404, "BlobNotFound"))?;
            let total = blob.data.len() as u64;
            let start = offset.min(total) as usize;
            let end = offset.saturating_add(length).min(total) as usize;
            Ok(BlobRange {
                data: blob.data[start..end].to_vec(),
                total_length: total,
            })
        })
    }

    async fn delete_blob(&self, name: &str) -> CloudMachineResult<()> {
        self.with_container("delete_blob", |blobs| {
            blobs
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| service_error("delete_blob", 404, "BlobNotFound"))
        })
    }

    async fn delete_container(&self) -> CloudMachineResult<()> {
        lock(&self.containers)
            .remove(&self.name)
            .map(|_| ())
            .ok_or_else(|| service_error("delete_container", 404, "ContainerNotFound"))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn service_error(operation: &str, status: u16, code: &str) -> CloudMachineError {
    CloudMachineError::Service {
        operation: operation.to_string(),
        status,
        code: code.to_string(),
        message: format!("{code} (in-memory blob service)"),
        request_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listing_pages_by_marker() {
        let service = InMemoryBlobService::new("memory://blob").with_page_size(2);
        let container = service.container_client("default");
        for name in ["a", "b", "c"] {
            container
                .upload_blob(name, b"x".to_vec(), None, true)
                .await
                .unwrap();
        }

        let first = container.list_blobs(None, None).await.unwrap();
        let second = container
            .list_blobs(None, first.next_marker.clone())
            .await
            .unwrap();

        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_marker.as_deref(), Some("c"));
        assert_eq!(second.items[0].name, "c");
        assert_eq!(second.next_marker, None);
    }

    #[tokio::test]
    async fn test_missing_container_is_not_found() {
        let service = InMemoryBlobService::new("memory://blob");

        let error = service
            .container_client("missing")
            .upload_blob("a", vec![], None, true)
            .await
            .unwrap_err();

        assert!(error.is_not_found());
        assert_eq!(error.service_code(), Some("ContainerNotFound"));
    }

    #[tokio::test]
    async fn test_create_existing_container_conflicts() {
        let service = InMemoryBlobService::new("memory://blob");

        let error = service.create_container("default").await.err().unwrap();

        assert!(error.is_conflict());
    }

    #[tokio::test]
    async fn test_download_range_past_end_is_empty() {
        let service = InMemoryBlobService::new("memory://blob");
        let container = service.container_client("default");
        container
            .upload_blob("a", b"hello".to_vec(), None, true)
            .await
            .unwrap();

        let tail = container.download_range("a", 3, 10).await.unwrap();
        let past = container.download_range("a", 9, 10).await.unwrap();

        assert_eq!(tail.data, b"lo");
        assert!(past.data.is_empty());
        assert_eq!(past.total_length, 5);
    }
}
