//! # Object storage
//!
//! [`CloudMachineStorage`] is the storage domain of the aggregate client. It
//! keeps one client per container, created on first use, and routes every
//! blob operation through that registry. Containers default to `default`,
//! which exists from construction and can never be deleted.
//!
//! Uploads, deletes and renames publish the matching [`BlobEvent`] to the
//! aggregate's event listener.

pub mod backend;
pub mod memory;
pub mod rest;

pub use backend::{BlobPage, BlobRange, BlobService, ContainerClient, StorageFile};
pub use memory::InMemoryBlobService;
pub use rest::RestBlobService;

use crate::cache::ClientCache;
use crate::common::{CloudMachineError, CloudMachineResult};
use crate::events::{BlobEvent, EventListener};
use crate::paging::paged;
use crate::taskpool::TaskPool;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;

/// Name of the container every storage root starts with.
pub const DEFAULT_CONTAINER: &str = "default";

/// Size of each chunk yielded by [`CloudMachineStorage::download`].
pub const DOWNLOAD_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Blob storage scoped to one account, with a per-container client cache.
pub struct CloudMachineStorage {
    service: Arc<dyn BlobService>,
    default_container: Arc<dyn ContainerClient>,
    containers: ClientCache<dyn ContainerClient>,
    events: Option<Arc<EventListener>>,
    executor: Arc<TaskPool>,
}

impl CloudMachineStorage {
    pub fn new(service: Arc<dyn BlobService>, executor: Arc<TaskPool>) -> Self {
        let default_container = service.container_client(DEFAULT_CONTAINER);
        log::info!("Storage client bound to {}", service.account_url());
        Self {
            service,
            default_container,
            containers: ClientCache::new(),
            events: None,
            executor,
        }
    }

    /// Publishes blob lifecycle events to `listener`.
    pub fn with_events(mut self, listener: Arc<EventListener>) -> Self {
        self.events = Some(listener);
        self
    }

    /// The underlying account-level service client.
    pub fn get_client(&self) -> Arc<dyn BlobService> {
        Arc::clone(&self.service)
    }

    /// Returns the cached client for `container`, creating it on first use.
    /// `None`, an empty name and `default` all select the default container.
    pub async fn container_client(&self, container: Option<&str>) -> Arc<dyn ContainerClient> {
        match container {
            None => Arc::clone(&self.default_container),
            Some(name) if name.is_empty() || name == DEFAULT_CONTAINER => {
                Arc::clone(&self.default_container)
            }
            Some(name) => {
                self.containers
                    .get_or_create(name, || self.service.container_client(name))
                    .await
            }
        }
    }

    /// Lazily lists blob names, optionally restricted to a prefix.
    pub async fn list(
        &self,
        prefix: Option<&str>,
        container: Option<&str>,
    ) -> BoxStream<'static, CloudMachineResult<String>> {
        self.list_files(prefix, container)
            .await
            .map_ok(|file| file.name)
            .boxed()
    }

    /// Lazily lists blob properties, optionally restricted to a prefix.
    pub async fn list_files(
        &self,
        prefix: Option<&str>,
        container: Option<&str>,
    ) -> BoxStream<'static, CloudMachineResult<StorageFile>> {
        let client = self.container_client(container).await;
        let prefix = prefix.map(str::to_string);

        paged(move |marker| {
            let client = Arc::clone(&client);
            let prefix = prefix.clone();
            async move {
                let page = client.list_blobs(prefix.as_deref(), marker).await?;
                Ok((page.items, page.next_marker))
            }
        })
    }

    /// Uploads `data` as `name`, replacing any existing blob.
    pub async fn upload(
        &self,
        name: &str,
        data: impl Into<Vec<u8>>,
        container: Option<&str>,
    ) -> CloudMachineResult<StorageFile> {
        self.upload_with_content_type(name, data, None, container)
            .await
    }

    pub async fn upload_with_content_type(
        &self,
        name: &str,
        data: impl Into<Vec<u8>>,
        content_type: Option<&str>,
        container: Option<&str>,
    ) -> CloudMachineResult<StorageFile> {
        let client = self.container_client(container).await;
        let file = client
            .upload_blob(name, data.into(), content_type, true)
            .await?;

        log::debug!("Uploaded '{name}' to '{}'", client.container_name());
        self.publish(BlobEvent::created(client.container_name(), name));
        Ok(file)
    }

    /// Uploads every `(name, data)` pair concurrently on the shared worker
    /// pool. Files are returned in input order; the first failure is
    /// reported after every upload has finished.
    pub async fn upload_many(
        &self,
        items: Vec<(String, Vec<u8>)>,
        container: Option<&str>,
    ) -> CloudMachineResult<Vec<StorageFile>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let client = self.container_client(container).await;
        let handles: Vec<_> = items
            .into_iter()
            .map(|(name, data)| {
                let client = Arc::clone(&client);
                self.executor.spawn(async move {
                    let result = client.upload_blob(&name, data, None, true).await;
                    (name, result)
                })
            })
            .collect();

        let mut files = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            let outcome = match handle.await {
                Ok(Some((name, Ok(file)))) => {
                    self.publish(BlobEvent::created(client.container_name(), &name));
                    Ok(file)
                }
                Ok(Some((name, Err(e)))) => {
                    log::warn!("Upload of '{name}' failed: {e}");
                    Err(e)
                }
                Ok(None) => Err(CloudMachineError::Closed),
                Err(e) => Err(CloudMachineError::Internal(format!("Upload task failed: {e}"))),
            };
            match outcome {
                Ok(file) => files.push(file),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(files),
        }
    }

    /// Lazily downloads `name` in chunks of [`DOWNLOAD_CHUNK_SIZE`].
    pub async fn download(
        &self,
        name: &str,
        container: Option<&str>,
    ) -> BoxStream<'static, CloudMachineResult<Vec<u8>>> {
        let client = self.container_client(container).await;
        let name = name.to_string();

        stream::try_unfold(Some(0u64), move |next| {
            let client = Arc::clone(&client);
            let name = name.clone();
            async move {
                let Some(offset) = next else {
                    return Ok(None);
                };
                let range = client
                    .download_range(&name, offset, DOWNLOAD_CHUNK_SIZE)
                    .await?;
                if range.data.is_empty() {
                    return Ok(None);
                }

                let end = offset + range.data.len() as u64;
                let next = (end < range.total_length).then_some(end);
                Ok(Some((range.data, next)))
            }
        })
        .boxed()
    }

    /// Downloads `name` into memory.
    pub async fn download_all(
        &self,
        name: &str,
        container: Option<&str>,
    ) -> CloudMachineResult<Vec<u8>> {
        let chunks: Vec<Vec<u8>> = self.download(name, container).await.try_collect().await?;
        Ok(chunks.concat())
    }

    pub async fn delete(&self, name: &str, container: Option<&str>) -> CloudMachineResult<()> {
        let client = self.container_client(container).await;
        client.delete_blob(name).await?;

        log::debug!("Deleted '{name}' from '{}'", client.container_name());
        self.publish(BlobEvent::deleted(client.container_name(), name));
        Ok(())
    }

    /// Copies `from` to `to` within one container, then deletes `from`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudMachineError::InvalidArgument`] when `from` and `to`
    /// name the same blob; nothing is read or written in that case.
    pub async fn rename(
        &self,
        from: &str,
        to: &str,
        container: Option<&str>,
    ) -> CloudMachineResult<StorageFile> {
        if from == to {
            return Err(CloudMachineError::InvalidArgument(format!(
                "cannot rename '{from}' onto itself"
            )));
        }

        let client = self.container_client(container).await;
        let data = self.download_all(from, container).await?;
        let file = client.upload_blob(to, data, None, true).await?;
        client.delete_blob(from).await?;

        log::debug!("Renamed '{from}' to '{to}' in '{}'", client.container_name());
        self.publish(BlobEvent::renamed(client.container_name(), from, to));
        Ok(file)
    }

    /// Creates a container and caches its client.
    pub async fn create_container(&self, name: &str) -> CloudMachineResult<()> {
        let client = self.service.create_container(name).await?;
        self.containers.insert(name, client).await;
        Ok(())
    }

    /// Deletes a container. The default container is protected regardless of
    /// case, and is rejected before any request is made.
    pub async fn delete_container(&self, name: &str) -> CloudMachineResult<()> {
        if name.eq_ignore_ascii_case(DEFAULT_CONTAINER) {
            return Err(CloudMachineError::ProtectedResource {
                name: name.to_string(),
            });
        }

        match self.containers.remove(name).await {
            Some(client) => client.delete_container().await,
            None => self.service.delete_container(name).await,
        }
    }

    /// Number of named container clients created so far.
    pub async fn cached_containers(&self) -> usize {
        self.containers.len().await
    }

    pub async fn close(&self) -> CloudMachineResult<()> {
        self.containers.drain().await;
        self.service.close().await?;
        log::info!("Storage client closed");
        Ok(())
    }

    fn publish(&self, event: BlobEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}
