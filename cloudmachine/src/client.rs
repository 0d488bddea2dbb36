//! The aggregate client.
//!
//! [`CloudMachineClient`] owns the resources shared by every domain: one
//! HTTP transport, one [`TaskPool`] and one [`EventListener`]. The storage,
//! messaging and table-data clients are built on first access and kept for
//! the lifetime of the aggregate.
//!
//! ```no_run
//! use cloudmachine::client::CloudMachineClient;
//!
//! # async fn demo() -> cloudmachine::common::CloudMachineResult<()> {
//! let client = CloudMachineClient::builder().build()?;
//! client.start()?;
//!
//! let storage = client.storage().await?;
//! storage.upload("hello.txt", "hello", None).await?;
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::common::{CloudMachineError, CloudMachineResult};
use crate::config::{
    CloudMachineConfig, EndpointResolver, EnvSource, ProcessEnv, ResourceKind,
    load_dev_environment,
};
use crate::data::CloudMachineTableData;
use crate::events::EventListener;
use crate::factory::{AzureServiceFactory, ServiceFactory};
use crate::messaging::CloudMachineServiceBus;
use crate::storage::CloudMachineStorage;
use crate::taskpool::TaskPool;
use crate::transport::{HttpTransport, ReqwestTransport, TransportWrapper};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{OnceCell, RwLock, RwLockReadGuard};

/// Assembles a [`CloudMachineClient`].
///
/// Anything not supplied is derived from the configuration: endpoints from
/// the process environment, a pooled [`ReqwestTransport`], a [`TaskPool`]
/// of [`CloudMachineConfig::max_workers`] and Azure-backed services using a
/// client-secret credential.
#[derive(Default)]
pub struct CloudMachineClientBuilder {
    config: CloudMachineConfig,
    env: Option<Arc<dyn EnvSource>>,
    resolver: Option<EndpointResolver>,
    transport: Option<Arc<dyn HttpTransport>>,
    factory: Option<Arc<dyn ServiceFactory>>,
    executor: Option<Arc<TaskPool>>,
}

impl CloudMachineClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: CloudMachineConfig) -> Self {
        self.config = config;
        self
    }

    /// Reads endpoints and credentials from `env` instead of the process
    /// environment.
    pub fn env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = Some(env);
        self
    }

    /// Resolves endpoints from the local environment `name` provisioned
    /// under `project_dir`.
    pub fn dev_environment(mut self, project_dir: &Path, name: &str) -> CloudMachineResult<Self> {
        let values = load_dev_environment(project_dir, name)?;
        self.resolver = Some(EndpointResolver::from_dev_environment(values));
        Ok(self)
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn factory(mut self, factory: Arc<dyn ServiceFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn executor(mut self, executor: Arc<TaskPool>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Fails with [`CloudMachineError::ConfigurationMissing`] when the blob or
    /// table endpoint cannot be resolved. Credentials are not read until the
    /// first request that needs a token.
    pub fn build(self) -> CloudMachineResult<CloudMachineClient> {
        let env = self.env.unwrap_or_else(|| Arc::new(ProcessEnv));
        let resolver = self
            .resolver
            .unwrap_or_else(|| EndpointResolver::new(self.config.env_prefix(), Arc::clone(&env)));
        let resource_name = self.config.resource_name().map(str::to_string);

        let blob_endpoint = resolver.resolve(ResourceKind::Blob, resource_name.as_deref())?;
        let table_endpoint = resolver.resolve(ResourceKind::Table, resource_name.as_deref())?;

        let factory: Arc<dyn ServiceFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(AzureServiceFactory::from_env(Arc::clone(&env))),
        };
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::from_config(&self.config)?),
        };
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(TaskPool::new(self.config.max_workers())));

        log::info!(
            "CloudMachine client created (blob: {blob_endpoint}, table: {table_endpoint}, workers: {})",
            executor.max_workers()
        );

        Ok(CloudMachineClient {
            resolver,
            resource_name,
            blob_endpoint,
            table_endpoint,
            transport,
            executor,
            events: Arc::new(EventListener::new()),
            factory,
            storage: OnceCell::new(),
            messaging: OnceCell::new(),
            data: OnceCell::new(),
            lifecycle: RwLock::new(()),
            closed: AtomicBool::new(false),
        })
    }
}

/// One owner for the storage, messaging and table-data clients of a
/// provisioned resource.
pub struct CloudMachineClient {
    resolver: EndpointResolver,
    resource_name: Option<String>,
    blob_endpoint: String,
    table_endpoint: String,
    transport: Arc<dyn HttpTransport>,
    executor: Arc<TaskPool>,
    events: Arc<EventListener>,
    factory: Arc<dyn ServiceFactory>,
    storage: OnceCell<CloudMachineStorage>,
    messaging: OnceCell<CloudMachineServiceBus>,
    data: OnceCell<CloudMachineTableData>,
    /// Held shared while a domain is being built and exclusively by
    /// [`close`](CloudMachineClient::close), so close never misses a domain
    /// that finishes initializing after it started.
    lifecycle: RwLock<()>,
    closed: AtomicBool,
}

impl CloudMachineClient {
    pub fn builder() -> CloudMachineClientBuilder {
        CloudMachineClientBuilder::new()
    }

    /// Builds a client entirely from the process environment.
    pub fn from_env() -> CloudMachineResult<Self> {
        Self::builder().build()
    }

    pub fn blob_endpoint(&self) -> &str {
        &self.blob_endpoint
    }

    pub fn table_endpoint(&self) -> &str {
        &self.table_endpoint
    }

    pub fn resolver(&self) -> &EndpointResolver {
        &self.resolver
    }

    pub fn transport(&self) -> Arc<dyn HttpTransport> {
        Arc::clone(&self.transport)
    }

    pub fn executor(&self) -> &Arc<TaskPool> {
        &self.executor
    }

    /// The listener blob events are published to.
    pub fn events(&self) -> &Arc<EventListener> {
        &self.events
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Starts event dispatch. Events published before this are delivered
    /// once it runs; calling it again is a no-op.
    pub fn start(&self) -> CloudMachineResult<()> {
        self.ensure_open()?;
        self.events.start()
    }

    /// Stops event dispatch for good and waits for the dispatch thread.
    /// Returns whether a running thread was joined.
    pub async fn stop(&self) -> bool {
        self.events.close();
        self.join_listener().await
    }

    /// The storage client, built on first access.
    pub async fn storage(&self) -> CloudMachineResult<&CloudMachineStorage> {
        let _open = self.open_guard().await?;
        self.storage
            .get_or_try_init(|| async {
                let service = self
                    .factory
                    .blob_service(&self.blob_endpoint, self.shared_transport())?;
                log::info!("Storage domain initialized");
                Ok::<_, CloudMachineError>(
                    CloudMachineStorage::new(service, Arc::clone(&self.executor))
                        .with_events(Arc::clone(&self.events)),
                )
            })
            .await
    }

    /// The messaging client, built on first access.
    pub async fn messaging(&self) -> CloudMachineResult<&CloudMachineServiceBus> {
        let _open = self.open_guard().await?;
        self.messaging
            .get_or_try_init(|| async {
                let bus = self
                    .factory
                    .message_bus(&self.resolver, self.resource_name.as_deref())
                    .await?;
                log::info!("Messaging domain initialized");
                Ok::<_, CloudMachineError>(CloudMachineServiceBus::new(bus))
            })
            .await
    }

    /// The table-data client, built on first access.
    pub async fn data(&self) -> CloudMachineResult<&CloudMachineTableData> {
        let _open = self.open_guard().await?;
        self.data
            .get_or_try_init(|| async {
                let service = self
                    .factory
                    .table_service(&self.table_endpoint, self.shared_transport())?;
                log::info!("Table data domain initialized");
                Ok::<_, CloudMachineError>(CloudMachineTableData::new(service))
            })
            .await
    }

    /// Releases everything the client owns.
    ///
    /// Waits for domain clients that are still being built. The listener is
    /// told to stop first, then every domain client that was
    /// built is closed, then the listener thread is joined and the worker pool
    /// shut down. The transport is closed last. A failure in one step does not
    /// skip the others; all failures are reported together.
    ///
    /// Closing twice is a no-op. Domain accessors fail with
    /// [`CloudMachineError::Closed`] afterwards.
    pub async fn close(&self) -> CloudMachineResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("CloudMachine client already closed");
            return Ok(());
        }

        log::info!("Closing CloudMachine client");
        let _exclusive = self.lifecycle.write().await;
        self.events.close();

        let mut errors = Vec::new();
        if let Some(storage) = self.storage.get() {
            if let Err(e) = storage.close().await {
                log::warn!("Failed to close storage client: {e}");
                errors.push(format!("storage: {e}"));
            }
        }
        if let Some(messaging) = self.messaging.get() {
            if let Err(e) = messaging.close().await {
                log::warn!("Failed to close messaging client: {e}");
                errors.push(format!("messaging: {e}"));
            }
        }
        if let Some(data) = self.data.get() {
            if let Err(e) = data.close().await {
                log::warn!("Failed to close table data client: {e}");
                errors.push(format!("data: {e}"));
            }
        }

        self.join_listener().await;
        self.executor.shutdown();

        if let Err(e) = self.transport.close().await {
            log::warn!("Failed to close transport: {e}");
            errors.push(format!("transport: {e}"));
        }

        if errors.is_empty() {
            log::info!("CloudMachine client closed");
            Ok(())
        } else {
            Err(CloudMachineError::Internal(format!(
                "Failed to close {} component(s): {}",
                errors.len(),
                errors.join("; ")
            )))
        }
    }

    fn ensure_open(&self) -> CloudMachineResult<()> {
        if self.is_closed() {
            return Err(CloudMachineError::Closed);
        }
        Ok(())
    }

    async fn open_guard(&self) -> CloudMachineResult<RwLockReadGuard<'_, ()>> {
        self.ensure_open()?;
        let guard = self.lifecycle.read().await;
        // close may have won the race for the lock
        self.ensure_open()?;
        Ok(guard)
    }

    fn shared_transport(&self) -> Arc<dyn HttpTransport> {
        Arc::new(TransportWrapper::new(Arc::clone(&self.transport)))
    }

    async fn join_listener(&self) -> bool {
        let events = Arc::clone(&self.events);
        match tokio::task::spawn_blocking(move || events.join()).await {
            Ok(joined) => joined,
            Err(e) => {
                log::warn!("Failed to join event listener: {e}");
                false
            }
        }
    }
}
