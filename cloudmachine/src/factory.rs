//! Construction of the backing services for each domain.
//!
//! The aggregate client never builds a service directly; it asks a
//! [`ServiceFactory`] once per domain, the first time that domain is
//! accessed. [`AzureServiceFactory`] talks to the real services,
//! [`InMemoryServiceFactory`] keeps everything in process.

use crate::common::CloudMachineResult;
use crate::config::{EndpointResolver, EnvSource, ResourceKind};
use crate::credential::{EnvironmentCredential, TokenCredential};
use crate::data::{InMemoryTableService, RestTableService, TableService};
use crate::messaging::{InMemoryMessageBus, MessageBus, ServiceBusMessageBus};
use crate::storage::{BlobService, InMemoryBlobService, RestBlobService};
use crate::transport::HttpTransport;
use async_trait::async_trait;
use std::sync::Arc;

/// Builds the service behind each domain client.
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    fn blob_service(
        &self,
        endpoint: &str,
        transport: Arc<dyn HttpTransport>,
    ) -> CloudMachineResult<Arc<dyn BlobService>>;

    fn table_service(
        &self,
        endpoint: &str,
        transport: Arc<dyn HttpTransport>,
    ) -> CloudMachineResult<Arc<dyn TableService>>;

    /// Opens the message bus for the resource `name` resolves to.
    async fn message_bus(
        &self,
        resolver: &EndpointResolver,
        name: Option<&str>,
    ) -> CloudMachineResult<Arc<dyn MessageBus>>;
}

/// Services backed by Azure Storage and Azure Service Bus.
pub struct AzureServiceFactory {
    credential: Arc<dyn TokenCredential>,
}

impl AzureServiceFactory {
    pub fn new(credential: Arc<dyn TokenCredential>) -> Self {
        Self { credential }
    }

    /// Uses a client-secret credential read from `env` when the first token
    /// is requested.
    pub fn from_env(env: Arc<dyn EnvSource>) -> Self {
        Self::new(Arc::new(EnvironmentCredential::new(env)))
    }
}

#[async_trait]
impl ServiceFactory for AzureServiceFactory {
    fn blob_service(
        &self,
        endpoint: &str,
        transport: Arc<dyn HttpTransport>,
    ) -> CloudMachineResult<Arc<dyn BlobService>> {
        Ok(Arc::new(RestBlobService::new(
            endpoint,
            transport,
            Arc::clone(&self.credential),
        )))
    }

    fn table_service(
        &self,
        endpoint: &str,
        transport: Arc<dyn HttpTransport>,
    ) -> CloudMachineResult<Arc<dyn TableService>> {
        Ok(Arc::new(RestTableService::new(
            endpoint,
            transport,
            Arc::clone(&self.credential),
        )))
    }

    async fn message_bus(
        &self,
        resolver: &EndpointResolver,
        name: Option<&str>,
    ) -> CloudMachineResult<Arc<dyn MessageBus>> {
        let connection_string = resolver.resolve(ResourceKind::ServiceBus, name)?;
        let bus = ServiceBusMessageBus::connect(&connection_string).await?;
        Ok(Arc::new(bus))
    }
}

/// Hands out one shared set of in-memory services.
///
/// Endpoints are still resolved and validated by the client, but the
/// services ignore them. The same instances are returned on every call, so
/// tests can inspect them through the accessors.
#[derive(Clone)]
pub struct InMemoryServiceFactory {
    blobs: Arc<InMemoryBlobService>,
    tables: Arc<InMemoryTableService>,
    bus: Arc<InMemoryMessageBus>,
}

impl InMemoryServiceFactory {
    pub fn new() -> Self {
        Self::with_services(
            InMemoryBlobService::new("memory://blob"),
            InMemoryTableService::new("memory://table"),
        )
    }

    /// Uses pre-configured services, e.g. with a small page size.
    pub fn with_services(blobs: InMemoryBlobService, tables: InMemoryTableService) -> Self {
        Self {
            blobs: Arc::new(blobs),
            tables: Arc::new(tables),
            bus: Arc::new(InMemoryMessageBus::new()),
        }
    }

    pub fn blobs(&self) -> &Arc<InMemoryBlobService> {
        &self.blobs
    }

    pub fn tables(&self) -> &Arc<InMemoryTableService> {
        &self.tables
    }

    pub fn bus(&self) -> &Arc<InMemoryMessageBus> {
        &self.bus
    }
}

impl Default for InMemoryServiceFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceFactory for InMemoryServiceFactory {
    fn blob_service(
        &self,
        endpoint: &str,
        _transport: Arc<dyn HttpTransport>,
    ) -> CloudMachineResult<Arc<dyn BlobService>> {
        log::debug!("Using in-memory blob service in place of {endpoint}");
        Ok(self.blobs.clone())
    }

    fn table_service(
        &self,
        endpoint: &str,
        _transport: Arc<dyn HttpTransport>,
    ) -> CloudMachineResult<Arc<dyn TableService>> {
        log::debug!("Using in-memory table service in place of {endpoint}");
        Ok(self.tables.clone())
    }

    async fn message_bus(
        &self,
        _resolver: &EndpointResolver,
        _name: Option<&str>,
    ) -> CloudMachineResult<Arc<dyn MessageBus>> {
        Ok(self.bus.clone())
    }
}
