use super::env::{EnvSource, MapEnv, ProcessEnv};
use crate::common::{CloudMachineError, CloudMachineResult};
use std::fmt;
use std::sync::Arc;

/// Namespace token shared by every provisioned variable.
pub const DEFAULT_ENV_PREFIX: &str = "AZURE_CLOUDMACHINE";

/// The service family an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Blob,
    Table,
    /// Resolves to a Service Bus connection string rather than a bare URL.
    ServiceBus,
}

impl ResourceKind {
    /// Variable suffix for this kind, e.g. `BLOB_ENDPOINT`.
    pub fn env_suffix(&self) -> &'static str {
        match self {
            ResourceKind::Blob => "BLOB_ENDPOINT",
            ResourceKind::Table => "TABLE_ENDPOINT",
            ResourceKind::ServiceBus => "SERVICEBUS_CONNECTION_STRING",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Blob => write!(f, "blob"),
            ResourceKind::Table => write!(f, "table"),
            ResourceKind::ServiceBus => write!(f, "servicebus"),
        }
    }
}

/// Resolves per-service endpoints from an [`EnvSource`].
///
/// Without a logical name the key is `{PREFIX}_{KIND}`; with one it is
/// `{PREFIX}_{NAME}_{KIND}` where the name is uppercased:
///
/// | kind | name | key |
/// |------|------|-----|
/// | blob | - | `AZURE_CLOUDMACHINE_BLOB_ENDPOINT` |
/// | table | `orders` | `AZURE_CLOUDMACHINE_ORDERS_TABLE_ENDPOINT` |
///
/// A missing key is always an error; the resolver never substitutes a
/// placeholder endpoint.
///
/// # Examples
///
/// ```no_run
/// use cloudmachine::config::{EndpointResolver, MapEnv, ResourceKind};
/// use std::sync::Arc;
///
/// let env = MapEnv::default().with(
///     "AZURE_CLOUDMACHINE_BLOB_ENDPOINT",
///     "https://cm.blob.core.windows.net/",
/// );
/// let resolver = EndpointResolver::new("AZURE_CLOUDMACHINE", Arc::new(env));
/// let endpoint = resolver.resolve(ResourceKind::Blob, None)?;
/// # Ok::<(), cloudmachine::common::CloudMachineError>(())
/// ```
#[derive(Clone)]
pub struct EndpointResolver {
    prefix: String,
    env: Arc<dyn EnvSource>,
}

impl EndpointResolver {
    pub fn new(prefix: impl Into<String>, env: Arc<dyn EnvSource>) -> Self {
        Self {
            prefix: prefix.into(),
            env,
        }
    }

    /// Resolver over the process environment with the default prefix.
    pub fn from_process_env() -> Self {
        Self::new(DEFAULT_ENV_PREFIX, Arc::new(ProcessEnv))
    }

    /// Resolver over a loaded dev environment.
    ///
    /// Dev environment maps have the prefix already stripped, so keys are
    /// looked up without one.
    pub fn from_dev_environment(values: MapEnv) -> Self {
        Self::new("", Arc::new(values))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn env(&self) -> Arc<dyn EnvSource> {
        Arc::clone(&self.env)
    }

    /// The variable name consulted for `(kind, name)`.
    pub fn key_for(&self, kind: ResourceKind, name: Option<&str>) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(3);
        if !self.prefix.is_empty() {
            parts.push(self.prefix.clone());
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            parts.push(name.to_uppercase());
        }
        parts.push(kind.env_suffix().to_string());
        parts.join("_")
    }

    /// Resolves the endpoint for `(kind, name)`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudMachineError::ConfigurationMissing`] naming the key that
    /// was consulted when it is unset or blank.
    pub fn resolve(&self, kind: ResourceKind, name: Option<&str>) -> CloudMachineResult<String> {
        let key = self.key_for(kind, name);
        match self.env.get(&key) {
            Some(endpoint) => {
                log::debug!("Resolved {kind} endpoint from '{key}'");
                Ok(endpoint)
            }
            None => Err(CloudMachineError::configuration_missing(key)),
        }
    }
}

impl fmt::Debug for EndpointResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointResolver")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
