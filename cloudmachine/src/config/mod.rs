//! # Configuration
//!
//! Client tuning knobs ([`CloudMachineConfig`]) and the resolution of
//! per-service endpoints from environment-style key/value sources.
//!
//! Endpoints are never hard-coded. They are provisioned out of band and
//! published as variables such as `AZURE_CLOUDMACHINE_BLOB_ENDPOINT`; see
//! [`EndpointResolver`] for the naming scheme and [`load_dev_environment`]
//! for reading a locally provisioned environment.

pub mod dev;
pub mod endpoint;
pub mod env;

pub use dev::{dev_environment_name, load_dev_environment};
pub use endpoint::{DEFAULT_ENV_PREFIX, EndpointResolver, ResourceKind};
pub use env::{EnvSource, MapEnv, ProcessEnv};

use serde::Deserialize;

/// Tuning for the shared resources owned by the aggregate client.
///
/// All fields are optional; accessors fall back to defaults.
///
/// # Examples
///
/// ```no_run
/// use cloudmachine::config::CloudMachineConfig;
///
/// let config = CloudMachineConfig::default().with_max_workers(4);
/// assert_eq!(config.max_workers(), 4);
/// assert_eq!(config.pool_max_idle_per_host(), 25);
/// ```
#[derive(Debug, Deserialize, Default, Clone)]
pub struct CloudMachineConfig {
    /// Prefix of every endpoint variable (default: `AZURE_CLOUDMACHINE`)
    env_prefix: Option<String>,
    /// Logical resource name used to namespace endpoint variables
    resource_name: Option<String>,
    /// Idle pooled connections kept per host (default: 25)
    pool_max_idle_per_host: Option<usize>,
    /// TCP connect timeout in seconds (default: 30)
    connect_timeout_secs: Option<u64>,
    /// Size of the shared worker pool (default: 8)
    max_workers: Option<usize>,
}

impl CloudMachineConfig {
    pub fn env_prefix(&self) -> &str {
        self.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX)
    }

    pub fn resource_name(&self) -> Option<&str> {
        self.resource_name.as_deref().filter(|n| !n.is_empty())
    }

    pub fn pool_max_idle_per_host(&self) -> usize {
        self.pool_max_idle_per_host.unwrap_or(25)
    }

    pub fn connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs.unwrap_or(30)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers.unwrap_or(8).max(1)
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    pub fn with_resource_name(mut self, name: impl Into<String>) -> Self {
        self.resource_name = Some(name.into());
        self
    }

    pub fn with_pool_max_idle_per_host(mut self, size: usize) -> Self {
        self.pool_max_idle_per_host = Some(size);
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CloudMachineConfig::default();

        assert_eq!(config.env_prefix(), "AZURE_CLOUDMACHINE");
        assert_eq!(config.resource_name(), None);
        assert_eq!(config.pool_max_idle_per_host(), 25);
        assert_eq!(config.connect_timeout_secs(), 30);
        assert_eq!(config.max_workers(), 8);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: CloudMachineConfig =
            serde_json::from_str(r#"{"resource_name": "orders", "max_workers": 0}"#).unwrap();

        assert_eq!(config.resource_name(), Some("orders"));
        // a zero-sized pool could never run anything
        assert_eq!(config.max_workers(), 1);
        assert_eq!(config.env_prefix(), DEFAULT_ENV_PREFIX);
    }
}
