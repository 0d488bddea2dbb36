//! Locally provisioned environments.
//!
//! Provisioning writes one `.env` file per environment under
//! `<project>/.azure/<env-name>/.env`. Only the `AZURE_CLOUDMACHINE_*` keys
//! matter to the client; they are returned with that prefix stripped so the
//! map can back an [`EndpointResolver`](super::EndpointResolver) directly.

use super::endpoint::DEFAULT_ENV_PREFIX;
use super::env::MapEnv;
use crate::common::{CloudMachineError, CloudMachineResult};
use std::path::Path;

/// Environment name of the local deployment for `name`.
pub fn dev_environment_name(name: &str) -> String {
    format!("cloudmachine-{}-local", name.to_lowercase())
}

/// Loads the local environment `name` from `<project_dir>/.azure`.
///
/// # Errors
///
/// Returns [`CloudMachineError::ConfigurationMissing`] when the `.azure`
/// directory or the environment's `.env` file does not exist, and
/// [`CloudMachineError::Serialization`] when the file cannot be parsed.
pub fn load_dev_environment(project_dir: &Path, name: &str) -> CloudMachineResult<MapEnv> {
    let azd_dir = project_dir.join(".azure");
    if !azd_dir.is_dir() {
        return Err(CloudMachineError::configuration_missing(
            azd_dir.display().to_string(),
        ));
    }

    let env_name = dev_environment_name(name);
    let env_file = azd_dir.join(&env_name).join(".env");
    if !env_file.is_file() {
        return Err(CloudMachineError::configuration_missing(
            env_file.display().to_string(),
        ));
    }

    log::info!("Loading local environment '{env_name}'");

    let prefix = format!("{DEFAULT_ENV_PREFIX}_");
    let trimmed: Vec<(String, String)> = read_env_file(&env_file)?
        .into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .map(|stripped| (stripped.to_string(), value))
        })
        .collect();

    log::debug!("Loaded {} CloudMachine settings", trimmed.len());
    Ok(trimmed.into_iter().collect())
}

/// Parses `path` without exporting anything into the process environment.
// dotenv's non-iterator loaders all write to the process environment
#[allow(deprecated)]
fn read_env_file(path: &Path) -> CloudMachineResult<Vec<(String, String)>> {
    let entries = dotenv::from_path_iter(path).map_err(|e| {
        CloudMachineError::Serialization(format!("Failed to read {}: {e}", path.display()))
    })?;

    entries
        .map(|entry| {
            entry.map_err(|e| {
                CloudMachineError::Serialization(format!(
                    "Failed to parse {}: {e}",
                    path.display()
                ))
            })
        })
        .collect()
}
