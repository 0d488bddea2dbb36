//! Environment-style key/value sources.
//!
//! Values are trimmed and blank values are treated as absent, so a variable
//! exported as `FOO=` behaves exactly like an unset one.

use std::collections::HashMap;

/// Read-only lookup of configuration values.
pub trait EnvSource: Send + Sync {
    /// Returns the trimmed, non-empty value for `key`.
    fn get(&self, key: &str) -> Option<String>;

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        match std::env::var(key) {
            Ok(value) => non_empty(&value),
            Err(std::env::VarError::NotUnicode(_)) => {
                log::warn!("Environment variable '{key}' contains invalid UTF-8, ignoring it");
                None
            }
            Err(std::env::VarError::NotPresent) => None,
        }
    }
}

/// An explicit map, used for dev environments and tests.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    values: HashMap<String, String>,
}

impl MapEnv {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapEnv {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl EnvSource for MapEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(|value| non_empty(value))
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
