//! Bearer token acquisition for the storage and table REST endpoints.

use crate::common::{CloudMachineError, CloudMachineResult};
use crate::config::EnvSource;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, RwLock};

/// Scope requested for blob and table data-plane access.
pub const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// An access token and the instant it stops being valid.
#[derive(Clone, Debug)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Instant,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            token: token.into(),
            expires_at: Instant::now() + expires_in,
        }
    }

    /// True within five minutes of expiry.
    pub fn needs_refresh(&self) -> bool {
        let buffer = Duration::from_secs(300);
        Instant::now() + buffer >= self.expires_at
    }
}

/// Source of bearer tokens for a scope.
///
/// # Examples
///
/// ```no_run
/// use cloudmachine::credential::{AccessToken, TokenCredential};
/// use cloudmachine::common::CloudMachineResult;
/// use async_trait::async_trait;
/// use std::time::Duration;
///
/// struct FixedCredential;
///
/// #[async_trait]
/// impl TokenCredential for FixedCredential {
///     async fn get_token(&self, _scope: &str) -> CloudMachineResult<AccessToken> {
///         Ok(AccessToken::new("token", Duration::from_secs(3600)))
///     }
/// }
/// ```
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn get_token(&self, scope: &str) -> CloudMachineResult<AccessToken>;
}

/// A pre-issued token, for tests and emulators.
#[derive(Clone, Debug)]
pub struct StaticTokenCredential {
    token: String,
}

impl StaticTokenCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn get_token(&self, _scope: &str) -> CloudMachineResult<AccessToken> {
        Ok(AccessToken::new(
            self.token.clone(),
            Duration::from_secs(24 * 3600),
        ))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// OAuth2 client-credentials flow against Microsoft Entra ID.
///
/// Tokens are cached per scope and reused until they are within five
/// minutes of expiring.
pub struct ClientSecretCredential {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    authority_host: String,
    http_client: reqwest::Client,
    cache: RwLock<HashMap<String, AccessToken>>,
}

impl ClientSecretCredential {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            http_client: reqwest::Client::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Reads `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET`;
    /// `AZURE_AUTHORITY_HOST` optionally overrides the login endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CloudMachineError::ConfigurationMissing`] for the first
    /// required variable that is absent.
    pub fn from_env(env: &dyn EnvSource) -> CloudMachineResult<Self> {
        let required = |key: &str| {
            env.get(key)
                .ok_or_else(|| CloudMachineError::configuration_missing(key))
        };

        let mut credential = Self::new(
            required("AZURE_TENANT_ID")?,
            required("AZURE_CLIENT_ID")?,
            required("AZURE_CLIENT_SECRET")?,
        );
        if let Some(host) = env.get("AZURE_AUTHORITY_HOST") {
            credential.authority_host = host.trim_end_matches('/').to_string();
        }
        Ok(credential)
    }

    async fn request_token(&self, scope: &str) -> CloudMachineResult<AccessToken> {
        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host, self.tenant_id
        );
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope),
        ];

        let response = self
            .http_client
            .post(&token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                CloudMachineError::Authentication(format!("Failed to request token: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_info = response.json::<ErrorResponse>().await.ok();
            let detail = match error_info {
                Some(info) => format!(
                    "{} - {}",
                    info.error,
                    info.error_description.unwrap_or_default()
                ),
                None => format!("HTTP {status}"),
            };
            return Err(CloudMachineError::Authentication(detail));
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            CloudMachineError::Authentication(format!("Failed to parse token response: {e}"))
        })?;

        Ok(AccessToken::new(
            token_response.access_token,
            Duration::from_secs(token_response.expires_in),
        ))
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn get_token(&self, scope: &str) -> CloudMachineResult<AccessToken> {
        {
            let cache = self.cache.read().await;
            if let Some(token) = cache.get(scope).filter(|t| !t.needs_refresh()) {
                return Ok(token.clone());
            }
        }

        log::debug!("Requesting token for scope '{scope}'");
        let token = self.request_token(scope).await?;
        self.cache
            .write()
            .await
            .insert(scope.to_string(), token.clone());
        Ok(token)
    }
}

/// A [`ClientSecretCredential`] configured from the environment on the first
/// token request rather than at construction.
///
/// Missing variables surface as [`CloudMachineError::ConfigurationMissing`]
/// from [`get_token`](TokenCredential::get_token); a failed lookup is retried
/// on the next request.
pub struct EnvironmentCredential {
    env: Arc<dyn EnvSource>,
    inner: OnceCell<ClientSecretCredential>,
}

impl EnvironmentCredential {
    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self {
            env,
            inner: OnceCell::new(),
        }
    }
}

#[async_trait]
impl TokenCredential for EnvironmentCredential {
    async fn get_token(&self, scope: &str) -> CloudMachineResult<AccessToken> {
        let credential = self
            .inner
            .get_or_try_init(|| async {
                let credential = ClientSecretCredential::from_env(self.env.as_ref())?;
                log::debug!("Resolved client-secret credential from the environment");
                Ok::<_, CloudMachineError>(credential)
            })
            .await?;
        credential.get_token(scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapEnv;

    #[test]
    fn test_token_refresh_window() {
        assert!(!AccessToken::new("t", Duration::from_secs(3600)).needs_refresh());
        assert!(AccessToken::new("t", Duration::from_secs(60)).needs_refresh());
    }

    #[test]
    fn test_from_env_reports_first_missing_variable() {
        let env = MapEnv::default().with("AZURE_TENANT_ID", "tenant");

        let error = ClientSecretCredential::from_env(&env).err().unwrap();

        match error {
            CloudMachineError::ConfigurationMissing { key } => assert_eq!(key, "AZURE_CLIENT_ID"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_env_authority_override() {
        let env = MapEnv::default()
            .with("AZURE_TENANT_ID", "tenant")
            .with("AZURE_CLIENT_ID", "client")
            .with("AZURE_CLIENT_SECRET", "secret")
            .with("AZURE_AUTHORITY_HOST", "https://login.example.invalid/");

        let credential = ClientSecretCredential::from_env(&env).unwrap();

        assert_eq!(credential.authority_host, "https://login.example.invalid");
    }

    #[tokio::test]
    async fn test_static_credential() {
        let token = StaticTokenCredential::new("fixed")
            .get_token(STORAGE_SCOPE)
            .await
            .unwrap();

        assert_eq!(token.token, "fixed");
    }

    #[tokio::test]
    async fn test_environment_credential_resolves_on_first_request() {
        let credential =
            EnvironmentCredential::new(Arc::new(MapEnv::default().with("AZURE_TENANT_ID", "t")));

        let error = credential.get_token(STORAGE_SCOPE).await.err().unwrap();

        assert!(matches!(
            error,
            CloudMachineError::ConfigurationMissing { key } if key == "AZURE_CLIENT_ID"
        ));
        assert!(!credential.inner.initialized());
    }
}
