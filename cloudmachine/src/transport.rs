//! Shared HTTP transport.
//!
//! Every REST-backed sub-client sends its requests through one
//! [`HttpTransport`] owned by the aggregate client. Sub-clients receive a
//! [`TransportWrapper`] whose `close` is a no-op, so closing a sub-client
//! never tears down the connection pool other clients still use. Only the
//! aggregate closes the real transport, once, as the last step of its
//! shutdown.

use crate::common::{CloudMachineError, CloudMachineResult};
use crate::config::CloudMachineConfig;
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A fully buffered outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A fully buffered response. Header names are stored lowercase.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> CloudMachineResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// The request execution capability every REST sub-client is built on.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Executes a request. Non-success statuses are returned as responses,
    /// not errors; only failures to obtain a response are errors.
    async fn send(&self, request: HttpRequest) -> CloudMachineResult<HttpResponse>;

    /// Releases pooled connections. Further sends fail with
    /// [`CloudMachineError::Closed`].
    async fn close(&self) -> CloudMachineResult<()> {
        Ok(())
    }
}

/// Production transport backed by a pooled [`reqwest::Client`].
pub struct ReqwestTransport {
    client: reqwest::Client,
    closed: AtomicBool,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
        }
    }

    /// Builds the default pooled transport from configuration.
    pub fn from_config(config: &CloudMachineConfig) -> CloudMachineResult<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.pool_max_idle_per_host())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs()))
            .build()
            .map_err(|e| {
                CloudMachineError::Transport(format!("HTTP client creation failed: {e}"))
            })?;

        log::debug!(
            "Built pooled HTTP transport (max idle per host: {})",
            config.pool_max_idle_per_host()
        );
        Ok(Self::new(client))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> CloudMachineResult<HttpResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CloudMachineError::Closed);
        }

        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(request.body).send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn close(&self) -> CloudMachineResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("HTTP transport closed");
        }
        Ok(())
    }
}

/// Shares a transport with sub-clients without handing them ownership of it.
#[derive(Clone)]
pub struct TransportWrapper {
    inner: Arc<dyn HttpTransport>,
}

impl TransportWrapper {
    pub fn new(inner: Arc<dyn HttpTransport>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl HttpTransport for TransportWrapper {
    async fn send(&self, request: HttpRequest) -> CloudMachineResult<HttpResponse> {
        self.inner.send(request).await
    }

    async fn close(&self) -> CloudMachineResult<()> {
        // owned by the aggregate client
        Ok(())
    }
}
