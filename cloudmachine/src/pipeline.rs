use crate::common::{CloudMachineError, CloudMachineResult};
use crate::credential::{STORAGE_SCOPE, TokenCredential};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use std::sync::Arc;

/// Authorizes and sends data-plane requests for one storage service.
///
/// Every request gets a bearer token, the service API version and a request
/// date. Non-success responses become [`CloudMachineError::Service`].
#[derive(Clone)]
pub struct RestPipeline {
    transport: Arc<dyn HttpTransport>,
    credential: Arc<dyn TokenCredential>,
    api_version: &'static str,
}

impl RestPipeline {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credential: Arc<dyn TokenCredential>,
        api_version: &'static str,
    ) -> Self {
        Self {
            transport,
            credential,
            api_version,
        }
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    /// Sends `request`, returning the response whatever its status.
    pub async fn send_raw(&self, request: HttpRequest) -> CloudMachineResult<HttpResponse> {
        let token = self.credential.get_token(STORAGE_SCOPE).await?;
        let request = request
            .header("Authorization", format!("Bearer {}", token.token))
            .header("x-ms-version", self.api_version)
            .header("x-ms-date", http_date());

        self.transport.send(request).await
    }

    /// Sends `request` and fails on any non-success status.
    pub async fn send(
        &self,
        operation: &str,
        request: HttpRequest,
    ) -> CloudMachineResult<HttpResponse> {
        log::debug!("{operation}: {} {}", request.method, request.url);
        let response = self.send_raw(request).await?;

        if !response.is_success() {
            return Err(CloudMachineError::from_response(operation, &response));
        }
        Ok(response)
    }
}

/// RFC 1123 date as required by the `x-ms-date` header.
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Percent-encodes a blob or entity path, keeping `/` separators.
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Joins an account endpoint and a path without doubling slashes.
pub fn join_url(endpoint: &str, path: &str) -> String {
    format!(
        "{}/{}",
        endpoint.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_path_keeps_separators() {
        assert_eq!(
            encode_path("reports/2024 q1/summary.csv"),
            "reports/2024%20q1/summary.csv"
        );
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://cm.blob.core.windows.net/", "/default"),
            "https://cm.blob.core.windows.net/default"
        );
    }

    #[test]
    fn test_http_date_format() {
        let date = http_date();
        assert!(date.ends_with(" GMT"));
        assert_eq!(date.len(), 29);
    }
}
