use crate::transport::HttpResponse;
use thiserror::Error;

/// Errors produced by the CloudMachine client and its domain sub-clients.
///
/// Service failures (not-found, conflict, authorization) are carried as
/// [`CloudMachineError::Service`] with the status and error code reported by
/// the backing service. The client never retries or translates them.
///
/// # Error Categories
///
/// ## Rejected before any network call
/// - [`ConfigurationMissing`] - a required endpoint or credential variable is absent
/// - [`ProtectedResource`] - attempt to delete the reserved default container
/// - [`InvalidQuery`] - malformed key lookup or unknown filter parameter
/// - [`InvalidArgument`] - arguments the operation cannot act on, such as renaming a blob onto itself
/// - [`Closed`] - the aggregate client (or a component of it) was closed
///
/// ## Propagated from the services
/// - [`Service`] - non-success response from a storage, table or messaging endpoint
/// - [`Transport`] - connection or I/O failure below the HTTP layer
/// - [`Authentication`] - token acquisition failed
/// - [`Messaging`] - AMQP-level failure from the Service Bus client
///
/// # Examples
///
/// ```no_run
/// use cloudmachine::common::CloudMachineError;
///
/// fn describe(error: &CloudMachineError) -> &'static str {
///     match error {
///         CloudMachineError::ConfigurationMissing { .. } => "provision the resource first",
///         CloudMachineError::Service { status: 404, .. } => "not found",
///         CloudMachineError::Service { status: 409, .. } => "already exists",
///         _ => "unexpected failure",
///     }
/// }
/// ```
///
/// [`ConfigurationMissing`]: CloudMachineError::ConfigurationMissing
/// [`ProtectedResource`]: CloudMachineError::ProtectedResource
/// [`InvalidQuery`]: CloudMachineError::InvalidQuery
/// [`InvalidArgument`]: CloudMachineError::InvalidArgument
/// [`Closed`]: CloudMachineError::Closed
/// [`Service`]: CloudMachineError::Service
/// [`Transport`]: CloudMachineError::Transport
/// [`Authentication`]: CloudMachineError::Authentication
/// [`Messaging`]: CloudMachineError::Messaging
#[derive(Debug, Error)]
pub enum CloudMachineError {
    /// A configuration key required to reach a resource is not set.
    #[error(
        "Configuration '{key}' not found. Provision the resource or set this variable in your .env file or environment."
    )]
    ConfigurationMissing { key: String },

    /// The resource is reserved and cannot be deleted.
    #[error("Resource '{name}' is protected and cannot be deleted")]
    ProtectedResource { name: String },

    /// The query could not be built.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The client or component has already been closed.
    #[error("Client is closed")]
    Closed,

    /// The backing service answered with a non-success status.
    #[error("Service error during {operation}: {code} (HTTP {status}) - {message}")]
    Service {
        operation: String,
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    /// The request never produced a response.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Token acquisition failed.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Service Bus client failure.
    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CloudMachineError {
    /// Builds a [`CloudMachineError::Service`] from a failed response.
    ///
    /// Storage and table endpoints both report the error code in the
    /// `x-ms-error-code` header; the body is kept as the message when the
    /// header is missing or the body is human readable.
    pub fn from_response(operation: impl Into<String>, response: &HttpResponse) -> Self {
        let status = response.status;
        let code = response
            .header("x-ms-error-code")
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP_{status}"));
        let body = response.text();
        let message = if body.trim().is_empty() {
            format!("HTTP {status} error")
        } else {
            body
        };

        Self::Service {
            operation: operation.into(),
            status,
            code,
            message,
            request_id: response.header("x-ms-request-id").map(str::to_string),
        }
    }

    pub fn configuration_missing(key: impl Into<String>) -> Self {
        Self::ConfigurationMissing { key: key.into() }
    }

    /// HTTP status of a service error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Service { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// Service error code, e.g. `TableAlreadyExists`.
    pub fn service_code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CloudMachineError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for CloudMachineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<quick_xml::DeError> for CloudMachineError {
    fn from(err: quick_xml::DeError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<azure_core::Error> for CloudMachineError {
    fn from(err: azure_core::Error) -> Self {
        Self::Messaging(err.to_string())
    }
}

// Result type alias for convenience
pub type CloudMachineResult<T> = Result<T, CloudMachineError>;
