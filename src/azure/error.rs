//! Error type shared by the Azure clients.

use thiserror::Error;

/// Errors raised by the Azure storage and batch clients.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AzureError {
    /// Raised when an account key is not valid base64.
    #[error("invalid {service} account key: {message}")]
    InvalidKey {
        /// Service the key belongs to (`storage` or `batch`).
        service: &'static str,
        /// Decoder error message.
        message: String,
    },
    /// Raised when an endpoint URL cannot be used to build requests.
    #[error("invalid {service} endpoint '{endpoint}'")]
    InvalidEndpoint {
        /// Service the endpoint belongs to.
        service: &'static str,
        /// The rejected endpoint value.
        endpoint: String,
    },
    /// Raised when a request cannot be sent or its response not read.
    #[error("transport failure during {operation}: {message}")]
    Transport {
        /// Operation being attempted (for example `put blob`).
        operation: &'static str,
        /// Error string from the HTTP client.
        message: String,
    },
    /// Raised when the service answers with a non-success status.
    #[error("{operation} failed with HTTP {status}: {message}")]
    Service {
        /// Operation being attempted.
        operation: &'static str,
        /// HTTP status code returned by the service.
        status: u16,
        /// Response body excerpt or status canonical reason.
        message: String,
    },
    /// Raised when a response body cannot be parsed.
    #[error("failed to parse {operation} response: {message}")]
    Response {
        /// Operation whose response was malformed.
        operation: &'static str,
        /// Parser error message.
        message: String,
    },
}

impl AzureError {
    pub(super) fn transport(operation: &'static str, err: &reqwest::Error) -> Self {
        Self::Transport {
            operation,
            message: err.to_string(),
        }
    }
}
