//! Error types for appliance fetches.

use thiserror::Error;

use crate::client::Endpoint;

/// Result type alias using [`FetchError`].
pub type Result<T> = std::result::Result<T, FetchError>;

/// Errors that can occur while fetching or decoding one appliance endpoint.
///
/// Every variant is recoverable: the caller skips the affected source for
/// the current cycle and tries again on the next one.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection, TLS or timeout failure.
    #[error("Request to {endpoint} failed: {source}")]
    Transport {
        endpoint: Endpoint,
        #[source]
        source: reqwest::Error,
    },

    /// The appliance answered with a non-2xx status (401/403 for bad credentials).
    #[error("{endpoint} returned HTTP {status}")]
    Status {
        endpoint: Endpoint,
        status: reqwest::StatusCode,
    },

    /// The response body is not valid JSON.
    #[error("Malformed JSON from {endpoint}: {source}")]
    Decode {
        endpoint: Endpoint,
        #[source]
        source: serde_json::Error,
    },

    /// The body is valid JSON but a field has an unexpected layout.
    #[error("Unexpected shape in {endpoint} at '{field}': expected {expected}")]
    Shape {
        endpoint: Endpoint,
        field: String,
        expected: &'static str,
    },

    /// The request could not be built (bad base URL).
    #[error("Invalid request for {endpoint}: {message}")]
    Request {
        endpoint: Endpoint,
        message: String,
    },
}

impl FetchError {
    /// Create a shape error for a field.
    pub fn shape(endpoint: Endpoint, field: impl Into<String>, expected: &'static str) -> Self {
        Self::Shape {
            endpoint,
            field: field.into(),
            expected,
        }
    }

    /// The endpoint this error belongs to.
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Self::Transport { endpoint, .. }
            | Self::Status { endpoint, .. }
            | Self::Decode { endpoint, .. }
            | Self::Shape { endpoint, .. }
            | Self::Request { endpoint, .. } => *endpoint,
        }
    }

    /// Stable label value describing the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } | Self::Request { .. } => "transport",
            Self::Status { .. } => "status",
            Self::Decode { .. } | Self::Shape { .. } => "decode",
        }
    }
}
