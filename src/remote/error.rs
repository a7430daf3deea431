//! Error types for calls to the remote policy authority.

use thiserror::Error;

/// Errors returned by [`super::PolicyClient`].
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network or HTTP client failure.
    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The authority answered with a non-success status.
    #[error("Remote error: {status} - {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Message extracted from the response body.
        message: String,
    },

    /// The authority rejected the event key.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Response body could not be decoded.
    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// An endpoint URL could not be built from the configured base.
    #[error("Invalid API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

impl RemoteError {
    /// Whether the authority rejected the request itself (4xx).
    ///
    /// Retrying such a request cannot succeed.
    pub fn is_client_error(&self) -> bool {
        match self {
            RemoteError::Status { status, .. } => (400..500).contains(status),
            RemoteError::Authentication(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let err = RemoteError::Status {
            status: 503,
            message: "maintenance".to_string(),
        };
        assert_eq!(err.to_string(), "Remote error: 503 - maintenance");
    }

    #[test]
    fn test_client_error_classification() {
        let not_found = RemoteError::Status {
            status: 404,
            message: String::new(),
        };
        let server = RemoteError::Status {
            status: 502,
            message: String::new(),
        };

        assert!(not_found.is_client_error());
        assert!(!server.is_client_error());
        assert!(RemoteError::Authentication("expired".into()).is_client_error());
    }
}
