//! Error types for proxy operations.
//!
//! Listener-level failures ([`ProxyError::Bind`]) are returned from
//! `ForwardingProxy::start`. Everything else is contained in the task that
//! owns the connection and only ever logged.

use std::io;

use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listening socket could not be bound.
    #[error("Failed to bind proxy listener on {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// I/O error on a client or upstream socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Malformed CONNECT request.
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// Malformed plain HTTP request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// TLS error towards an upstream server.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The destination did not answer in time.
    #[error("Connection timeout")]
    Timeout,

    /// Failed to connect to the destination.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

impl ProxyError {
    /// Whether this is an ordinary peer hang-up rather than a real fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            ProxyError::Http(e) => e.is_incomplete_message() || e.is_canceled(),
            _ => false,
        }
    }
}
