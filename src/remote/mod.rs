//! Remote policy authority.
//!
//! The proctoring backend authenticates sessions, decides per request whether
//! traffic may pass, and records security incidents. [`PolicyClient`] speaks
//! its HTTP contract; the [`Validator`] and [`SessionApi`] traits are the
//! seams the proxy and the orchestrator depend on.

mod client;
mod error;
mod types;

use async_trait::async_trait;

use crate::proxy::ProxyConfig;

pub use client::{PolicyClient, UNREACHABLE_REASON, VALIDATION_ERROR_REASON};
pub use error::{RemoteError, RemoteResult};
pub use types::{DEFAULT_BLOCK_REASON, SecurityLogEntry, ValidationRequest, ValidationResult};

/// Per-request policy decision.
///
/// Implementations must fail closed: any failure to reach a decision yields
/// a blocked result, never an error.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Decide whether `request` may pass under the given proxy configuration.
    async fn validate(&self, config: &ProxyConfig, request: &ValidationRequest) -> ValidationResult;
}

/// Session-level calls made by the orchestrator.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Verify the event key.
    async fn authenticate(&self, event_key: &str) -> RemoteResult<()>;

    /// Report that the session ended.
    async fn disconnect(&self, event_key: &str) -> RemoteResult<()>;

    /// Switch monitoring on.
    async fn start_monitoring(&self, event_key: &str) -> RemoteResult<()>;

    /// Switch monitoring off.
    async fn stop_monitoring(&self, event_key: &str) -> RemoteResult<()>;

    /// Record a security incident.
    async fn log_security_event(&self, event_key: &str, entry: &SecurityLogEntry)
    -> RemoteResult<()>;
}
