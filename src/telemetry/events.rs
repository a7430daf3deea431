//! Audit event types for structured logging.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events for security logging.
///
/// Each variant is serialized as a flat JSON object tagged with its
/// snake_case name under the `event` key.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A proctoring session was established.
    SessionConnect {
        /// Local port the forwarding proxy is bound to.
        port: u16,
    },

    /// A proctoring session was torn down.
    SessionDisconnect {
        /// Port the session was using, if a proxy had been started.
        port: Option<u16>,
    },

    /// A request or tunnel was refused by the policy authority.
    RequestBlock {
        /// Request method (`CONNECT` for tunnels).
        method: String,
        /// Absolute target URL.
        url: String,
        /// Reason reported by the authority, if any.
        reason: Option<String>,
    },

    /// An open tunnel was torn down after a failed re-validation.
    TunnelRevoked {
        /// `host:port` of the tunnel.
        target: String,
    },

    /// The OS proxy switch no longer points at the session proxy.
    TamperingDetected {
        /// Human readable description of the mismatch.
        reason: String,
        /// Failing checks in the current streak.
        consecutive_failures: u32,
    },

    /// The OS proxy switch points at the session proxy again.
    ProxyRestored,

    /// Monitoring was switched off for the session.
    MonitoringStop {
        /// Whether the remote authority acknowledged the stop.
        remote_confirmed: bool,
    },
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
