//! Wire types exchanged with the remote policy authority.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason attached to a block when the authority gives none.
pub const DEFAULT_BLOCK_REASON: &str = "Site not allowed";

/// Body of `POST /proxy/validate/`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationRequest {
    /// Request method, `CONNECT` for tunnels.
    pub method: String,
    /// Absolute target URL (`https://host:port` for tunnels).
    pub url: String,
    /// Client request headers, names lowercased.
    pub headers: BTreeMap<String, String>,
    /// When the check was issued.
    pub timestamp: DateTime<Utc>,
}

impl ValidationRequest {
    /// Build a request stamped with the current time.
    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers,
            timestamp: Utc::now(),
        }
    }

    /// Same request, re-stamped. Used for tunnel re-validation.
    pub fn restamped(&self) -> Self {
        Self {
            timestamp: Utc::now(),
            ..self.clone()
        }
    }
}

/// Decision returned for a request or tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the traffic must be refused.
    #[serde(default)]
    pub blocked: bool,
    /// Human readable reason.
    #[serde(default)]
    pub reason: Option<String>,
}

impl ValidationResult {
    /// Traffic may pass.
    pub fn allowed() -> Self {
        Self::default()
    }

    /// Traffic must be refused.
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
        }
    }
}

/// Security log entry posted to `/events/api/logging/http-request`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityLogEntry {
    /// Resource the entry is about.
    pub uri: String,
    /// Entry category.
    #[serde(rename = "type")]
    pub kind: String,
    /// Pseudo-method describing the source.
    pub method: String,
    /// When the incident happened.
    pub timestamp: DateTime<Utc>,
    /// HTTP status, 0 when not applicable.
    pub status_code: u16,
    /// Description of the incident.
    pub error: String,
}

impl SecurityLogEntry {
    /// Entry reporting that the OS proxy switch was tampered with.
    pub fn proxy_tampering(reason: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            uri: "system-proxy".to_string(),
            kind: "proxy_tampering".to_string(),
            method: "MONITOR".to_string(),
            timestamp,
            status_code: 0,
            error: reason.into(),
        }
    }
}

/// Error body the authority sends with non-success responses.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
}
