//! Live proxy configuration and the per-request policy gate.
//!
//! [`ProxyConfig`] is read by every in-flight request and replaced wholesale
//! on update, so a handler always sees one consistent snapshot. Handlers
//! that already passed the gate are not affected by later updates.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use hyper::HeaderMap;
use tracing::{debug, info};
use url::Url;

use crate::remote::{ValidationRequest, ValidationResult, Validator};
use crate::telemetry::{AuditEvent, AuditLogger};

/// Session parameters the proxy validates traffic with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Session token sent as bearer to the authority.
    pub event_key: String,
    /// Remote host associated with the session.
    pub remote_host: String,
    /// Base URL of the authority's API.
    pub api_base_url: Url,
    /// When false, traffic is passed without asking the authority.
    pub is_monitoring: bool,
}

/// Partial update for [`ProxyConfig`]. `None` fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfigUpdate {
    /// New event key.
    pub event_key: Option<String>,
    /// New remote host.
    pub remote_host: Option<String>,
    /// New API base URL.
    pub api_base_url: Option<Url>,
    /// New monitoring flag.
    pub is_monitoring: Option<bool>,
}

impl ProxyConfigUpdate {
    /// Update that only flips the monitoring flag.
    pub fn monitoring(enabled: bool) -> Self {
        Self {
            is_monitoring: Some(enabled),
            ..Self::default()
        }
    }
}

impl ProxyConfig {
    /// Copy of this config with `update` applied.
    pub fn merged(&self, update: &ProxyConfigUpdate) -> Self {
        Self {
            event_key: update
                .event_key
                .clone()
                .unwrap_or_else(|| self.event_key.clone()),
            remote_host: update
                .remote_host
                .clone()
                .unwrap_or_else(|| self.remote_host.clone()),
            api_base_url: update
                .api_base_url
                .clone()
                .unwrap_or_else(|| self.api_base_url.clone()),
            is_monitoring: update.is_monitoring.unwrap_or(self.is_monitoring),
        }
    }
}

/// A [`ProxyConfig`] shared between the proxy owner and its connections.
///
/// Readers take an `Arc` snapshot; writers swap in a merged copy.
#[derive(Debug)]
pub struct SharedProxyConfig {
    current: RwLock<Arc<ProxyConfig>>,
}

impl SharedProxyConfig {
    /// Wrap an initial configuration.
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Current configuration.
    pub fn snapshot(&self) -> Arc<ProxyConfig> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Merge `update` into the current configuration. Later calls win.
    pub fn apply(&self, update: &ProxyConfigUpdate) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = guard.merged(update);
        *guard = Arc::new(next);
    }
}

/// Decides whether a request or tunnel may pass.
///
/// Validation only happens while the session is monitored; otherwise all
/// traffic is allowed without a remote call.
pub struct PolicyGate {
    config: Arc<SharedProxyConfig>,
    validator: Arc<dyn Validator>,
    audit: Arc<AuditLogger>,
}

impl PolicyGate {
    /// Create a gate over the shared config.
    pub fn new(
        config: Arc<SharedProxyConfig>,
        validator: Arc<dyn Validator>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            config,
            validator,
            audit,
        }
    }

    /// Check `request` against the current configuration.
    pub async fn check(&self, request: &ValidationRequest) -> ValidationResult {
        let config = self.config.snapshot();
        if !config.is_monitoring {
            return ValidationResult::allowed();
        }

        let result = self.validator.validate(&config, request).await;
        if result.blocked {
            info!(
                "Blocked {} {}: {}",
                request.method,
                request.url,
                result.reason.as_deref().unwrap_or("no reason given")
            );
            self.audit.log(AuditEvent::RequestBlock {
                method: request.method.clone(),
                url: request.url.clone(),
                reason: result.reason.clone(),
            });
        } else {
            debug!("Allowed {} {}", request.method, request.url);
        }
        result
    }
}

/// Flatten request headers for the validation body.
///
/// Names are lowercased; repeated headers are joined with `", "`.
pub fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}
