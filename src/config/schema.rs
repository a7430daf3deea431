//! Configuration schema definitions.
//!
//! Every scalar is optional in the file; unset values fall back to the
//! defaults exposed by the accessor methods. Merging overrides scalars that
//! are set and appends lists.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::ConfigError;

/// Production proctoring backend.
pub const PRODUCTION_API_URL: &str = "https://backend-production-b180.up.railway.app";

/// Local backend used when `PROCTOR_ENV=development`.
pub const DEVELOPMENT_API_URL: &str = "http://127.0.0.1:8000";

/// Hosts that always bypass the system proxy.
pub const DEFAULT_BYPASS: [&str; 3] = ["localhost", "127.0.0.1", "<local>"];

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Proctoring backend settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Local forwarding proxy settings.
    #[serde(default)]
    pub proxy: ProxySection,

    /// Integrity monitor settings.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Session lifecycle settings.
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Scalars set in `other` override. Lists are appended.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.api.merge(other.api);
        self.proxy.merge(other.proxy);
        self.monitor.merge(other.monitor);
        self.session.merge(other.session);
    }
}

fn override_with<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default))
}

/// General application settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// Proctoring backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    /// Backend base URL.
    pub base_url: Option<String>,

    /// Host name reported to the backend with each validation.
    pub remote_host: Option<String>,

    /// Per-call timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl ApiConfig {
    fn merge(&mut self, other: ApiConfig) {
        override_with(&mut self.base_url, other.base_url);
        override_with(&mut self.remote_host, other.remote_host);
        override_with(&mut self.timeout_ms, other.timeout_ms);
    }

    /// Parsed backend base URL.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let raw = self.base_url.as_deref().unwrap_or(PRODUCTION_API_URL);
        Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
            field: "api.base_url".to_string(),
            message: format!("{}: {}", raw, e),
        })
    }

    /// Host name reported with each validation.
    pub fn remote_host(&self) -> &str {
        self.remote_host.as_deref().unwrap_or_default()
    }

    /// Per-call timeout.
    pub fn timeout(&self) -> Duration {
        millis(self.timeout_ms, 10_000)
    }
}

/// Local forwarding proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySection {
    /// Listen address, also written into the system proxy setting.
    pub host: Option<String>,

    /// Listen port.
    pub port: Option<u16>,

    /// Extra hosts that bypass the system proxy.
    #[serde(default)]
    pub bypass: Vec<String>,

    /// Time open connections get to finish on stop, in milliseconds.
    pub stop_grace_ms: Option<u64>,
}

impl ProxySection {
    fn merge(&mut self, other: ProxySection) {
        override_with(&mut self.host, other.host);
        override_with(&mut self.port, other.port);
        self.bypass.extend(other.bypass);
        override_with(&mut self.stop_grace_ms, other.stop_grace_ms);
    }

    /// Listen address.
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("127.0.0.1")
    }

    /// Listen port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(crate::proxy::DEFAULT_PROXY_PORT)
    }

    /// Built-in bypass hosts followed by configured ones, without duplicates.
    pub fn bypass(&self) -> Vec<String> {
        let mut hosts: Vec<String> = DEFAULT_BYPASS.iter().map(|h| h.to_string()).collect();
        for host in &self.bypass {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
        hosts
    }

    /// Stop grace period.
    pub fn stop_grace(&self) -> Duration {
        millis(self.stop_grace_ms, 2_000)
    }
}

/// Integrity monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Time between checks in milliseconds.
    pub interval_ms: Option<u64>,

    /// Consecutive failing checks before tampering is raised.
    pub failure_threshold: Option<u32>,

    /// Bound on one OS settings read in milliseconds.
    pub read_timeout_ms: Option<u64>,
}

impl MonitorConfig {
    fn merge(&mut self, other: MonitorConfig) {
        override_with(&mut self.interval_ms, other.interval_ms);
        override_with(&mut self.failure_threshold, other.failure_threshold);
        override_with(&mut self.read_timeout_ms, other.read_timeout_ms);
    }

    /// Time between checks.
    pub fn interval(&self) -> Duration {
        millis(self.interval_ms, 3_000)
    }

    /// Consecutive failing checks before tampering is raised.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold.unwrap_or(2)
    }

    /// Bound on one OS settings read.
    pub fn read_timeout(&self) -> Duration {
        millis(self.read_timeout_ms, 2_000)
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Wait between the tampering notice and stopping capture, in milliseconds.
    pub tampering_grace_ms: Option<u64>,

    /// Remote stop-monitoring attempts.
    pub stop_attempts: Option<u32>,

    /// Delay between stop-monitoring attempts in milliseconds.
    pub stop_retry_delay_ms: Option<u64>,

    /// Switch monitoring on right after connecting.
    pub start_monitoring: Option<bool>,
}

impl SessionConfig {
    fn merge(&mut self, other: SessionConfig) {
        override_with(&mut self.tampering_grace_ms, other.tampering_grace_ms);
        override_with(&mut self.stop_attempts, other.stop_attempts);
        override_with(&mut self.stop_retry_delay_ms, other.stop_retry_delay_ms);
        override_with(&mut self.start_monitoring, other.start_monitoring);
    }

    /// Wait between the tampering notice and stopping capture.
    pub fn tampering_grace(&self) -> Duration {
        millis(self.tampering_grace_ms, 2_000)
    }

    /// Remote stop-monitoring attempts, at least one.
    pub fn stop_attempts(&self) -> u32 {
        self.stop_attempts.unwrap_or(3).max(1)
    }

    /// Delay between stop-monitoring attempts.
    pub fn stop_retry_delay(&self) -> Duration {
        millis(self.stop_retry_delay_ms, 1_000)
    }

    /// Switch monitoring on right after connecting.
    pub fn start_monitoring(&self) -> bool {
        self.start_monitoring.unwrap_or(false)
    }
}
