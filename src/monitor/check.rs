//! Integrity rules and failure-streak hysteresis.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::sysproxy::ProxySystemSettings;

/// Raised when the failure streak reaches the threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TamperingEvent {
    /// First failing rule of the latest check.
    pub reason: String,
    /// When the threshold was reached.
    pub timestamp: DateTime<Utc>,
    /// Failing checks in the streak.
    pub consecutive_failures: u32,
}

/// Monitor notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The OS proxy switch no longer points at the session proxy.
    TamperingDetected(TamperingEvent),
    /// A passing check ended a failure streak.
    ProxyRestored,
}

/// Describe why `settings` do not route traffic to the local proxy on
/// `expected_port`, or `None` if they do.
///
/// Rules are checked in order and the first failing one wins.
pub fn find_mismatch(settings: &ProxySystemSettings, expected_port: u16) -> Option<String> {
    if !settings.enabled {
        return Some("system proxy disabled".to_string());
    }
    if settings.port != i32::from(expected_port) {
        return Some(format!(
            "proxy port changed (expected: {}, actual: {})",
            expected_port, settings.port
        ));
    }
    if !is_loopback_server(&settings.server) {
        return Some(format!("proxy server changed (actual: {})", settings.server));
    }
    None
}

fn is_loopback_server(server: &str) -> bool {
    server.eq_ignore_ascii_case("localhost") || server == "127.0.0.1"
}

/// Counts consecutive failing checks.
///
/// Tampering is reported once, when the streak reaches the threshold.
/// Restoration is reported once, on the first passing check after any
/// failure.
#[derive(Debug, Clone)]
pub struct FailureStreak {
    consecutive_failures: u32,
    threshold: u32,
}

impl FailureStreak {
    /// Create a streak counter. A threshold of 0 is treated as 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: threshold.max(1),
        }
    }

    /// Record the outcome of one check.
    pub fn record(&mut self, mismatch: Option<String>) -> Option<MonitorEvent> {
        let Some(reason) = mismatch else {
            if self.consecutive_failures == 0 {
                return None;
            }
            info!("System proxy restored after {} failing checks", self.consecutive_failures);
            self.consecutive_failures = 0;
            return Some(MonitorEvent::ProxyRestored);
        };

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures == self.threshold {
            warn!("Proxy tampering detected: {}", reason);
            Some(MonitorEvent::TamperingDetected(TamperingEvent {
                reason,
                timestamp: Utc::now(),
                consecutive_failures: self.consecutive_failures,
            }))
        } else {
            debug!(
                "Failing proxy check ({}/{}): {}",
                self.consecutive_failures, self.threshold, reason
            );
            None
        }
    }

    /// Forget the current streak.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Failing checks in the current streak.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
