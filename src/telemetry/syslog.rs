//! Syslog integration for audit logging.

#[cfg(unix)]
use std::sync::Mutex;

#[cfg(unix)]
use syslog::{Facility, Formatter3164};
use tracing::{debug, error, info};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "PROCTOR_PROXY";

#[cfg(unix)]
type SyslogWriter = Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>;

/// `tracing` target audit events are emitted under when syslog is absent.
pub const AUDIT_TARGET: &str = "audit";

enum Sink {
    #[cfg(unix)]
    Syslog(SyslogWriter),
    Tracing,
    Null,
}

/// Audit logger that writes structured JSON events to syslog.
///
/// Shared between the orchestrator and the proxy's connection tasks behind
/// an `Arc`, so writes go through a mutex. Where there is no syslog the
/// events go to `tracing` under the [`AUDIT_TARGET`] target instead.
pub struct AuditLogger {
    sink: Sink,
}

impl AuditLogger {
    /// Create a new audit logger connected to the local syslog daemon.
    #[cfg(unix)]
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter)
            .map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            sink: Sink::Syslog(Mutex::new(writer)),
        })
    }

    /// No syslog on this platform; events go to `tracing`.
    #[cfg(not(unix))]
    pub fn new() -> Result<Self, TelemetryError> {
        debug!("Syslog unavailable on {}, auditing to tracing", std::env::consts::OS);
        Ok(Self::new_tracing())
    }

    /// Create an audit logger that emits events through `tracing`.
    pub fn new_tracing() -> Self {
        Self { sink: Sink::Tracing }
    }

    /// Create a null audit logger that discards all events.
    pub fn new_null() -> Self {
        Self { sink: Sink::Null }
    }

    /// Log an audit event.
    ///
    /// The event is serialized to JSON with an ISO8601 timestamp. A null
    /// logger discards it.
    pub fn log(&self, event: AuditEvent) {
        if self.is_null() {
            return;
        }

        let json = match serde_json::to_string(&event.with_timestamp()) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        match &self.sink {
            #[cfg(unix)]
            Sink::Syslog(writer) => {
                match writer.lock() {
                    Ok(mut writer) => {
                        if let Err(e) = writer.info(&json) {
                            error!("Failed to write to syslog: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Failed to acquire syslog writer lock: {}", e);
                    }
                }
                debug!("Logged audit event: {}", json);
            }
            Sink::Tracing => info!(target: AUDIT_TARGET, "{}", json),
            Sink::Null => {}
        }
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        matches!(self.sink, Sink::Null)
    }

    fn sink_name(&self) -> &'static str {
        match self.sink {
            #[cfg(unix)]
            Sink::Syslog(_) => "syslog",
            Sink::Tracing => "tracing",
            Sink::Null => "null",
        }
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("sink", &self.sink_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_tag() {
        assert_eq!(SYSLOG_TAG, "PROCTOR_PROXY");
    }

    #[test]
    fn test_null_logger_discards() {
        let logger = AuditLogger::new_null();
        assert!(logger.is_null());

        // Should not panic
        logger.log(AuditEvent::ProxyRestored);
    }

    #[test]
    fn test_tracing_logger_is_not_null() {
        let logger = AuditLogger::new_tracing();
        assert!(!logger.is_null());
        assert_eq!(format!("{:?}", logger), "AuditLogger { sink: \"tracing\" }");

        // Should not panic without a subscriber installed
        logger.log(AuditEvent::SessionConnect { port: 8888 });
    }

    #[test]
    #[cfg(not(unix))]
    fn test_new_falls_back_to_tracing() {
        let logger = AuditLogger::new().unwrap();
        assert!(!logger.is_null());
    }

    #[test]
    #[cfg(unix)]
    #[ignore = "Requires running syslog daemon"]
    fn test_logger_creation() {
        let logger = AuditLogger::new();
        assert!(logger.is_ok());
    }
}
